//! `stevectl install`: print manifests for deploying the daemon.

use clap::Args;

use crate::client::ClientError;

#[derive(Args, Debug)]
pub struct InstallOpts {
    /// Clone URL of the manifest repository the daemon should watch.
    #[arg(long)]
    git_url: String,

    /// Branch holding the manifests.
    #[arg(long, default_value = "main")]
    git_branch: String,

    /// Subdirectory of the repo containing manifests.
    #[arg(long, default_value = "")]
    git_path: String,

    /// Namespace to install into.
    #[arg(long, default_value = "default")]
    namespace: String,
}

pub fn run(opts: &InstallOpts) -> Result<(), ClientError> {
    print!(
        r#"apiVersion: v1
kind: Secret
metadata:
  name: stevedore-git-deploy
  namespace: {namespace}
type: Opaque
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: stevedore
  namespace: {namespace}
spec:
  replicas: 1
  selector:
    matchLabels:
      name: stevedore
  template:
    metadata:
      labels:
        name: stevedore
    spec:
      volumes:
      - name: git-key
        secret:
          secretName: stevedore-git-deploy
          defaultMode: 0400
      containers:
      - name: stevedored
        image: stevedore/stevedored:latest
        args:
        - --listen=0.0.0.0:3030
        - --git-url={git_url}
        - --git-branch={git_branch}
        - --git-path={git_path}
        - --ssh-secret-dir=/etc/stevedore/ssh
        volumeMounts:
        - name: git-key
          mountPath: /etc/stevedore/ssh
          readOnly: false
        ports:
        - containerPort: 3030
---
apiVersion: v1
kind: Service
metadata:
  name: stevedore
  namespace: {namespace}
spec:
  selector:
    name: stevedore
  ports:
  - port: 3030
"#,
        namespace = opts.namespace,
        git_url = opts.git_url,
        git_branch = opts.git_branch,
        git_path = opts.git_path,
    );
    Ok(())
}
