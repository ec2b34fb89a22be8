//! Cluster synchronisation.
//!
//! Groups loaded manifest resources into stacks and hands them to the
//! orchestrator driver. Per-resource failures are logged and swallowed:
//! partial progress is fine, the next sync cycle retries. Orphan deletion is
//! a knob the reconciliation path never turns on.

use std::collections::BTreeMap;

use tracing::warn;

use crate::cluster::{Cluster, ClusterError, StackResource, SyncDef, SyncStack};
use crate::resource::Resource;
use crate::workload::WorkloadId;

/// Synchronises the cluster to the given manifest resources.
///
/// # Errors
///
/// Fails only when the driver cannot be reached; individual resource
/// failures are logged and do not abort the sync.
pub fn sync(
    resources: &BTreeMap<WorkloadId, Resource>,
    cluster: &dyn Cluster,
    delete_orphans: bool,
) -> Result<(), ClusterError> {
    let stack = make_stack("default", resources);
    let def = SyncDef {
        stacks: vec![stack],
        delete_orphans,
    };
    match cluster.sync(def) {
        Ok(()) => Ok(()),
        Err(ClusterError::Apply { errors }) => {
            for e in errors {
                warn!(workload = %e.id, reason = %e.reason, "resource failed to apply");
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn make_stack(name: &str, resources: &BTreeMap<WorkloadId, Resource>) -> SyncStack {
    SyncStack {
        name: name.to_string(),
        resources: resources
            .values()
            .map(|r| StackResource {
                id: r.id.clone(),
                bytes: r.bytes.clone(),
                source: r.source.clone(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::resource::parse_file;

    fn resources(yaml: &str) -> BTreeMap<WorkloadId, Resource> {
        parse_file("test.yaml", yaml.as_bytes())
            .unwrap()
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect()
    }

    const TWO_WORKLOADS: &str = r#"kind: Deployment
metadata:
  name: one
spec:
  template:
    spec:
      containers:
      - name: app
        image: team/one:v1
---
kind: Deployment
metadata:
  name: two
spec:
  template:
    spec:
      containers:
      - name: app
        image: team/two:v1
"#;

    #[test]
    fn applying_converges_the_cluster() {
        let cluster = InMemoryCluster::new();
        let map = resources(TWO_WORKLOADS);
        sync(&map, &cluster, false).unwrap();

        let running = cluster.all_workloads().unwrap();
        assert_eq!(running.len(), 2);
        assert_eq!(running[0].containers[0].image.to_string(), "team/one:v1");

        // idempotent: applying again changes nothing
        sync(&map, &cluster, false).unwrap();
        assert_eq!(cluster.all_workloads().unwrap().len(), 2);
    }

    #[test]
    fn per_resource_failures_do_not_abort() {
        let cluster = InMemoryCluster::new();
        cluster.fail_next_apply("default:Deployment/one".parse().unwrap());
        let map = resources(TWO_WORKLOADS);
        sync(&map, &cluster, false).unwrap();

        let running = cluster.all_workloads().unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id.name(), "two");
    }

    #[test]
    fn orphans_survive_unless_asked() {
        let cluster = InMemoryCluster::new();
        let map = resources(TWO_WORKLOADS);
        sync(&map, &cluster, false).unwrap();

        let mut smaller = map.clone();
        smaller.remove(&"default:Deployment/two".parse().unwrap());
        sync(&smaller, &cluster, false).unwrap();
        assert_eq!(cluster.all_workloads().unwrap().len(), 2);

        sync(&smaller, &cluster, true).unwrap();
        assert_eq!(cluster.all_workloads().unwrap().len(), 1);
    }
}
