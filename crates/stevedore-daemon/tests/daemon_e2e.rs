//! Daemon scenarios: user releases and automated promotion flowing through
//! the job queue, into git, and out to the cluster.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use stevedore_core::cluster::{Cluster, ClusterWorkload, InMemoryCluster};
use stevedore_core::git::{Checkout, RepoConfig};
use stevedore_core::history::EventType;
use stevedore_core::image::ImageRef;
use stevedore_core::jobs::{JobError, JobStore, METHOD_RELEASE};
use stevedore_core::registry::InMemoryRegistry;
use stevedore_core::history::EventStore;
use stevedore_core::update::{
    Cause, ImageSpec, ReleaseKind, ReleaseSpec, ReleaseStatus, ServiceSpec, UpdateSpec,
};
use stevedore_core::workload::{Container, WorkloadId};
use stevedore_daemon::daemon::Daemon;
use stevedore_daemon::worker;

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .current_dir(dir)
        .args(args)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {args:?}: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn seed_upstream(root: &Path, files: &[(&str, &str)]) -> String {
    let bare = root.join("upstream.git");
    std::fs::create_dir_all(&bare).unwrap();
    git(&bare, &["init", "--bare", "--initial-branch=main", "."]);
    let seed = root.join("seed");
    std::fs::create_dir_all(&seed).unwrap();
    git(&seed, &["init", "--initial-branch=main", "."]);
    git(&seed, &["remote", "add", "origin", &bare.to_string_lossy()]);
    for (path, contents) in files {
        std::fs::write(seed.join(path), contents).unwrap();
    }
    git(&seed, &["add", "."]);
    git(
        &seed,
        &[
            "-c",
            "user.name=Fixture",
            "-c",
            "user.email=fixture@example.com",
            "commit",
            "-m",
            "seed",
        ],
    );
    git(&seed, &["push", "origin", "main"]);
    bare.to_string_lossy().into_owned()
}

struct Harness {
    daemon: Arc<Daemon>,
    cluster: Arc<InMemoryCluster>,
    registry: Arc<InMemoryRegistry>,
    url: String,
    _sync_rx: tokio::sync::mpsc::Receiver<()>,
    _root: tempfile::TempDir,
}

fn harness(files: &[(&str, &str)]) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let url = seed_upstream(root.path(), files);
    let cluster = Arc::new(InMemoryCluster::new());
    let registry = Arc::new(InMemoryRegistry::new());
    let jobs = Arc::new(JobStore::in_memory().unwrap());
    let events = Arc::new(EventStore::in_memory().unwrap());
    let checkout = Checkout::clone_repo(RepoConfig::new(&url, "main", "")).unwrap();
    let (sync_tx, sync_rx) = tokio::sync::mpsc::channel(1);

    let daemon = Arc::new(Daemon::new(
        "inst",
        checkout,
        Arc::clone(&cluster) as Arc<dyn stevedore_core::cluster::Cluster>,
        Arc::clone(&registry) as Arc<dyn stevedore_core::registry::Registry>,
        jobs,
        events,
        None,
        sync_tx,
    ));
    Harness {
        daemon,
        cluster,
        registry,
        url,
        _sync_rx: sync_rx,
        _root: root,
    }
}

fn running(id: &str, container: &str, image: &str) -> ClusterWorkload {
    ClusterWorkload {
        id: id.parse().unwrap(),
        status: "ready".to_string(),
        containers: vec![Container {
            name: container.to_string(),
            image: ImageRef::parse(image).unwrap(),
        }],
    }
}

const HELLO: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: hello
  namespace: default
spec:
  template:
    spec:
      containers:
      - name: hello
        image: team/hello:v1
"#;

const AUTOMATED_HELLO: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: hello
  namespace: default
  annotations:
    stevedore.io/automated: "true"
    stevedore.io/tag.hello: "1.*"
spec:
  template:
    spec:
      containers:
      - name: hello
        image: team/hello:1.2
"#;

const AUTOMATED_AND_LOCKED: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: hello
  namespace: default
  annotations:
    stevedore.io/automated: "true"
    stevedore.io/locked: "true"
spec:
  template:
    spec:
      containers:
      - name: hello
        image: team/hello:1.2
"#;

fn hello_id() -> WorkloadId {
    "default/hello".parse().unwrap()
}

fn exact_release(image: &str) -> UpdateSpec {
    UpdateSpec::Images(ReleaseSpec {
        services: ServiceSpec::Ids(vec![hello_id()]),
        image: ImageSpec::Exact(ImageRef::parse(image).unwrap()),
        kind: ReleaseKind::Execute,
        excludes: Vec::new(),
    })
}

#[test]
fn happy_release_flows_from_queue_to_cluster() {
    let h = harness(&[("hello.yaml", HELLO)]);
    h.cluster.seed(running("default/hello", "hello", "team/hello:v1"));
    h.registry.add_image("team/hello", "v2", None);

    let id = h
        .daemon
        .update_manifests(
            exact_release("team/hello:v2"),
            Cause {
                user: "alice".to_string(),
                message: "ship v2".to_string(),
            },
        )
        .unwrap();

    let job = h.daemon.jobs.next_job(&[METHOD_RELEASE]).unwrap();
    assert_eq!(job.id, id);
    assert!(worker::handle_job(&h.daemon, job));

    let finished = h.daemon.release_status(id).unwrap();
    assert!(finished.done && finished.success);
    assert!(finished.log.iter().any(|l| l.contains("team/hello:v1 -> team/hello:v2")));

    // the commit landed upstream, changing only the image line
    let fresh = Checkout::clone_repo(RepoConfig::new(&h.url, "main", "")).unwrap();
    let written = std::fs::read_to_string(fresh.dir().join("hello.yaml")).unwrap();
    assert_eq!(written, HELLO.replace("team/hello:v1", "team/hello:v2"));

    // provenance note names the job
    let head = fresh.head_revision().unwrap();
    let note = fresh.note(&head).unwrap().expect("release note");
    assert!(note.contains(&id.to_string()));

    // the sync observes the new revision, applies it, and advances the tag
    h.daemon.pull_and_sync();
    let workloads = h.cluster.all_workloads().unwrap();
    assert_eq!(workloads[0].containers[0].image.to_string(), "team/hello:v2");

    let after_sync = Checkout::clone_repo(RepoConfig::new(&h.url, "main", "")).unwrap();
    assert_eq!(after_sync.rev_parse("stevedore-sync").unwrap(), head);

    let events = h.daemon.events.all_events("inst", 10).unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::Sync));
    assert!(events.iter().any(|e| e.event_type == EventType::Release));

    // the release event carries the per-workload outcome
    let release_event = events
        .iter()
        .find(|e| e.event_type == EventType::Release)
        .unwrap();
    match &release_event.metadata {
        stevedore_core::history::EventMetadata::Release { result, .. } => {
            assert_eq!(
                result.get(&hello_id()).unwrap().status,
                ReleaseStatus::Success
            );
        }
        other => panic!("unexpected metadata {other:?}"),
    }
}

#[test]
fn automated_promotion_queues_and_releases() {
    let h = harness(&[("hello.yaml", AUTOMATED_HELLO)]);
    h.cluster.seed(running("default/hello", "hello", "team/hello:1.2"));
    let day = |d| Some(Utc.with_ymd_and_hms(2024, 6, d, 0, 0, 0).unwrap());
    h.registry.add_image("team/hello", "latest", day(9));
    h.registry.add_image("team/hello", "1.3", day(3));
    h.registry.add_image("team/hello", "1.2", day(2));

    // poll tick queues the scan; the scan discovers and queues the release
    h.daemon.check_automation();
    let scan = h.daemon.jobs.next_job(&[]).unwrap();
    assert_eq!(scan.method, "automated-instance");
    assert!(worker::handle_job(&h.daemon, scan));

    let release_job = h.daemon.jobs.next_job(&[METHOD_RELEASE]).unwrap();
    assert_eq!(release_job.key, "release|inst|team/hello:1.3|automated");
    assert!(worker::handle_job(&h.daemon, release_job));

    let fresh = Checkout::clone_repo(RepoConfig::new(&h.url, "main", "")).unwrap();
    let written = std::fs::read_to_string(fresh.dir().join("hello.yaml")).unwrap();
    assert!(written.contains("image: team/hello:1.3"));
    // the annotation block is untouched
    assert!(written.contains("stevedore.io/tag.hello: \"1.*\""));
}

#[test]
fn dedup_collapses_identical_pending_releases() {
    let h = harness(&[("hello.yaml", HELLO)]);
    h.cluster.seed(running("default/hello", "hello", "team/hello:v1"));
    h.registry.add_image("team/hello", "v2", None);

    let spec = exact_release("team/hello:v2");
    h.daemon
        .update_manifests(spec.clone(), Cause::default())
        .unwrap();
    for _ in 0..2 {
        let err = h
            .daemon
            .update_manifests(spec.clone(), Cause::default())
            .unwrap_err();
        assert!(matches!(
            err,
            stevedore_daemon::DaemonError::Jobs(JobError::AlreadyQueued { .. })
        ));
    }
}

#[test]
fn locked_beats_automated_everywhere() {
    let h = harness(&[("hello.yaml", AUTOMATED_AND_LOCKED)]);
    h.cluster.seed(running("default/hello", "hello", "team/hello:1.2"));
    h.registry
        .add_image("team/hello", "1.3", Some(Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap()));

    // the poller ignores it entirely
    let discovered = h.daemon.discover_image_updates().unwrap();
    assert!(discovered.is_empty());

    // a user release is skipped(locked)
    let id = h
        .daemon
        .update_manifests(exact_release("team/hello:1.3"), Cause::default())
        .unwrap();
    let job = h.daemon.jobs.next_job(&[METHOD_RELEASE]).unwrap();
    assert!(worker::handle_job(&h.daemon, job));
    let finished = h.daemon.release_status(id).unwrap();
    assert!(finished.success);
    assert!(finished.log.iter().any(|l| l.contains("locked")));

    // nothing was committed
    let fresh = Checkout::clone_repo(RepoConfig::new(&h.url, "main", "")).unwrap();
    let written = std::fs::read_to_string(fresh.dir().join("hello.yaml")).unwrap();
    assert!(written.contains("team/hello:1.2"));
}

#[test]
fn policy_updates_rewrite_annotations_and_log_events() {
    let h = harness(&[("hello.yaml", HELLO)]);
    h.cluster.seed(running("default/hello", "hello", "team/hello:v1"));

    let mut updates = std::collections::BTreeMap::new();
    updates.insert(
        hello_id(),
        stevedore_core::policy::Update {
            add: stevedore_core::policy::Set::new()
                .add(stevedore_core::policy::Policy::Automated),
            remove: Default::default(),
        },
    );
    let id = h
        .daemon
        .update_manifests(UpdateSpec::Policies(updates), Cause::default())
        .unwrap();
    let job = h.daemon.jobs.next_job(&[]).unwrap();
    assert!(worker::handle_job(&h.daemon, job));
    assert!(h.daemon.release_status(id).unwrap().success);

    let fresh = Checkout::clone_repo(RepoConfig::new(&h.url, "main", "")).unwrap();
    let written = std::fs::read_to_string(fresh.dir().join("hello.yaml")).unwrap();
    assert!(written.contains("stevedore.io/automated: \"true\""));

    let events = h.daemon.events.all_events("inst", 10).unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::Automate));
}

#[test]
fn sync_requests_coalesce() {
    let h = harness(&[("hello.yaml", HELLO)]);
    h.daemon.ask_for_sync();
    h.daemon.ask_for_sync();
    h.daemon.ask_for_sync();

    let mut rx = h._sync_rx;
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());
}
