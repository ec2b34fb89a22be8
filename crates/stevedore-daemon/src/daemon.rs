//! Shared daemon state and the server-facing operations.
//!
//! One `Daemon` value owns the process-wide handles (git checkout, cluster
//! and registry drivers, job and event stores) and is passed around
//! explicitly behind an `Arc`. Everything the HTTP API exposes is a method
//! here; the sync loop, poller, and worker live in their own modules but
//! operate on the same state.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;

use stevedore_core::api::{ContainerImages, ImageStatus, ServiceStatus};
use stevedore_core::cluster::{Cluster, ClusterError};
use stevedore_core::git::{Checkout, GitError};
use stevedore_core::history::{EventStore, HistoryError};
use stevedore_core::jobs::{
    JobError, JobId, JobParams, JobStore, NewJob, ReleaseJobParams, METHOD_RELEASE,
    PRIORITY_INTERACTIVE,
};
use stevedore_core::notify::Notifier;
use stevedore_core::policy::Policy;
use stevedore_core::registry::{Registry, RegistryError};
use stevedore_core::release::images::collect_images;
use stevedore_core::release::ReleaseError;
use stevedore_core::resource::{self, ResourceError};
use stevedore_core::update::{Cause, ImageSpec, ServiceSpec, UpdateSpec};
use stevedore_core::workload::WorkloadId;

/// Errors surfaced by daemon operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DaemonError {
    /// The request was bad; the caller should fix it, not retry.
    #[error("{0}")]
    User(String),

    /// Job queue trouble.
    #[error(transparent)]
    Jobs(#[from] JobError),

    /// Git trouble.
    #[error(transparent)]
    Git(#[from] GitError),

    /// Cluster trouble.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Registry trouble.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Manifest trouble.
    #[error(transparent)]
    Manifests(#[from] ResourceError),

    /// Event log trouble.
    #[error(transparent)]
    History(#[from] HistoryError),

    /// Release engine trouble.
    #[error(transparent)]
    Release(#[from] ReleaseError),
}

impl DaemonError {
    /// Whether the caller caused this (4xx) rather than the daemon (5xx).
    #[must_use]
    pub fn is_user(&self) -> bool {
        matches!(
            self,
            Self::User(_)
                | Self::Jobs(JobError::AlreadyQueued { .. } | JobError::NoSuchJob { .. })
        )
    }
}

/// The daemon's shared state.
pub struct Daemon {
    /// Instance identity, the namespace for jobs and events.
    pub instance: String,
    /// Whether syncs delete resources missing from the repo. Off by
    /// default and not turned on anywhere in the reconciliation path.
    pub delete_orphans: bool,
    /// The long-lived checkout of the manifest repo.
    pub checkout: Mutex<Checkout>,
    /// Orchestrator driver.
    pub cluster: Arc<dyn Cluster>,
    /// Registry driver.
    pub registry: Arc<dyn Registry>,
    /// The job queue.
    pub jobs: Arc<JobStore>,
    /// The event log.
    pub events: Arc<EventStore>,
    /// Optional release announcer.
    pub notifier: Option<Arc<dyn Notifier>>,
    sync_soon: mpsc::Sender<()>,
}

impl Daemon {
    /// Assembles the daemon state. `sync_soon` must be the sender half of a
    /// depth-1 channel whose receiver the sync loop owns.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance: impl Into<String>,
        checkout: Checkout,
        cluster: Arc<dyn Cluster>,
        registry: Arc<dyn Registry>,
        jobs: Arc<JobStore>,
        events: Arc<EventStore>,
        notifier: Option<Arc<dyn Notifier>>,
        sync_soon: mpsc::Sender<()>,
    ) -> Self {
        Self {
            instance: instance.into(),
            delete_orphans: false,
            checkout: Mutex::new(checkout),
            cluster,
            registry,
            jobs,
            events,
            notifier,
            sync_soon,
        }
    }

    /// Asks for a sync, coalescing with any sync already pending. The
    /// channel has depth one; extra asks drop on the floor, which is the
    /// point.
    pub fn ask_for_sync(&self) {
        let _ = self.sync_soon.try_send(());
    }

    /// Lists every workload running in the cluster, annotated with what the
    /// manifests say about it.
    ///
    /// # Errors
    ///
    /// Fails when the cluster or the manifests cannot be read.
    pub fn list_services(&self) -> Result<Vec<ServiceStatus>, DaemonError> {
        let manifests = {
            let checkout = self.checkout.lock().expect("checkout lock");
            resource::load(&checkout.manifest_dir())?
        };
        let workloads = self.cluster.all_workloads()?;

        Ok(workloads
            .into_iter()
            .map(|w| {
                let policies = manifests.get(&w.id).map(|r| r.policies.clone());
                let automated = policies
                    .as_ref()
                    .is_some_and(|p| p.contains(&Policy::Automated));
                let locked = policies
                    .as_ref()
                    .is_some_and(|p| p.contains(&Policy::Locked));
                ServiceStatus {
                    id: w.id,
                    status: w.status,
                    containers: w.containers,
                    automated: automated && !locked,
                    locked,
                    policies: policies
                        .map(|p| p.iter().map(|(k, v)| format!("{k}={v}")).collect())
                        .unwrap_or_default(),
                }
            })
            .collect())
    }

    /// Lists the images available for one workload, or all of them.
    ///
    /// # Errors
    ///
    /// Fails when the cluster or the registry cannot be queried.
    pub fn list_images(
        &self,
        service: Option<&WorkloadId>,
    ) -> Result<Vec<ImageStatus>, DaemonError> {
        let workloads = match service {
            Some(id) => self.cluster.some_workloads(std::slice::from_ref(id))?,
            None => self.cluster.all_workloads()?,
        };
        let map = collect_images(
            self.registry.as_ref(),
            workloads.iter().flat_map(|w| w.containers.iter()),
        )?;

        Ok(workloads
            .into_iter()
            .map(|w| ImageStatus {
                containers: w
                    .containers
                    .iter()
                    .map(|c| ContainerImages {
                        name: c.name.clone(),
                        current: c.image.clone(),
                        available: map.get(&c.image.repository()).to_vec(),
                    })
                    .collect(),
                id: w.id,
            })
            .collect())
    }

    /// Submits a release (or policy change) through the job queue and
    /// returns the job id for `check-release` polling.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::AlreadyQueued`] (wrapped) when an identical
    /// request is still pending.
    pub fn update_manifests(&self, spec: UpdateSpec, cause: Cause) -> Result<JobId, DaemonError> {
        if let UpdateSpec::Images(release) = &spec {
            if let ServiceSpec::Ids(ids) = &release.services {
                if ids.is_empty() {
                    return Err(DaemonError::User(
                        "release spec selects no workloads".to_string(),
                    ));
                }
            }
        }
        let key = release_job_key(&self.instance, &spec);
        let id = self.jobs.put_job(
            &self.instance,
            NewJob {
                queue: METHOD_RELEASE.to_string(),
                key,
                priority: PRIORITY_INTERACTIVE,
                scheduled_at: None,
                params: JobParams::Release(ReleaseJobParams { spec, cause }),
            },
        )?;
        Ok(id)
    }

    /// Reads a job for status polling.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NoSuchJob`] (wrapped) for unknown ids.
    pub fn release_status(&self, id: JobId) -> Result<stevedore_core::jobs::Job, DaemonError> {
        Ok(self.jobs.get_job(&self.instance, id)?)
    }
}

/// The deduplication key for a release request: one pending job per
/// (instance, workload-set, image) lineage.
#[must_use]
pub fn release_job_key(instance: &str, spec: &UpdateSpec) -> String {
    match spec {
        UpdateSpec::Images(release) => {
            let services = match &release.services {
                ServiceSpec::All => "<all>".to_string(),
                ServiceSpec::Ids(ids) => {
                    let mut ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
                    ids.sort();
                    ids.join(",")
                }
            };
            let image = match &release.image {
                ImageSpec::Latest => "<latest>".to_string(),
                ImageSpec::Exact(image) => image.to_string(),
            };
            format!("{METHOD_RELEASE}|{instance}|{image}|{services}")
        }
        UpdateSpec::Automated(changes) => {
            let mut images: Vec<String> =
                changes.iter().map(|c| c.image.to_string()).collect();
            images.sort();
            images.dedup();
            format!("{METHOD_RELEASE}|{instance}|{}|automated", images.join(","))
        }
        UpdateSpec::Policies(updates) => {
            let mut ids: Vec<String> = updates.keys().map(ToString::to_string).collect();
            ids.sort();
            format!("policy|{instance}|{}", ids.join(","))
        }
    }
}
