//! Orchestrator driver seam.
//!
//! The control loop talks to the cluster through the [`Cluster`] trait:
//! querying running workloads and submitting manifest stacks to apply. The
//! driver must be idempotent (applying the same manifest twice is a no-op,
//! applying a modified manifest converges the cluster) and concurrency-safe.
//! [`InMemoryCluster`] is a scriptable driver used by tests and local runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use thiserror::Error;

use crate::resource;
use crate::workload::{Container, WorkloadId};

/// A workload as the orchestrator reports it.
#[derive(Debug, Clone)]
pub struct ClusterWorkload {
    /// The workload identity.
    pub id: WorkloadId,
    /// Orchestrator status string, for display.
    pub status: String,
    /// The ordered containers the workload is running.
    pub containers: Vec<Container>,
}

/// One resource within a sync stack.
#[derive(Debug, Clone)]
pub struct StackResource {
    /// The workload identity, for error correlation.
    pub id: WorkloadId,
    /// The manifest bytes to apply.
    pub bytes: Vec<u8>,
    /// The file the manifest came from, for logging.
    pub source: String,
}

/// A named group of resources applied together.
#[derive(Debug, Clone)]
pub struct SyncStack {
    /// Stack name.
    pub name: String,
    /// The resources in the stack.
    pub resources: Vec<StackResource>,
}

/// Everything one sync submits to the driver.
#[derive(Debug, Clone)]
pub struct SyncDef {
    /// The stacks to apply.
    pub stacks: Vec<SyncStack>,
    /// Whether resources absent from the stacks should be deleted.
    pub delete_orphans: bool,
}

/// A per-resource apply failure. These are logged, not fatal: partial
/// progress is acceptable and the next cycle retries.
#[derive(Debug, Clone)]
pub struct ResourceApplyError {
    /// The resource that failed.
    pub id: WorkloadId,
    /// Why it failed.
    pub reason: String,
}

/// Errors from the orchestrator driver.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClusterError {
    /// The orchestrator could not be reached at all.
    #[error("cluster unavailable: {reason}")]
    Unavailable {
        /// Why the cluster is unreachable.
        reason: String,
    },

    /// A query failed.
    #[error("cluster query failed: {reason}")]
    Query {
        /// Why the query failed.
        reason: String,
    },

    /// Some resources failed to apply; the rest made it.
    #[error("{} resource(s) failed to apply", errors.len())]
    Apply {
        /// The failures, one per resource.
        errors: Vec<ResourceApplyError>,
    },
}

/// The orchestrator driver.
pub trait Cluster: Send + Sync {
    /// Every workload running in the cluster.
    ///
    /// # Errors
    ///
    /// Fails when the orchestrator cannot be queried.
    fn all_workloads(&self) -> Result<Vec<ClusterWorkload>, ClusterError>;

    /// The subset of `ids` currently running, in `ids` order.
    ///
    /// # Errors
    ///
    /// Fails when the orchestrator cannot be queried.
    fn some_workloads(&self, ids: &[WorkloadId]) -> Result<Vec<ClusterWorkload>, ClusterError>;

    /// Applies a sync definition.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Apply`] carrying per-resource failures;
    /// resources not listed there were applied.
    fn sync(&self, def: SyncDef) -> Result<(), ClusterError>;
}

/// An in-memory driver: applied workload manifests become running
/// workloads. Tests script failures per workload id.
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<BTreeMap<WorkloadId, ClusterWorkload>>,
    fail_apply: Mutex<BTreeSet<WorkloadId>>,
    applies: Mutex<usize>,
}

impl InMemoryCluster {
    /// An empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a workload as already running.
    pub fn seed(&self, workload: ClusterWorkload) {
        self.state
            .lock()
            .expect("cluster state lock")
            .insert(workload.id.clone(), workload);
    }

    /// Makes every subsequent apply of `id` fail.
    pub fn fail_next_apply(&self, id: WorkloadId) {
        self.fail_apply
            .lock()
            .expect("cluster fail lock")
            .insert(id);
    }

    /// How many sync submissions the driver has seen.
    #[must_use]
    pub fn apply_count(&self) -> usize {
        *self.applies.lock().expect("cluster applies lock")
    }
}

impl Cluster for InMemoryCluster {
    fn all_workloads(&self) -> Result<Vec<ClusterWorkload>, ClusterError> {
        Ok(self
            .state
            .lock()
            .expect("cluster state lock")
            .values()
            .cloned()
            .collect())
    }

    fn some_workloads(&self, ids: &[WorkloadId]) -> Result<Vec<ClusterWorkload>, ClusterError> {
        let state = self.state.lock().expect("cluster state lock");
        Ok(ids.iter().filter_map(|id| state.get(id).cloned()).collect())
    }

    fn sync(&self, def: SyncDef) -> Result<(), ClusterError> {
        *self.applies.lock().expect("cluster applies lock") += 1;
        let mut state = self.state.lock().expect("cluster state lock");
        let fail = self.fail_apply.lock().expect("cluster fail lock");

        let mut errors = Vec::new();
        let mut seen = BTreeSet::new();
        for stack in &def.stacks {
            for res in &stack.resources {
                if fail.contains(&res.id) {
                    errors.push(ResourceApplyError {
                        id: res.id.clone(),
                        reason: "scripted apply failure".to_string(),
                    });
                    continue;
                }
                seen.insert(res.id.clone());
                let containers = resource::parse_file(&res.source, &res.bytes)
                    .ok()
                    .and_then(|rs| {
                        rs.into_iter()
                            .find(|r| r.id == res.id)
                            .and_then(|r| r.containers().map(<[Container]>::to_vec))
                    })
                    .unwrap_or_default();
                state.insert(
                    res.id.clone(),
                    ClusterWorkload {
                        id: res.id.clone(),
                        status: "ready".to_string(),
                        containers,
                    },
                );
            }
        }
        if def.delete_orphans {
            state.retain(|id, _| seen.contains(id));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ClusterError::Apply { errors })
        }
    }
}
