//! The release context: a scoped working clone plus driver handles.
//!
//! Each release (and each sync) gets its own clone of the manifest repo in a
//! temporary directory; the directory disappears with the context on every
//! exit path. The context also carries references to the orchestrator and
//! registry drivers. References only: ownership stays with the daemon.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::cluster::Cluster;
use crate::git::Checkout;
use crate::policy::{self, Policy};
use crate::registry::Registry;
use crate::resource::{self, Resource};
use crate::update::{
    ReleaseResult, WorkloadResult, WorkloadUpdate, LOCKED, NOT_IN_CLUSTER, NOT_IN_REPO,
};
use crate::workload::WorkloadId;

use super::ReleaseError;

/// A working clone and the drivers one release needs.
pub struct ReleaseContext<'a> {
    checkout: Checkout,
    cluster: &'a dyn Cluster,
    registry: &'a dyn Registry,
}

impl<'a> ReleaseContext<'a> {
    /// Wraps a working clone with the drivers.
    #[must_use]
    pub fn new(checkout: Checkout, cluster: &'a dyn Cluster, registry: &'a dyn Registry) -> Self {
        Self {
            checkout,
            cluster,
            registry,
        }
    }

    /// Root of the working clone.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.checkout.dir()
    }

    /// The manifest directory within the clone.
    #[must_use]
    pub fn manifest_dir(&self) -> PathBuf {
        self.checkout.manifest_dir()
    }

    /// The underlying checkout, for commit and push.
    #[must_use]
    pub fn checkout(&self) -> &Checkout {
        &self.checkout
    }

    /// The orchestrator driver.
    #[must_use]
    pub fn cluster(&self) -> &dyn Cluster {
        self.cluster
    }

    /// The registry driver.
    #[must_use]
    pub fn registry(&self) -> &dyn Registry {
        self.registry
    }

    /// Loads every manifest in the working clone.
    ///
    /// # Errors
    ///
    /// Fails when any manifest is unreadable or unparseable.
    pub fn load_manifests(&self) -> Result<BTreeMap<WorkloadId, Resource>, ReleaseError> {
        Ok(resource::load(&self.manifest_dir())?)
    }

    /// The ids of loaded workloads carrying a policy.
    ///
    /// # Errors
    ///
    /// Fails when manifests cannot be loaded.
    pub fn services_with_policy(
        &self,
        policy: &Policy,
    ) -> Result<BTreeSet<WorkloadId>, ReleaseError> {
        let manifests = self.load_manifests()?;
        Ok(policy::services_with_policy(&manifests, policy))
    }

    /// Composes the workloads declared in manifests with those running in
    /// the cluster, returning update stubs only for workloads present in
    /// both. The other partitions get their outcome written into `result`:
    /// selected-but-not-defined is `skipped(not in repository)`,
    /// defined-but-not-running is `skipped(not running in cluster)`, and
    /// locked workloads are `skipped(locked)`.
    ///
    /// # Errors
    ///
    /// Fails when manifests cannot be loaded or the cluster queried.
    pub fn select_services(
        &self,
        include: Option<&BTreeSet<WorkloadId>>,
        exclude: &BTreeSet<WorkloadId>,
        locked: &BTreeSet<WorkloadId>,
        result: &mut ReleaseResult,
    ) -> Result<Vec<WorkloadUpdate>, ReleaseError> {
        let defined = self.load_manifests()?;
        let running: BTreeSet<WorkloadId> = self
            .cluster
            .all_workloads()?
            .into_iter()
            .map(|w| w.id)
            .collect();

        let mut updates = Vec::new();
        for (id, res) in &defined {
            if !res.is_workload() {
                continue;
            }
            if let Some(include) = include {
                if !include.contains(id) {
                    continue;
                }
            }
            if exclude.contains(id) {
                debug!(workload = %id, "excluded from release");
                continue;
            }
            if locked.contains(id) {
                let reason = match res.policies.get(&Policy::LockedMsg) {
                    Some(msg) => format!("{LOCKED}: {msg}"),
                    None => LOCKED.to_string(),
                };
                result.record(id.clone(), WorkloadResult::skipped(reason));
                continue;
            }
            if !running.contains(id) {
                result.record(id.clone(), WorkloadResult::skipped(NOT_IN_CLUSTER));
                continue;
            }
            updates.push(WorkloadUpdate {
                id: id.clone(),
                resource: res.clone(),
                updates: Vec::new(),
            });
        }

        if let Some(include) = include {
            for id in include {
                if !defined.contains_key(id) && !result.contains(id) {
                    result.record(id.clone(), WorkloadResult::skipped(NOT_IN_REPO));
                }
            }
        }
        Ok(updates)
    }

    /// Writes planned container updates back into the working tree, one
    /// file at a time, rewriting only the targeted image scalars.
    ///
    /// # Errors
    ///
    /// Fails when a file cannot be read, rewritten, or written.
    pub fn write_updates(&self, updates: &[WorkloadUpdate]) -> Result<(), ReleaseError> {
        let base = self.manifest_dir();
        for update in updates {
            let path = base.join(&update.resource.source);
            let mut bytes =
                std::fs::read(&path).map_err(|e| resource::ResourceError::Io {
                    path: path.clone(),
                    source: e,
                })?;
            for cu in &update.updates {
                bytes = resource::update_image(
                    &bytes,
                    &update.resource.source,
                    &update.id,
                    &cu.container,
                    &cu.target,
                )?;
            }
            std::fs::write(&path, bytes).map_err(|e| resource::ResourceError::Io {
                path: path.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}
