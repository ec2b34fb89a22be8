//! Automated image discovery.
//!
//! Turns "policy + registry + cluster" into concrete changes: for every
//! workload that is `automated` and not `locked`, compare each container's
//! running image against the newest registry image matching its tag policy.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use stevedore_core::policy::Policy;
use stevedore_core::release::images::collect_images;
use stevedore_core::release::Automated;
use stevedore_core::resource;
use stevedore_core::workload::WorkloadId;

use crate::daemon::{Daemon, DaemonError};

impl Daemon {
    /// Scans for newer images across automated, unlocked workloads.
    ///
    /// # Errors
    ///
    /// Fails when manifests, the cluster, or the registry cannot be read; a
    /// failed scan discovers nothing and the next tick tries again.
    pub fn discover_image_updates(&self) -> Result<Automated, DaemonError> {
        let manifests = {
            let checkout = self.checkout.lock().expect("checkout lock");
            resource::load(&checkout.manifest_dir())?
        };
        let automated =
            stevedore_core::policy::services_with_policy(&manifests, &Policy::Automated);
        let locked = stevedore_core::policy::services_with_policy(&manifests, &Policy::Locked);
        let candidates: BTreeSet<WorkloadId> =
            automated.difference(&locked).cloned().collect();

        let mut changes = Automated::new();
        if candidates.is_empty() {
            debug!("no automated workloads");
            return Ok(changes);
        }

        let ids: Vec<WorkloadId> = candidates.iter().cloned().collect();
        let running = self.cluster.some_workloads(&ids)?;
        let images = collect_images(
            self.registry.as_ref(),
            running.iter().flat_map(|w| w.containers.iter()),
        )?;

        for workload in &running {
            let Some(policies) = manifests.get(&workload.id).map(|r| &r.policies) else {
                continue;
            };
            for container in &workload.containers {
                let pattern = policies.tag_pattern(&container.name);
                let repo = container.image.repository();
                match images.latest_image(&repo, pattern) {
                    Some(latest) if latest.id != container.image => {
                        debug!(workload = %workload.id, container = %container.name,
                               current = %container.image, latest = %latest.id,
                               "found newer image");
                        changes.add(workload.id.clone(), &container.name, latest.id.clone());
                    }
                    Some(_) => {}
                    None => {
                        warn!(workload = %workload.id, container = %container.name,
                              repo, pattern, "no releasable image matches");
                    }
                }
            }
        }
        Ok(changes)
    }
}
