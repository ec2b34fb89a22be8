//! The automator.
//!
//! Orchestrates recurring automated releases through the job queue. The
//! image-poll tick enqueues one `automated-instance` job per instance
//! (deduplicated, so ticks while one is pending are free); the job's
//! handler runs discovery, emits one release job per discovered image, and
//! always schedules its own successor one cycle out, so automation keeps
//! running even if the ticker stalls.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use tracing::{debug, info};

use stevedore_core::image::ImageRef;
use stevedore_core::jobs::{
    AutomatedInstanceParams, JobError, JobParams, NewJob, ReleaseJobParams,
    METHOD_AUTOMATED_INSTANCE, METHOD_RELEASE, PRIORITY_BACKGROUND,
};
use stevedore_core::update::{AutomatedChange, Cause, UpdateSpec};

use crate::daemon::{release_job_key, Daemon, DaemonError};

/// Seconds between automated discovery cycles.
pub const AUTOMATION_CYCLE_SECS: i64 = 60;

/// The recurring scan job for an instance, scheduled `delay` from now.
#[must_use]
pub fn automated_instance_job(instance: &str, delay: Duration) -> NewJob {
    NewJob {
        queue: METHOD_AUTOMATED_INSTANCE.to_string(),
        key: format!("{METHOD_AUTOMATED_INSTANCE}|{instance}"),
        priority: PRIORITY_BACKGROUND,
        scheduled_at: Some(Utc::now() + delay),
        params: JobParams::AutomatedInstance(AutomatedInstanceParams {
            instance: instance.to_string(),
        }),
    }
}

impl Daemon {
    /// The image-poll tick: make sure an automated-instance job is queued
    /// if anything here is automated. An already-queued job is success.
    pub fn check_automation(&self) {
        let has_automated = {
            let checkout = self.checkout.lock().expect("checkout lock");
            stevedore_core::resource::load(&checkout.manifest_dir()).map(|manifests| {
                !stevedore_core::policy::services_with_policy(
                    &manifests,
                    &stevedore_core::policy::Policy::Automated,
                )
                .is_empty()
            })
        };
        match has_automated {
            Ok(false) => debug!("no automated workloads, not scheduling a scan"),
            Ok(true) => {
                match self.jobs.put_job(
                    &self.instance,
                    automated_instance_job(&self.instance, Duration::zero()),
                ) {
                    Ok(id) => debug!(job = %id, "queued automated-instance scan"),
                    Err(JobError::AlreadyQueued { .. }) => {}
                    Err(e) => tracing::error!(error = %e, "queueing automated-instance job"),
                }
            }
            Err(e) => tracing::error!(error = %e, "loading manifests for automation check"),
        }
    }

    /// Handles one automated-instance job: run discovery, turn the changes
    /// into per-image release jobs, and schedule the successor scan.
    ///
    /// # Errors
    ///
    /// Fails when discovery fails; the successor is still among the
    /// follow-ups so the cycle survives.
    pub fn handle_automated_instance(
        &self,
        log: &mut Vec<String>,
    ) -> (Vec<NewJob>, Result<(), DaemonError>) {
        let mut follow_ups = vec![automated_instance_job(
            &self.instance,
            Duration::seconds(AUTOMATION_CYCLE_SECS),
        )];

        let changes = match self.discover_image_updates() {
            Ok(changes) => changes,
            Err(e) => return (follow_ups, Err(e)),
        };
        if changes.is_empty() {
            log.push("No image updates discovered.".to_string());
            return (follow_ups, Ok(()));
        }

        // One release job per target image. The key collapses duplicate
        // discoveries while a release for that image is still pending, so a
        // slow release never piles up a horde of successors.
        let mut by_image: BTreeMap<ImageRef, Vec<AutomatedChange>> = BTreeMap::new();
        for change in changes.changes() {
            by_image
                .entry(change.image.clone())
                .or_default()
                .push(change.clone());
        }
        for (image, group) in by_image {
            let spec = UpdateSpec::Automated(group);
            log.push(format!("Discovered newer image {image}."));
            info!(%image, "queueing automated release");
            follow_ups.push(NewJob {
                queue: METHOD_RELEASE.to_string(),
                key: release_job_key(&self.instance, &spec),
                priority: PRIORITY_BACKGROUND,
                scheduled_at: None,
                params: JobParams::Release(ReleaseJobParams {
                    spec,
                    cause: Cause::default(),
                }),
            });
        }
        (follow_ups, Ok(()))
    }
}
