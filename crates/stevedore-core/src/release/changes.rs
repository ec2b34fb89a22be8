//! Change-set strategies.
//!
//! A `Changes` value turns a release request into per-container updates.
//! Two strategies drive the planner: [`Automated`], fed by the image
//! poller's discoveries, and [`ImageRelease`], built from a user's release
//! spec. [`Changeset`] is the tagged sum the daemon dispatches on.

use std::collections::BTreeSet;

use tracing::debug;

use crate::image::ImageRef;
use crate::policy::Policy;
use crate::update::{
    AutomatedChange, ContainerUpdate, ImageSpec, ReleaseKind, ReleaseResult, ReleaseSpec,
    ServiceSpec, UpdateSpec, WorkloadResult, WorkloadUpdate, DOES_NOT_USE_IMAGE,
    IMAGE_UP_TO_DATE,
};
use crate::workload::WorkloadId;

use super::images::{collect_images, exact_images};
use super::{ReleaseContext, ReleaseError};

/// A strategy that computes a release's container updates.
pub trait Changes {
    /// Computes the updates, recording per-workload outcomes in `result`.
    ///
    /// # Errors
    ///
    /// Fails on fatal conditions only; per-workload problems are recorded
    /// in `result` instead.
    fn calculate_release(
        &self,
        rc: &ReleaseContext<'_>,
        result: &mut ReleaseResult,
    ) -> Result<Vec<WorkloadUpdate>, ReleaseError>;

    /// Whether this release plans or executes.
    fn release_kind(&self) -> ReleaseKind;

    /// The commit message to use if the updates are written.
    fn commit_message(&self, result: &ReleaseResult) -> String;
}

/// Changes discovered by the image poller: concrete `(workload, container,
/// image)` triples, already filtered against tag policies.
#[derive(Debug, Clone, Default)]
pub struct Automated {
    changes: Vec<AutomatedChange>,
}

impl Automated {
    /// An empty change list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one discovered change.
    pub fn add(&mut self, workload: WorkloadId, container: impl Into<String>, image: ImageRef) {
        self.changes.push(AutomatedChange {
            workload,
            container: container.into(),
            image,
        });
    }

    /// Whether anything was discovered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// The discovered changes.
    #[must_use]
    pub fn changes(&self) -> &[AutomatedChange] {
        &self.changes
    }

    fn workload_ids(&self) -> BTreeSet<WorkloadId> {
        self.changes.iter().map(|c| c.workload.clone()).collect()
    }
}

impl From<Vec<AutomatedChange>> for Automated {
    fn from(changes: Vec<AutomatedChange>) -> Self {
        Self { changes }
    }
}

impl Changes for Automated {
    fn calculate_release(
        &self,
        rc: &ReleaseContext<'_>,
        result: &mut ReleaseResult,
    ) -> Result<Vec<WorkloadUpdate>, ReleaseError> {
        let locked = rc.services_with_policy(&Policy::Locked)?;
        let include = self.workload_ids();
        let candidates = rc.select_services(Some(&include), &BTreeSet::new(), &locked, result)?;

        let mut updates = Vec::new();
        for mut candidate in candidates {
            let Some(containers) = candidate.resource.containers() else {
                result.record(
                    candidate.id.clone(),
                    WorkloadResult::failed("workload has no containers"),
                );
                continue;
            };

            let mut container_updates = Vec::new();
            for container in containers {
                for change in &self.changes {
                    if change.workload != candidate.id || change.container != container.name {
                        continue;
                    }
                    container_updates.push(ContainerUpdate {
                        container: container.name.clone(),
                        current: container.image.clone(),
                        target: change.image.clone(),
                    });
                }
            }

            if container_updates.is_empty() {
                result.record(
                    candidate.id.clone(),
                    WorkloadResult::ignored(DOES_NOT_USE_IMAGE),
                );
                continue;
            }
            result.record(
                candidate.id.clone(),
                WorkloadResult::success(container_updates.clone()),
            );
            candidate.updates = container_updates;
            updates.push(candidate);
        }
        Ok(updates)
    }

    fn release_kind(&self) -> ReleaseKind {
        ReleaseKind::Execute
    }

    fn commit_message(&self, result: &ReleaseResult) -> String {
        let images: Vec<String> = result.image_ids().iter().map(ToString::to_string).collect();
        if images.is_empty() {
            "Automated release".to_string()
        } else {
            format!("Automated release of {}", images.join(", "))
        }
    }
}

/// A user-initiated release from a [`ReleaseSpec`].
#[derive(Debug, Clone)]
pub struct ImageRelease {
    /// The request.
    pub spec: ReleaseSpec,
}

impl ImageRelease {
    /// Wraps a release spec.
    #[must_use]
    pub fn new(spec: ReleaseSpec) -> Self {
        Self { spec }
    }

    /// The target image for one container, per the image spec: an exact
    /// image applies to containers already in its repository; `latest`
    /// resolves through the image map under the container's tag policy.
    fn target_for(
        &self,
        images: &super::ImageMap,
        candidate: &WorkloadUpdate,
        container: &crate::workload::Container,
    ) -> Option<ImageRef> {
        match &self.spec.image {
            ImageSpec::Exact(image) => image
                .same_repository(&container.image)
                .then(|| image.clone()),
            ImageSpec::Latest => {
                let pattern = candidate.resource.policies.tag_pattern(&container.name);
                images
                    .latest_image(&container.image.repository(), pattern)
                    .map(|d| d.id.clone())
            }
        }
    }
}

impl Changes for ImageRelease {
    fn calculate_release(
        &self,
        rc: &ReleaseContext<'_>,
        result: &mut ReleaseResult,
    ) -> Result<Vec<WorkloadUpdate>, ReleaseError> {
        let locked = rc.services_with_policy(&Policy::Locked)?;
        let include: Option<BTreeSet<WorkloadId>> = match &self.spec.services {
            ServiceSpec::All => None,
            ServiceSpec::Ids(ids) => Some(ids.iter().cloned().collect()),
        };
        let excludes: BTreeSet<WorkloadId> = self.spec.excludes.iter().cloned().collect();
        let candidates = rc.select_services(include.as_ref(), &excludes, &locked, result)?;

        let images = match &self.spec.image {
            ImageSpec::Exact(image) => exact_images(rc.registry(), &[image.clone()])?,
            ImageSpec::Latest => {
                let containers = candidates
                    .iter()
                    .flat_map(|c| c.resource.containers().unwrap_or(&[]));
                collect_images(rc.registry(), containers)?
            }
        };

        let mut updates = Vec::new();
        for mut candidate in candidates {
            let Some(containers) = candidate.resource.containers() else {
                result.record(
                    candidate.id.clone(),
                    WorkloadResult::failed("workload has no containers"),
                );
                continue;
            };

            let mut container_updates = Vec::new();
            let mut up_to_date = false;
            for container in containers {
                let Some(target) = self.target_for(&images, &candidate, container) else {
                    continue;
                };
                if target == container.image {
                    up_to_date = true;
                    debug!(workload = %candidate.id, container = %container.name,
                           "already at target image");
                    continue;
                }
                container_updates.push(ContainerUpdate {
                    container: container.name.clone(),
                    current: container.image.clone(),
                    target,
                });
            }

            if container_updates.is_empty() {
                let outcome = if up_to_date {
                    WorkloadResult::skipped(IMAGE_UP_TO_DATE)
                } else {
                    WorkloadResult::ignored(DOES_NOT_USE_IMAGE)
                };
                result.record(candidate.id.clone(), outcome);
                continue;
            }
            result.record(
                candidate.id.clone(),
                WorkloadResult::success(container_updates.clone()),
            );
            candidate.updates = container_updates;
            updates.push(candidate);
        }
        Ok(updates)
    }

    fn release_kind(&self) -> ReleaseKind {
        self.spec.kind
    }

    fn commit_message(&self, result: &ReleaseResult) -> String {
        let images: Vec<String> = result.image_ids().iter().map(ToString::to_string).collect();
        let services = match &self.spec.services {
            ServiceSpec::All => "all workloads".to_string(),
            ServiceSpec::Ids(ids) => ids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        };
        format!("Release {} to {services}", images.join(", "))
    }
}

/// The tagged sum of change-set strategies.
pub enum Changeset {
    /// Poller-discovered changes.
    Automated(Automated),
    /// A user release.
    ImageRelease(ImageRelease),
}

impl Changeset {
    /// Builds the strategy for a release payload. Policy updates are not a
    /// planner concern and yield `None`.
    #[must_use]
    pub fn from_spec(spec: UpdateSpec) -> Option<Self> {
        match spec {
            UpdateSpec::Images(spec) => Some(Self::ImageRelease(ImageRelease::new(spec))),
            UpdateSpec::Automated(changes) => Some(Self::Automated(changes.into())),
            UpdateSpec::Policies(_) => None,
        }
    }
}

impl Changes for Changeset {
    fn calculate_release(
        &self,
        rc: &ReleaseContext<'_>,
        result: &mut ReleaseResult,
    ) -> Result<Vec<WorkloadUpdate>, ReleaseError> {
        match self {
            Self::Automated(a) => a.calculate_release(rc, result),
            Self::ImageRelease(r) => r.calculate_release(rc, result),
        }
    }

    fn release_kind(&self) -> ReleaseKind {
        match self {
            Self::Automated(a) => a.release_kind(),
            Self::ImageRelease(r) => r.release_kind(),
        }
    }

    fn commit_message(&self, result: &ReleaseResult) -> String {
        match self {
            Self::Automated(a) => a.commit_message(result),
            Self::ImageRelease(r) => r.commit_message(result),
        }
    }
}
