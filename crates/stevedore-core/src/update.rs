//! Release specifications and results.
//!
//! A release is one commit to the manifest repo representing a batch of
//! image updates. The request says which workloads and which images; the result
//! records, per workload, what happened and why.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::image::ImageRef;
use crate::policy;
use crate::resource::Resource;
use crate::workload::WorkloadId;

/// Skip reason: the workload is not defined in the manifest repo.
pub const NOT_IN_REPO: &str = "not in repository";
/// Skip reason: the workload is not running in the cluster.
pub const NOT_IN_CLUSTER: &str = "not running in cluster";
/// Skip reason: the workload is locked.
pub const LOCKED: &str = "locked";
/// Skip reason: every selected container already runs the target image.
pub const IMAGE_UP_TO_DATE: &str = "image(s) up to date";
/// Ignore reason: the workload runs none of the images being released.
pub const DOES_NOT_USE_IMAGE: &str = "does not use image(s)";

/// Whether a release only plans or actually writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseKind {
    /// Compute and report the would-be updates without writing.
    Plan,
    /// Compute, write, commit, and push.
    Execute,
}

impl fmt::Display for ReleaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan => f.write_str("plan"),
            Self::Execute => f.write_str("execute"),
        }
    }
}

/// Which workloads a release addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceSpec {
    /// Every workload defined in the repo.
    All,
    /// An explicit list.
    Ids(Vec<WorkloadId>),
}

impl ServiceSpec {
    /// The explicit ids, or `None` for [`ServiceSpec::All`].
    #[must_use]
    pub fn ids(&self) -> Option<&[WorkloadId]> {
        match self {
            Self::All => None,
            Self::Ids(ids) => Some(ids),
        }
    }
}

/// Which image a release moves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSpec {
    /// The newest image matching each container's tag policy.
    Latest,
    /// One explicit image, applied to containers in its repository.
    Exact(ImageRef),
}

/// Who asked for a release and why. Automated releases leave it empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cause {
    /// The requesting user, if any.
    #[serde(default)]
    pub user: String,
    /// Free-text reason, if any.
    #[serde(default)]
    pub message: String,
}

/// A user-initiated image release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseSpec {
    /// Which workloads to consider.
    pub services: ServiceSpec,
    /// Which image to move to.
    pub image: ImageSpec,
    /// Plan or execute.
    pub kind: ReleaseKind,
    /// Workloads to leave alone even if selected.
    #[serde(default)]
    pub excludes: Vec<WorkloadId>,
}

/// One discovered image change: this workload's container should move to
/// this image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomatedChange {
    /// The workload to update.
    pub workload: WorkloadId,
    /// The container within it.
    pub container: String,
    /// The image to pin.
    pub image: ImageRef,
}

/// The payload of a release request, by origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "spec", rename_all = "snake_case")]
pub enum UpdateSpec {
    /// A user-requested image release.
    Images(ReleaseSpec),
    /// Changes discovered by the image poller.
    Automated(Vec<AutomatedChange>),
    /// Policy changes to write into manifests.
    Policies(BTreeMap<WorkloadId, policy::Update>),
}

/// A planned change to one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerUpdate {
    /// The container name.
    pub container: String,
    /// The image it currently runs.
    pub current: ImageRef,
    /// The image it should run.
    pub target: ImageRef,
}

/// A workload together with its planned container updates.
///
/// Carries the loaded resource so the applier can rewrite the right file.
#[derive(Debug, Clone)]
pub struct WorkloadUpdate {
    /// The workload identity.
    pub id: WorkloadId,
    /// The manifest resource backing it.
    pub resource: Resource,
    /// The container-level changes to apply.
    pub updates: Vec<ContainerUpdate>,
}

/// Outcome class for one workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    /// Updates were planned (and, for execute, written).
    Success,
    /// Something went wrong for this workload.
    Failed,
    /// Deliberately left out, with a reason.
    Skipped,
    /// Not applicable, with a reason.
    Ignored,
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failed => f.write_str("failed"),
            Self::Skipped => f.write_str("skipped"),
            Self::Ignored => f.write_str("ignored"),
        }
    }
}

/// What happened to one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadResult {
    /// The outcome class.
    pub status: ReleaseStatus,
    /// Reason or error, for non-success outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The container updates planned for the workload.
    #[serde(default)]
    pub per_container: Vec<ContainerUpdate>,
}

impl WorkloadResult {
    /// A success carrying its container updates.
    #[must_use]
    pub fn success(per_container: Vec<ContainerUpdate>) -> Self {
        Self {
            status: ReleaseStatus::Success,
            error: None,
            per_container,
        }
    }

    /// A skip with a reason.
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: ReleaseStatus::Skipped,
            error: Some(reason.into()),
            per_container: Vec::new(),
        }
    }

    /// An ignore with a reason.
    #[must_use]
    pub fn ignored(reason: impl Into<String>) -> Self {
        Self {
            status: ReleaseStatus::Ignored,
            error: Some(reason.into()),
            per_container: Vec::new(),
        }
    }

    /// A failure with its error.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ReleaseStatus::Failed,
            error: Some(error.into()),
            per_container: Vec::new(),
        }
    }
}

/// Per-workload outcomes of one release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResult(BTreeMap<WorkloadId, WorkloadResult>);

impl ReleaseResult {
    /// An empty result map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome for one workload, replacing any earlier entry.
    pub fn record(&mut self, id: WorkloadId, result: WorkloadResult) {
        self.0.insert(id, result);
    }

    /// The outcome for one workload, if recorded.
    #[must_use]
    pub fn get(&self, id: &WorkloadId) -> Option<&WorkloadResult> {
        self.0.get(id)
    }

    /// Whether an outcome exists for the workload.
    #[must_use]
    pub fn contains(&self, id: &WorkloadId) -> bool {
        self.0.contains_key(id)
    }

    /// Iterates outcomes in workload order.
    pub fn iter(&self) -> impl Iterator<Item = (&WorkloadId, &WorkloadResult)> {
        self.0.iter()
    }

    /// Whether any outcome was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every workload id in the result.
    #[must_use]
    pub fn service_ids(&self) -> Vec<WorkloadId> {
        self.0.keys().cloned().collect()
    }

    /// Every distinct target image across the result, in order.
    #[must_use]
    pub fn image_ids(&self) -> Vec<ImageRef> {
        let mut images: Vec<ImageRef> = self
            .0
            .values()
            .flat_map(|r| r.per_container.iter().map(|c| c.target.clone()))
            .collect();
        images.sort();
        images.dedup();
        images
    }
}

impl fmt::Display for ReleaseResult {
    /// Renders the result as the table shown in job logs and the CLI.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<40} {:<8} UPDATES", "WORKLOAD", "STATUS")?;
        for (id, result) in &self.0 {
            let detail = match result.status {
                ReleaseStatus::Success => result
                    .per_container
                    .iter()
                    .map(|c| format!("{}: {} -> {}", c.container, c.current, c.target))
                    .collect::<Vec<_>>()
                    .join(", "),
                _ => result.error.clone().unwrap_or_default(),
            };
            writeln!(f, "{:<40} {:<8} {detail}", id.to_string(), result.status.to_string())?;
        }
        Ok(())
    }
}
