//! Wire types shared by the daemon's HTTP API and the CLI client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::image::{ImageDescription, ImageRef};
use crate::policy;
use crate::update::{Cause, UpdateSpec};
use crate::workload::{Container, WorkloadId};

/// A workload as the API reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// The workload identity.
    pub id: WorkloadId,
    /// Orchestrator status string.
    pub status: String,
    /// The containers it runs.
    pub containers: Vec<Container>,
    /// Whether the `automated` policy is in effect (set and not
    /// suppressed by `locked`).
    pub automated: bool,
    /// Whether the `locked` policy is set.
    pub locked: bool,
    /// Every policy on the workload, rendered `key=value`.
    pub policies: Vec<String>,
}

/// One container's image situation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerImages {
    /// The container name.
    pub name: String,
    /// The image it currently runs.
    pub current: ImageRef,
    /// What the registry has for that repository, newest first.
    pub available: Vec<ImageDescription>,
}

/// A workload's images as the API reports them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageStatus {
    /// The workload identity.
    pub id: WorkloadId,
    /// Per-container image listings.
    pub containers: Vec<ContainerImages>,
}

/// Body of a release submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    /// What to release.
    pub spec: UpdateSpec,
    /// Who is asking and why.
    #[serde(default)]
    pub cause: Cause,
}

/// Body of a policy submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRequest {
    /// Per-workload policy updates.
    pub updates: BTreeMap<WorkloadId, policy::Update>,
    /// Who is asking and why.
    #[serde(default)]
    pub cause: Cause,
}

/// Response to a submission: the job to poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResponse {
    /// The queued job's id.
    pub release_id: String,
}
