//! The release engine.
//!
//! A release turns a request ("move these workloads to these images") into
//! a verified edit of the manifest repository. The pieces:
//!
//! - [`context::ReleaseContext`]: a scoped working clone plus driver handles
//! - [`images::ImageMap`]: an indexed view of registry state
//! - [`changes`]: the strategies that compute per-container updates
//! - [`planner`]: snapshot, plan, apply, verify

pub mod changes;
pub mod context;
pub mod images;
pub mod planner;

pub use changes::{Automated, Changes, Changeset, ImageRelease};
pub use context::ReleaseContext;
pub use images::ImageMap;
pub use planner::release;

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::git::GitError;
use crate::registry::RegistryError;
use crate::resource::ResourceError;

/// Errors from planning or applying a release.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReleaseError {
    /// The request itself was bad; surfaced to the caller unchanged.
    #[error("{0}")]
    User(String),

    /// The verify phase found a discrepancy between the planned updates and
    /// what the rewritten manifests actually say. Always fatal: nothing is
    /// committed.
    #[error("verification failed: {reason}")]
    Verification {
        /// Exactly what did not match.
        reason: String,
    },

    /// A non-user error, annotated with the release stage it happened in.
    #[error("release stage {stage:?} failed: {source}")]
    Stage {
        /// The stage that failed.
        stage: &'static str,
        /// The underlying error.
        #[source]
        source: Box<ReleaseError>,
    },

    /// Manifest loading or rewriting failed.
    #[error(transparent)]
    Manifests(#[from] ResourceError),

    /// The orchestrator could not be queried.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The registry could not be queried.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A git operation failed.
    #[error(transparent)]
    Git(#[from] GitError),
}

impl ReleaseError {
    /// Wraps non-user errors with the stage they occurred in. User errors
    /// pass through untouched so callers can surface them verbatim.
    #[must_use]
    pub fn at_stage(self, stage: &'static str) -> Self {
        match self {
            user @ Self::User(_) => user,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }
}
