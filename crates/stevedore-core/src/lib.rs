//! # stevedore-core
//!
//! Core library for stevedore, a continuous-deployment control loop for
//! containerised workloads. Desired state is declared as YAML manifests in a
//! git repository; running state lives in a container orchestrator. This
//! crate provides the pieces the daemon composes:
//!
//! - **Data model**: workload identities, image references, policies
//! - **Manifests**: loading, policy annotations, byte-preserving rewrites
//! - **Release engine**: contexts, planning, verification, change-sets
//! - **Job queue**: durable, deduplicated, priority-ordered work with leases
//! - **History**: the persisted event log
//! - **Drivers**: git wrapper, registry client, orchestrator seam

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod cluster;
pub mod git;
pub mod history;
pub mod image;
pub mod jobs;
pub mod keyring;
pub mod notify;
pub mod policy;
pub mod registry;
pub mod release;
pub mod resource;
pub mod sync;
pub mod update;
pub mod workload;

pub use image::ImageRef;
pub use update::{ReleaseKind, ReleaseResult};
pub use workload::WorkloadId;
