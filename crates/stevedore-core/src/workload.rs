//! Workload identity.
//!
//! A workload is a managed unit in the orchestrator (a deployment,
//! daemon-set, or similar) owning an ordered list of containers. Its identity
//! is the triple `(namespace, kind, name)`, rendered canonically as
//! `namespace:kind/name`, and is the primary key wherever a resource is
//! referenced.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image::ImageRef;

/// Namespace assumed when a manifest declares none.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Kind assumed when an identity is given as `namespace/name`.
const DEFAULT_KIND: &str = "Deployment";

/// Errors from parsing workload identities.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum WorkloadIdError {
    /// The identity string did not match `namespace:kind/name` or
    /// `namespace/name`.
    #[error("invalid workload id {id:?}: expected namespace:kind/name")]
    Invalid {
        /// The offending identity string.
        id: String,
    },
}

/// The identity of a workload: namespace, kind, and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkloadId {
    namespace: String,
    kind: String,
    name: String,
}

impl WorkloadId {
    /// Builds an identity from its parts.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            namespace: if namespace.is_empty() {
                DEFAULT_NAMESPACE.to_string()
            } else {
                namespace
            },
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// The namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The kind, e.g. `Deployment`.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The name within the namespace.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.namespace, self.kind, self.name)
    }
}

impl FromStr for WorkloadId {
    type Err = WorkloadIdError;

    /// Accepts the canonical `namespace:kind/name`, and the shorthand
    /// `namespace/name` with the kind defaulting to `Deployment`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WorkloadIdError::Invalid { id: s.to_string() };

        if let Some((namespace, rest)) = s.split_once(':') {
            let (kind, name) = rest.split_once('/').ok_or_else(invalid)?;
            if namespace.is_empty() || kind.is_empty() || name.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::new(namespace, kind, name));
        }

        let (namespace, name) = s.split_once('/').ok_or_else(invalid)?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return Err(invalid());
        }
        Ok(Self::new(namespace, DEFAULT_KIND, name))
    }
}

impl TryFrom<String> for WorkloadId {
    type Error = WorkloadIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<WorkloadId> for String {
    fn from(id: WorkloadId) -> Self {
        id.to_string()
    }
}

/// A named container within a workload and the image it currently runs.
///
/// Container order and names are invariants of a workload: any update may
/// change images only, never the list shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// The container name, unique within its workload.
    pub name: String,
    /// The image the container is pinned to.
    pub image: ImageRef,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_round_trips() {
        let id: WorkloadId = "default:Deployment/hello".parse().unwrap();
        assert_eq!(id.namespace(), "default");
        assert_eq!(id.kind(), "Deployment");
        assert_eq!(id.name(), "hello");
        assert_eq!(id.to_string(), "default:Deployment/hello");
    }

    #[test]
    fn shorthand_defaults_kind() {
        let id: WorkloadId = "default/hello".parse().unwrap();
        assert_eq!(id, WorkloadId::new("default", "Deployment", "hello"));
    }

    #[test]
    fn empty_namespace_defaults() {
        let id = WorkloadId::new("", "DaemonSet", "agent");
        assert_eq!(id.namespace(), "default");
    }

    #[test]
    fn rejects_malformed() {
        assert!("hello".parse::<WorkloadId>().is_err());
        assert!(":/x".parse::<WorkloadId>().is_err());
        assert!("ns:Kind".parse::<WorkloadId>().is_err());
        assert!("a/b/c".parse::<WorkloadId>().is_err());
    }

    #[test]
    fn ordering_is_stable() {
        let mut ids: Vec<WorkloadId> = ["b/x", "a/y", "a/x"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ids.sort();
        assert_eq!(ids[0].namespace(), "a");
        assert_eq!(ids[0].name(), "x");
    }
}
