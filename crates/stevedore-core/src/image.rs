//! Container image references.
//!
//! An [`ImageRef`] names an image as `[registry/]repository[:tag]`. The
//! registry host is recognised by containing a `.` or `:`, or being
//! `localhost`, in its first path segment; everything else belongs to the
//! repository path. Ordering of images within a repository is decided by
//! registry-reported creation time, never by comparing tags.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag assumed when a reference carries none.
pub const DEFAULT_TAG: &str = "latest";

/// Errors from parsing image references.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ImageError {
    /// The reference was empty or structurally invalid.
    #[error("invalid image reference {reference:?}: {reason}")]
    Invalid {
        /// The offending reference string.
        reference: String,
        /// Why it was rejected.
        reason: &'static str,
    },
}

/// A parsed image reference: registry host, repository path, and tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    registry: Option<String>,
    repo: String,
    tag: String,
}

impl ImageRef {
    /// Parses `[registry/]repository[:tag]`.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Invalid`] for empty or malformed references.
    pub fn parse(s: &str) -> Result<Self, ImageError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ImageError::Invalid {
                reference: s.to_string(),
                reason: "empty reference",
            });
        }

        // The tag is whatever follows the last ':', provided that ':' comes
        // after the last '/'. Otherwise the ':' belongs to a registry port.
        let (path, tag) = match (s.rfind(':'), s.rfind('/')) {
            (Some(c), Some(sl)) if c > sl => (&s[..c], &s[c + 1..]),
            (Some(c), None) => (&s[..c], &s[c + 1..]),
            _ => (s, DEFAULT_TAG),
        };
        if path.is_empty() || tag.is_empty() {
            return Err(ImageError::Invalid {
                reference: s.to_string(),
                reason: "missing repository or tag",
            });
        }

        let (registry, repo) = match path.split_once('/') {
            Some((head, rest))
                if head.contains('.') || head.contains(':') || head == "localhost" =>
            {
                (Some(head.to_string()), rest.to_string())
            }
            _ => (None, path.to_string()),
        };
        if repo.is_empty() {
            return Err(ImageError::Invalid {
                reference: s.to_string(),
                reason: "empty repository path",
            });
        }

        Ok(Self {
            registry,
            repo,
            tag: tag.to_string(),
        })
    }

    /// The registry host, if the reference names one.
    #[must_use]
    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    /// The repository path without registry or tag.
    #[must_use]
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// The tag.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The repository rendered with its registry host, without the tag.
    ///
    /// This is the key used to group images when querying a registry.
    #[must_use]
    pub fn repository(&self) -> String {
        match &self.registry {
            Some(host) => format!("{host}/{}", self.repo),
            None => self.repo.clone(),
        }
    }

    /// The same repository pinned to a different tag.
    #[must_use]
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repo: self.repo.clone(),
            tag: tag.into(),
        }
    }

    /// Whether `other` names an image in the same repository.
    #[must_use]
    pub fn same_repository(&self, other: &Self) -> bool {
        self.registry == other.registry && self.repo == other.repo
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(host) = &self.registry {
            write!(f, "{host}/")?;
        }
        write!(f, "{}:{}", self.repo, self.tag)
    }
}

impl FromStr for ImageRef {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageRef {
    type Error = ImageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ImageRef> for String {
    fn from(r: ImageRef) -> Self {
        r.to_string()
    }
}

/// An image reference together with its registry-reported creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescription {
    /// The image.
    pub id: ImageRef,
    /// When the registry says the image was created. `None` when the
    /// registry could not supply a timestamp.
    pub created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_repository() {
        let r = ImageRef::parse("hello").unwrap();
        assert_eq!(r.registry(), None);
        assert_eq!(r.repo(), "hello");
        assert_eq!(r.tag(), "latest");
        assert_eq!(r.to_string(), "hello:latest");
    }

    #[test]
    fn parses_registry_host_and_port() {
        let r = ImageRef::parse("registry.example.com:5000/team/app:v1.2").unwrap();
        assert_eq!(r.registry(), Some("registry.example.com:5000"));
        assert_eq!(r.repo(), "team/app");
        assert_eq!(r.tag(), "v1.2");
        assert_eq!(r.repository(), "registry.example.com:5000/team/app");
    }

    #[test]
    fn org_segment_is_not_a_registry() {
        let r = ImageRef::parse("acme/helloworld:master-a000001").unwrap();
        assert_eq!(r.registry(), None);
        assert_eq!(r.repo(), "acme/helloworld");
        assert_eq!(r.tag(), "master-a000001");
    }

    #[test]
    fn localhost_is_a_registry() {
        let r = ImageRef::parse("localhost/app:dev").unwrap();
        assert_eq!(r.registry(), Some("localhost"));
        assert_eq!(r.repo(), "app");
    }

    #[test]
    fn display_round_trips() {
        for s in [
            "hello:latest",
            "team/app:v3",
            "registry.example.com/team/app:2024-06-01",
        ] {
            assert_eq!(ImageRef::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn rejects_empty_and_malformed() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("app:").is_err());
        assert!(ImageRef::parse(":tag").is_err());
    }

    #[test]
    fn with_tag_keeps_repository() {
        let r = ImageRef::parse("reg.io/app:v1").unwrap();
        let r2 = r.with_tag("v2");
        assert!(r.same_repository(&r2));
        assert_eq!(r2.tag(), "v2");
    }
}
