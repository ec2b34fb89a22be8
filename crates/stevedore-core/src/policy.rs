//! Workload policies.
//!
//! Policies are typed attributes attached to a workload through manifest
//! annotations under the [`ANNOTATION_PREFIX`]. Boolean policies are present
//! or absent; parametric policies carry a value. The invariants the rest of
//! the system leans on:
//!
//! - `locked` suppresses `automated` for the purposes of automated discovery
//! - `tag.<container>` overrides `tag-all`
//! - the absence of any tag policy means every tag matches (`*`)

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resource::Resource;
use crate::workload::WorkloadId;

/// Annotation prefix marking policy entries on a manifest.
pub const ANNOTATION_PREFIX: &str = "stevedore.io/";

/// A single policy key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Policy {
    /// The image poller may rewrite this workload to newer matching images.
    Automated,
    /// No automated or user-initiated update may touch this workload.
    Locked,
    /// Audit metadata: who locked the workload.
    LockedUser,
    /// Audit metadata: why the workload is locked.
    LockedMsg,
    /// Glob pattern restricting acceptable tags for one container.
    Tag(String),
    /// Glob pattern applied to containers without a specific `tag.<c>`.
    TagAll,
}

impl Policy {
    /// Parses a policy key as it appears in an annotation, without prefix.
    /// Unknown keys yield `None` and are ignored by the annotation codec.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "automated" => Some(Self::Automated),
            "locked" => Some(Self::Locked),
            "locked-user" => Some(Self::LockedUser),
            "locked-msg" => Some(Self::LockedMsg),
            "tag-all" => Some(Self::TagAll),
            _ => s.strip_prefix("tag.").map(|c| Self::Tag(c.to_string())),
        }
    }

    /// Whether the policy is boolean, i.e. its presence is its value.
    #[must_use]
    pub fn is_boolean(&self) -> bool {
        matches!(self, Self::Automated | Self::Locked)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Automated => f.write_str("automated"),
            Self::Locked => f.write_str("locked"),
            Self::LockedUser => f.write_str("locked-user"),
            Self::LockedMsg => f.write_str("locked-msg"),
            Self::Tag(container) => write!(f, "tag.{container}"),
            Self::TagAll => f.write_str("tag-all"),
        }
    }
}

impl TryFrom<String> for Policy {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s).ok_or_else(|| format!("unknown policy {s:?}"))
    }
}

impl From<Policy> for String {
    fn from(p: Policy) -> Self {
        p.to_string()
    }
}

/// A set of policies with their values.
///
/// Boolean policies store the value `"true"`; the annotation parser
/// interprets `"true"` as boolean-present on the way back in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Set(BTreeMap<Policy, String>);

impl Set {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a boolean policy.
    #[must_use]
    pub fn add(mut self, policy: Policy) -> Self {
        self.0.insert(policy, "true".to_string());
        self
    }

    /// Sets a parametric policy to a value.
    #[must_use]
    pub fn set(mut self, policy: Policy, value: impl Into<String>) -> Self {
        self.0.insert(policy, value.into());
        self
    }

    /// The value of a policy, if present.
    #[must_use]
    pub fn get(&self, policy: &Policy) -> Option<&str> {
        self.0.get(policy).map(String::as_str)
    }

    /// Whether the set contains a policy.
    #[must_use]
    pub fn contains(&self, policy: &Policy) -> bool {
        self.0.contains_key(policy)
    }

    /// Removes a policy, returning the updated set.
    #[must_use]
    pub fn remove(mut self, policy: &Policy) -> Self {
        self.0.remove(policy);
        self
    }

    /// Union; entries in `other` win on conflict.
    #[must_use]
    pub fn with(mut self, other: &Self) -> Self {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
        self
    }

    /// Difference by key.
    #[must_use]
    pub fn without(mut self, keys: &BTreeSet<Policy>) -> Self {
        self.0.retain(|k, _| !keys.contains(k));
        self
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(policy, value)` entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Policy, &str)> {
        self.0.iter().map(|(k, v)| (k, v.as_str()))
    }

    /// The tag pattern governing a container: `tag.<container>` if present,
    /// else `tag-all`, else `*`. A legacy `glob:` prefix is stripped.
    #[must_use]
    pub fn tag_pattern(&self, container: &str) -> &str {
        let pattern = self
            .get(&Policy::Tag(container.to_string()))
            .or_else(|| self.get(&Policy::TagAll))
            .unwrap_or("*");
        pattern.strip_prefix("glob:").unwrap_or(pattern)
    }

    /// Renders the set as manifest annotations under the policy prefix.
    #[must_use]
    pub fn to_annotations(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(k, v)| (format!("{ANNOTATION_PREFIX}{k}"), v.clone()))
            .collect()
    }

    /// Extracts the policy set from manifest annotations. Annotations
    /// outside the prefix, and unknown policy keys, are ignored. A boolean
    /// policy key with a value other than `"true"` is treated as absent.
    #[must_use]
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        let mut set = Self::new();
        for (key, value) in annotations {
            let Some(stripped) = key.strip_prefix(ANNOTATION_PREFIX) else {
                continue;
            };
            let Some(policy) = Policy::parse(stripped) else {
                continue;
            };
            if policy.is_boolean() && value != "true" {
                continue;
            }
            set = set.set(policy, value.clone());
        }
        set
    }
}

/// A policy change: policies to add and policies to remove.
///
/// Applied to a workload by computing `current ∪ add \ remove`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Policies to add or overwrite.
    pub add: Set,
    /// Policies to drop.
    pub remove: BTreeSet<Policy>,
}

impl Update {
    /// Applies the update to an existing set.
    #[must_use]
    pub fn apply_to(&self, current: Set) -> Set {
        current.with(&self.add).without(&self.remove)
    }
}

/// The ids of all loaded workloads whose policy set contains `policy`.
#[must_use]
pub fn services_with_policy(
    resources: &BTreeMap<WorkloadId, Resource>,
    policy: &Policy,
) -> BTreeSet<WorkloadId> {
    resources
        .iter()
        .filter(|(_, r)| r.policies.contains(policy))
        .map(|(id, _)| id.clone())
        .collect()
}

/// Whether `text` matches a shell-style glob pattern (`*` and `?`).
///
/// The pattern is compiled to an anchored regular expression; all other
/// characters match literally.
#[must_use]
pub fn match_glob(pattern: &str, text: &str) -> bool {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    regex::Regex::new(&re).map_or(false, |r| r.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_round_trip() {
        let set = Set::new()
            .add(Policy::Automated)
            .set(Policy::Tag("hello".into()), "glob:1.*")
            .set(Policy::LockedMsg, "frozen for release");
        let annotations = set.to_annotations();
        assert_eq!(annotations.get("stevedore.io/automated").unwrap(), "true");
        assert_eq!(Set::from_annotations(&annotations), set);
    }

    #[test]
    fn boolean_requires_true() {
        let mut annotations = BTreeMap::new();
        annotations.insert("stevedore.io/automated".to_string(), "false".to_string());
        assert!(!Set::from_annotations(&annotations).contains(&Policy::Automated));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut annotations = BTreeMap::new();
        annotations.insert("stevedore.io/launch-codes".to_string(), "true".to_string());
        annotations.insert("app.kubernetes.io/name".to_string(), "x".to_string());
        assert!(Set::from_annotations(&annotations).is_empty());
    }

    #[test]
    fn container_tag_overrides_tag_all() {
        let set = Set::new()
            .set(Policy::TagAll, "glob:master-*")
            .set(Policy::Tag("sidecar".into()), "1.?");
        assert_eq!(set.tag_pattern("sidecar"), "1.?");
        assert_eq!(set.tag_pattern("app"), "master-*");
        assert_eq!(Set::new().tag_pattern("app"), "*");
    }

    #[test]
    fn update_adds_and_removes() {
        let current = Set::new().add(Policy::Automated).add(Policy::Locked);
        let update = Update {
            add: Set::new().set(Policy::TagAll, "v*"),
            remove: [Policy::Locked].into_iter().collect(),
        };
        let next = update.apply_to(current);
        assert!(next.contains(&Policy::Automated));
        assert!(!next.contains(&Policy::Locked));
        assert_eq!(next.get(&Policy::TagAll), Some("v*"));
    }

    #[test]
    fn glob_semantics() {
        assert!(match_glob("*", "anything"));
        assert!(match_glob("1.*", "1.3"));
        assert!(!match_glob("1.*", "2.0"));
        assert!(match_glob("master-??????", "master-a1b2c3"));
        assert!(!match_glob("master-??????", "master-a1"));
        // regex metacharacters in tags are literal
        assert!(match_glob("v1.2", "v1.2"));
        assert!(!match_glob("v1.2", "v192"));
    }
}
