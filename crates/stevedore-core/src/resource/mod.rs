//! Manifest resources.
//!
//! A resource is one YAML document from the manifest repository: its verbatim
//! bytes, the file it came from, its workload identity, and its
//! annotation-derived policy set. Workload kinds additionally expose their
//! ordered container list. Resources loaded from a directory tree form a map
//! keyed by workload identity; the map is built once and read many times per
//! release.

mod rewrite;

pub use rewrite::{update_image, update_policies};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::image::ImageRef;
use crate::policy;
use crate::workload::{Container, WorkloadId, DEFAULT_NAMESPACE};

/// Kinds whose manifests carry a pod template with a container list.
pub const WORKLOAD_KINDS: &[&str] = &["Deployment", "DaemonSet"];

/// Errors from loading or rewriting manifests.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResourceError {
    /// Reading a manifest file failed.
    #[error("reading {path}: {source}")]
    Io {
        /// The file being read.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A manifest document could not be interpreted.
    #[error("parsing {source_file}: {reason}")]
    Parse {
        /// The file the document came from.
        source_file: String,
        /// Why parsing failed.
        reason: String,
    },

    /// Two documents declared the same workload identity.
    #[error("duplicate definition of {id} (in {source_file})")]
    Duplicate {
        /// The identity defined twice.
        id: WorkloadId,
        /// The file containing the second definition.
        source_file: String,
    },

    /// An update referenced a workload the file does not define.
    #[error("no document for {id} in {source_file}")]
    NotFound {
        /// The identity that was not found.
        id: WorkloadId,
        /// The file that was searched.
        source_file: String,
    },

    /// An update referenced a workload or container the file does not have.
    #[error("no container {container:?} in {id} ({source_file})")]
    NoSuchContainer {
        /// The workload being rewritten.
        id: WorkloadId,
        /// The missing container name.
        container: String,
        /// The file that was searched.
        source_file: String,
    },
}

/// One manifest document and what the control loop knows about it.
#[derive(Debug, Clone)]
pub struct Resource {
    /// Path of the file this document came from, relative to the manifest
    /// directory. Used for logging and for writing updates back.
    pub source: String,
    /// The verbatim document bytes.
    pub bytes: Vec<u8>,
    /// The workload identity.
    pub id: WorkloadId,
    /// Policies parsed from the document's annotations.
    pub policies: policy::Set,
    containers: Option<Vec<Container>>,
}

impl Resource {
    /// The ordered container list, for workload kinds.
    #[must_use]
    pub fn containers(&self) -> Option<&[Container]> {
        self.containers.as_deref()
    }

    /// Whether the resource is a workload kind with a container list.
    #[must_use]
    pub fn is_workload(&self) -> bool {
        self.containers.is_some()
    }

    /// Points a named container at a different image in the parsed view
    /// only; the raw bytes are untouched. Returns whether the container
    /// exists.
    pub fn set_container_image(&mut self, name: &str, image: &ImageRef) -> bool {
        let Some(containers) = self.containers.as_mut() else {
            return false;
        };
        match containers.iter_mut().find(|c| c.name == name) {
            Some(container) => {
                container.image = image.clone();
                true
            }
            None => false,
        }
    }
}

#[derive(Deserialize)]
struct RawDoc {
    kind: String,
    metadata: RawMetadata,
    #[serde(default)]
    spec: Option<RawSpec>,
}

#[derive(Deserialize)]
struct RawMetadata {
    #[serde(default)]
    namespace: Option<String>,
    name: String,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawSpec {
    #[serde(default)]
    template: Option<RawTemplate>,
}

#[derive(Deserialize)]
struct RawTemplate {
    #[serde(default)]
    spec: Option<RawPodSpec>,
}

#[derive(Deserialize)]
struct RawPodSpec {
    #[serde(default)]
    containers: Vec<RawContainer>,
}

#[derive(Deserialize)]
struct RawContainer {
    name: String,
    image: String,
}

/// Splits a YAML stream into document chunks on `---` separator lines.
/// Chunk boundaries preserve every byte of the input.
pub(crate) fn split_documents(text: &str) -> Vec<&str> {
    let mut docs = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_end() == "---" {
            if offset > start {
                docs.push(&text[start..offset]);
            }
            start = offset + line.len();
        }
        offset += line.len();
    }
    if start < text.len() {
        docs.push(&text[start..]);
    }
    docs
}

fn is_blank(doc: &str) -> bool {
    doc.lines()
        .all(|l| l.trim().is_empty() || l.trim_start().starts_with('#'))
}

/// Parses one document into a [`Resource`]. `source` is recorded verbatim.
fn parse_document(source: &str, doc: &str) -> Result<Resource, ResourceError> {
    let raw: RawDoc = serde_yaml::from_str(doc).map_err(|e| ResourceError::Parse {
        source_file: source.to_string(),
        reason: e.to_string(),
    })?;

    let namespace = raw
        .metadata
        .namespace
        .as_deref()
        .unwrap_or(DEFAULT_NAMESPACE);
    let id = WorkloadId::new(namespace, &raw.kind, &raw.metadata.name);
    let policies = policy::Set::from_annotations(&raw.metadata.annotations);

    let containers = if WORKLOAD_KINDS.contains(&raw.kind.as_str()) {
        let raw_containers = raw
            .spec
            .and_then(|s| s.template)
            .and_then(|t| t.spec)
            .map(|p| p.containers)
            .unwrap_or_default();
        let mut containers = Vec::with_capacity(raw_containers.len());
        for c in raw_containers {
            let image = ImageRef::parse(&c.image).map_err(|e| ResourceError::Parse {
                source_file: source.to_string(),
                reason: format!("container {:?}: {e}", c.name),
            })?;
            containers.push(Container {
                name: c.name,
                image,
            });
        }
        Some(containers)
    } else {
        None
    };

    Ok(Resource {
        source: source.to_string(),
        bytes: doc.as_bytes().to_vec(),
        id,
        policies,
        containers,
    })
}

/// Parses every document in one file's contents.
///
/// # Errors
///
/// Fails on undecodable or unparseable documents, which are fatal: a broken
/// manifest must stop a release before anything is written.
pub fn parse_file(source: &str, bytes: &[u8]) -> Result<Vec<Resource>, ResourceError> {
    let text = std::str::from_utf8(bytes).map_err(|e| ResourceError::Parse {
        source_file: source.to_string(),
        reason: format!("not UTF-8: {e}"),
    })?;
    let mut resources = Vec::new();
    for doc in split_documents(text) {
        if is_blank(doc) {
            continue;
        }
        resources.push(parse_document(source, doc)?);
    }
    Ok(resources)
}

fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>, ResourceError> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current).map_err(|e| ResourceError::Io {
            path: current.clone(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| ResourceError::Io {
                path: current.clone(),
                source: e,
            })?;
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml" | "yml")
            ) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Loads every manifest under `dir` into a map keyed by workload identity.
///
/// Source paths in the returned resources are relative to `dir`.
///
/// # Errors
///
/// Fails on I/O errors, unparseable documents, and duplicate identities.
pub fn load(dir: &Path) -> Result<BTreeMap<WorkloadId, Resource>, ResourceError> {
    let files = manifest_files(dir)?;
    let relative: Vec<String> = files
        .iter()
        .map(|f| {
            f.strip_prefix(dir)
                .unwrap_or(f)
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    load_files(dir, &relative)
}

/// Loads manifests from specific files (paths relative to `dir`).
///
/// # Errors
///
/// Fails on I/O errors, unparseable documents, and duplicate identities.
pub fn load_files(
    dir: &Path,
    paths: &[String],
) -> Result<BTreeMap<WorkloadId, Resource>, ResourceError> {
    let mut map = BTreeMap::new();
    for rel in paths {
        let path = dir.join(rel);
        let bytes = std::fs::read(&path).map_err(|e| ResourceError::Io {
            path: path.clone(),
            source: e,
        })?;
        for resource in parse_file(rel, &bytes)? {
            let id = resource.id.clone();
            if map.insert(id.clone(), resource).is_some() {
                return Err(ResourceError::Duplicate {
                    id,
                    source_file: rel.clone(),
                });
            }
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;

    const DEPLOYMENT: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: hello
  annotations:
    stevedore.io/automated: "true"
    stevedore.io/tag.hello: "glob:1.*"
spec:
  template:
    spec:
      containers:
      - name: hello
        image: quay.io/team/hello:1.2
      - name: sidecar
        image: team/sidecar:0.9
"#;

    const SERVICE: &str = r#"apiVersion: v1
kind: Service
metadata:
  name: hello
spec:
  ports:
  - port: 80
"#;

    #[test]
    fn parses_workload_with_containers() {
        let resources = parse_file("hello.yaml", DEPLOYMENT.as_bytes()).unwrap();
        assert_eq!(resources.len(), 1);
        let r = &resources[0];
        assert_eq!(r.id.to_string(), "default:Deployment/hello");
        assert!(r.policies.contains(&Policy::Automated));
        let containers = r.containers().unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "hello");
        assert_eq!(containers[0].image.to_string(), "quay.io/team/hello:1.2");
        assert_eq!(r.bytes, DEPLOYMENT.as_bytes());
    }

    #[test]
    fn non_workload_kinds_have_no_containers() {
        let resources = parse_file("svc.yaml", SERVICE.as_bytes()).unwrap();
        assert!(!resources[0].is_workload());
    }

    #[test]
    fn multi_document_files_split_on_separators() {
        let text = format!("{DEPLOYMENT}---\n{SERVICE}");
        let resources = parse_file("both.yaml", text.as_bytes()).unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].bytes, DEPLOYMENT.as_bytes());
        assert_eq!(resources[1].bytes, SERVICE.as_bytes());
    }

    #[test]
    fn comment_only_documents_are_skipped() {
        let text = "# nothing here\n---\n".to_string() + SERVICE;
        let resources = parse_file("svc.yaml", text.as_bytes()).unwrap();
        assert_eq!(resources.len(), 1);
    }

    #[test]
    fn unparseable_document_is_fatal() {
        let err = parse_file("bad.yaml", b"kind: Deployment\nmetadata: [not, a, map]\n")
            .unwrap_err();
        assert!(matches!(err, ResourceError::Parse { .. }));
    }

    #[test]
    fn load_walks_directories_and_relativises_sources() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("app")).unwrap();
        std::fs::write(dir.path().join("app/hello.yaml"), DEPLOYMENT).unwrap();
        std::fs::write(dir.path().join("svc.yml"), SERVICE).unwrap();
        std::fs::write(dir.path().join("README.md"), "not yaml").unwrap();

        let map = load(dir.path()).unwrap();
        assert_eq!(map.len(), 2);
        let dep = map
            .get(&"default:Deployment/hello".parse().unwrap())
            .unwrap();
        assert_eq!(dep.source, "app/hello.yaml");
    }

    #[test]
    fn parse_render_parse_preserves_identity_and_policy() {
        let first = parse_file("hello.yaml", DEPLOYMENT.as_bytes()).unwrap();
        let again = parse_file("hello.yaml", &first[0].bytes).unwrap();
        assert_eq!(first[0].id, again[0].id);
        assert_eq!(first[0].policies, again[0].policies);
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), DEPLOYMENT).unwrap();
        std::fs::write(dir.path().join("b.yaml"), DEPLOYMENT).unwrap();
        assert!(matches!(
            load(dir.path()),
            Err(ResourceError::Duplicate { .. })
        ));
    }
}
