//! Image registry client.
//!
//! Talks the registry v2 HTTP API: a tag listing per repository, and a
//! per-tag manifest fetch to recover the image creation time. Calls carry a
//! short timeout so a slow registry cannot stall a whole poll cycle. The
//! [`CachedRegistry`] layer memoises responses for a configurable TTL;
//! [`InMemoryRegistry`] is the scriptable double used by tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::image::{ImageDescription, ImageRef};

/// Registry host assumed for repositories that do not name one.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Timeout applied to each registry request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from registry operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// The registry could not be reached.
    #[error("registry transport error: {0}")]
    Transport(String),

    /// The registry answered with a failure status.
    #[error("registry returned {status} for {url}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// The request URL.
        url: String,
        /// Response body, if readable.
        message: String,
    },

    /// The response body could not be interpreted.
    #[error("decoding registry response: {reason}")]
    Decode {
        /// Why decoding failed.
        reason: String,
    },

    /// The repository or tag does not exist.
    #[error("no such image {repository}:{tag}")]
    NotFound {
        /// The repository queried.
        repository: String,
        /// The tag queried.
        tag: String,
    },
}

/// Read access to an image registry.
pub trait Registry: Send + Sync {
    /// Lists the tags of a repository.
    ///
    /// # Errors
    ///
    /// Fails when the registry cannot be queried.
    fn tags(&self, repository: &str) -> Result<Vec<String>, RegistryError>;

    /// Fetches one tag's metadata.
    ///
    /// # Errors
    ///
    /// Fails when the registry cannot be queried or the tag is missing.
    fn image_info(&self, repository: &str, tag: &str) -> Result<ImageDescription, RegistryError>;
}

/// Every image in a repository, most recently created first. Images whose
/// creation time the registry could not supply sort last.
///
/// # Errors
///
/// Fails when the tag list or any tag's metadata cannot be fetched.
pub fn repository_images(
    registry: &dyn Registry,
    repository: &str,
) -> Result<Vec<ImageDescription>, RegistryError> {
    let mut images = Vec::new();
    for tag in registry.tags(repository)? {
        images.push(registry.image_info(repository, &tag)?);
    }
    images.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(images)
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct ManifestResponse {
    #[serde(default)]
    history: Vec<HistoryEntry>,
}

#[derive(Deserialize)]
struct HistoryEntry {
    #[serde(rename = "v1Compatibility")]
    v1_compatibility: String,
}

#[derive(Deserialize)]
struct V1Compatibility {
    created: Option<DateTime<Utc>>,
}

/// Registry v2 API client.
pub struct HttpRegistry {
    client: reqwest::blocking::Client,
    scheme: &'static str,
}

impl HttpRegistry {
    /// Builds a client with the standard timeouts.
    ///
    /// # Errors
    ///
    /// Fails when the underlying HTTP client cannot be constructed.
    pub fn new() -> Result<Self, RegistryError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RegistryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            scheme: "https",
        })
    }

    /// Splits `host/path` into the registry host and repository path,
    /// defaulting the host when the repository does not name one.
    fn endpoint(repository: &str) -> (String, String) {
        match repository.split_once('/') {
            Some((head, rest))
                if head.contains('.') || head.contains(':') || head == "localhost" =>
            {
                (head.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), repository.to_string()),
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{repository}")),
        }
    }

    fn get(&self, url: &str, accept: Option<&str>) -> Result<reqwest::blocking::Response, RegistryError> {
        let mut req = self.client.get(url);
        if let Some(accept) = accept {
            req = req.header("Accept", accept);
        }
        let response = req
            .send()
            .map_err(|e| RegistryError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "unable to read response body".to_string());
            return Err(RegistryError::Api {
                status: status.as_u16(),
                url: url.to_string(),
                message,
            });
        }
        Ok(response)
    }
}

impl Registry for HttpRegistry {
    fn tags(&self, repository: &str) -> Result<Vec<String>, RegistryError> {
        let (host, path) = Self::endpoint(repository);
        let url = format!("{}://{host}/v2/{path}/tags/list", self.scheme);
        let parsed: TagsResponse = self
            .get(&url, None)?
            .json()
            .map_err(|e| RegistryError::Decode {
                reason: e.to_string(),
            })?;
        Ok(parsed.tags)
    }

    fn image_info(&self, repository: &str, tag: &str) -> Result<ImageDescription, RegistryError> {
        let (host, path) = Self::endpoint(repository);
        let url = format!("{}://{host}/v2/{path}/manifests/{tag}", self.scheme);
        let response = match self.get(
            &url,
            Some("application/vnd.docker.distribution.manifest.v1+json"),
        ) {
            Err(RegistryError::Api { status: 404, .. }) => {
                return Err(RegistryError::NotFound {
                    repository: repository.to_string(),
                    tag: tag.to_string(),
                })
            }
            other => other?,
        };
        let manifest: ManifestResponse =
            response.json().map_err(|e| RegistryError::Decode {
                reason: e.to_string(),
            })?;
        // The newest layer's v1 compatibility blob carries the build time.
        let created_at = manifest
            .history
            .first()
            .and_then(|h| serde_json::from_str::<V1Compatibility>(&h.v1_compatibility).ok())
            .and_then(|c| c.created);

        let id = ImageRef::parse(&format!("{repository}:{tag}")).map_err(|e| {
            RegistryError::Decode {
                reason: e.to_string(),
            }
        })?;
        Ok(ImageDescription { id, created_at })
    }
}

enum CacheEntry {
    Tags(Vec<String>),
    Info(ImageDescription),
}

/// A TTL cache in front of another registry client.
pub struct CachedRegistry<R> {
    inner: R,
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, CacheEntry)>>,
}

impl<R: Registry> CachedRegistry<R> {
    /// Wraps `inner`, keeping responses for `ttl`.
    #[must_use]
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lookup<T>(
        &self,
        key: &str,
        pick: impl Fn(&CacheEntry) -> Option<T>,
    ) -> Option<T> {
        let entries = self.entries.lock().expect("registry cache lock");
        let (at, entry) = entries.get(key)?;
        if at.elapsed() > self.ttl {
            return None;
        }
        pick(entry)
    }

    fn store(&self, key: String, entry: CacheEntry) {
        self.entries
            .lock()
            .expect("registry cache lock")
            .insert(key, (Instant::now(), entry));
    }
}

impl<R: Registry> Registry for CachedRegistry<R> {
    fn tags(&self, repository: &str) -> Result<Vec<String>, RegistryError> {
        let key = format!("tags|{repository}");
        if let Some(tags) = self.lookup(&key, |e| match e {
            CacheEntry::Tags(t) => Some(t.clone()),
            CacheEntry::Info(_) => None,
        }) {
            return Ok(tags);
        }
        let tags = self.inner.tags(repository)?;
        self.store(key, CacheEntry::Tags(tags.clone()));
        Ok(tags)
    }

    fn image_info(&self, repository: &str, tag: &str) -> Result<ImageDescription, RegistryError> {
        let key = format!("info|{repository}|{tag}");
        if let Some(info) = self.lookup(&key, |e| match e {
            CacheEntry::Info(i) => Some(i.clone()),
            CacheEntry::Tags(_) => None,
        }) {
            return Ok(info);
        }
        let info = self.inner.image_info(repository, tag)?;
        self.store(key, CacheEntry::Info(info.clone()));
        Ok(info)
    }
}

/// A registry double whose contents tests script directly.
#[derive(Default)]
pub struct InMemoryRegistry {
    repositories: Mutex<HashMap<String, Vec<(String, Option<DateTime<Utc>>)>>>,
    calls: Mutex<usize>,
}

impl InMemoryRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tag to a repository with the given creation time.
    pub fn add_image(&self, repository: &str, tag: &str, created_at: Option<DateTime<Utc>>) {
        self.repositories
            .lock()
            .expect("registry state lock")
            .entry(repository.to_string())
            .or_default()
            .push((tag.to_string(), created_at));
    }

    /// How many calls the double has served.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.calls.lock().expect("registry calls lock")
    }
}

impl Registry for InMemoryRegistry {
    fn tags(&self, repository: &str) -> Result<Vec<String>, RegistryError> {
        *self.calls.lock().expect("registry calls lock") += 1;
        let repos = self.repositories.lock().expect("registry state lock");
        match repos.get(repository) {
            Some(tags) => Ok(tags.iter().map(|(t, _)| t.clone()).collect()),
            None => Err(RegistryError::Api {
                status: 404,
                url: repository.to_string(),
                message: "repository not found".to_string(),
            }),
        }
    }

    fn image_info(&self, repository: &str, tag: &str) -> Result<ImageDescription, RegistryError> {
        *self.calls.lock().expect("registry calls lock") += 1;
        let repos = self.repositories.lock().expect("registry state lock");
        let created_at = repos
            .get(repository)
            .and_then(|tags| tags.iter().find(|(t, _)| t == tag))
            .ok_or_else(|| RegistryError::NotFound {
                repository: repository.to_string(),
                tag: tag.to_string(),
            })?
            .1;
        let id = ImageRef::parse(&format!("{repository}:{tag}")).map_err(|e| {
            RegistryError::Decode {
                reason: e.to_string(),
            }
        })?;
        Ok(ImageDescription { id, created_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2024, 6, day, 0, 0, 0).unwrap())
    }

    #[test]
    fn repository_images_sorts_newest_first() {
        let registry = InMemoryRegistry::new();
        registry.add_image("team/app", "v1", ts(1));
        registry.add_image("team/app", "v3", ts(3));
        registry.add_image("team/app", "v2", ts(2));
        registry.add_image("team/app", "mystery", None);

        let images = repository_images(&registry, "team/app").unwrap();
        let tags: Vec<&str> = images.iter().map(|i| i.id.tag()).collect();
        assert_eq!(tags, vec!["v3", "v2", "v1", "mystery"]);
    }

    #[test]
    fn endpoint_defaults_host_and_library() {
        assert_eq!(
            HttpRegistry::endpoint("hello"),
            (DEFAULT_REGISTRY.to_string(), "library/hello".to_string())
        );
        assert_eq!(
            HttpRegistry::endpoint("quay.io/team/app"),
            ("quay.io".to_string(), "team/app".to_string())
        );
        assert_eq!(
            HttpRegistry::endpoint("team/app"),
            (DEFAULT_REGISTRY.to_string(), "team/app".to_string())
        );
    }

    #[test]
    fn cache_serves_repeat_lookups() {
        let inner = InMemoryRegistry::new();
        inner.add_image("team/app", "v1", ts(1));
        let cached = CachedRegistry::new(inner, Duration::from_secs(60));

        assert_eq!(cached.tags("team/app").unwrap(), vec!["v1"]);
        assert_eq!(cached.tags("team/app").unwrap(), vec!["v1"]);
        cached.image_info("team/app", "v1").unwrap();
        cached.image_info("team/app", "v1").unwrap();
        assert_eq!(cached.inner.call_count(), 2);
    }

    #[test]
    fn cache_expires() {
        let inner = InMemoryRegistry::new();
        inner.add_image("team/app", "v1", ts(1));
        let cached = CachedRegistry::new(inner, Duration::from_secs(0));
        cached.tags("team/app").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        cached.tags("team/app").unwrap();
        assert_eq!(cached.inner.call_count(), 2);
    }

    #[test]
    fn missing_repository_fails_the_build() {
        let registry = InMemoryRegistry::new();
        assert!(repository_images(&registry, "ghost/app").is_err());
    }
}
