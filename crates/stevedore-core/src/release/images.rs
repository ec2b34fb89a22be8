//! The image map: registry state indexed by repository.
//!
//! Built once per release or poll cycle by querying the registry for every
//! unique repository a set of workloads runs. Lookup order within a
//! repository is descending recency as the registry reports it.

use std::collections::BTreeMap;

use crate::image::{ImageDescription, ImageRef};
use crate::policy::match_glob;
use crate::registry::{repository_images, Registry, RegistryError};
use crate::workload::Container;

/// Images per repository, most recently created first.
#[derive(Debug, Clone, Default)]
pub struct ImageMap(BTreeMap<String, Vec<ImageDescription>>);

impl ImageMap {
    /// The images known for a repository, newest first.
    #[must_use]
    pub fn get(&self, repository: &str) -> &[ImageDescription] {
        self.0.get(repository).map_or(&[], Vec::as_slice)
    }

    /// The newest releasable image in a repository whose tag matches the
    /// glob `pattern`.
    ///
    /// An image tagged `latest` (case-insensitive) is never releasable: it
    /// is a rolling alias, and pinning to it would chase a moving target.
    /// Returns `None` when the repository is empty or nothing matches.
    #[must_use]
    pub fn latest_image(&self, repository: &str, pattern: &str) -> Option<&ImageDescription> {
        self.get(repository).iter().find(|image| {
            let tag = image.id.tag();
            !tag.eq_ignore_ascii_case("latest") && match_glob(pattern, tag)
        })
    }
}

/// Builds the image map for every unique repository the given containers
/// run. Any repository failing to list fails the whole build; automated
/// discovery would rather see nothing than act on half a picture.
///
/// # Errors
///
/// Fails when any repository cannot be fetched.
pub fn collect_images<'a>(
    registry: &dyn Registry,
    containers: impl IntoIterator<Item = &'a Container>,
) -> Result<ImageMap, RegistryError> {
    let mut map = BTreeMap::new();
    for container in containers {
        map.entry(container.image.repository()).or_insert_with(Vec::new);
    }
    for (repository, images) in &mut map {
        *images = repository_images(registry, repository)?;
    }
    Ok(ImageMap(map))
}

/// Builds a map containing exactly the given images, verifying each exists
/// in its registry first. Releasing an image nobody pushed would write a
/// broken pin into git.
///
/// # Errors
///
/// Fails when any image cannot be found.
pub fn exact_images(
    registry: &dyn Registry,
    refs: &[ImageRef],
) -> Result<ImageMap, RegistryError> {
    let mut map = BTreeMap::new();
    for image in refs {
        let info = registry.image_info(&image.repository(), image.tag())?;
        map.insert(image.repository(), vec![info]);
    }
    Ok(ImageMap(map))
}
