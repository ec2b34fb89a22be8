//! The SSH key ring.
//!
//! The daemon's git identity lives in an orchestrator-managed secret,
//! mounted into the filesystem; the path we are given is typically a
//! symlink into the secret volume. ssh refuses group- or world-readable
//! keys, so the file mode is enforced at 0400. Readers see the current
//! pair; regeneration swaps it atomically under the write lock.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::RwLock;

use thiserror::Error;

/// Mode the private key file must carry.
#[cfg(unix)]
const PRIVATE_KEY_MODE: u32 = 0o400;

/// Errors from key ring operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyRingError {
    /// The identity file is missing or unreadable.
    #[error("reading identity at {path}: {source}")]
    Io {
        /// The path that failed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// ssh-keygen failed.
    #[error("ssh-keygen: {reason}")]
    Keygen {
        /// Trimmed stderr of the failed invocation.
        reason: String,
    },
}

/// The current identity: its public half and where the private half lives.
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// The public key in authorized-keys form.
    pub public_key: String,
    /// Path of the private key file, symlinks resolved.
    pub private_key_path: PathBuf,
}

/// Reader-writer guarded SSH identity.
pub struct KeyRing {
    mount_path: PathBuf,
    data_key: String,
    pair: RwLock<KeyPair>,
}

impl KeyRing {
    /// Loads the identity from `mount_path/data_key`, generating one if the
    /// file does not exist yet, and enforcing the 0400 mode either way.
    ///
    /// # Errors
    ///
    /// Fails when the key cannot be read, generated, or locked down.
    pub fn new(mount_path: impl Into<PathBuf>, data_key: impl Into<String>) -> Result<Self, KeyRingError> {
        let mount_path = mount_path.into();
        let data_key = data_key.into();
        let key_path = mount_path.join(&data_key);
        if !key_path.exists() {
            generate_key(&key_path)?;
        }
        let pair = load_pair(&key_path)?;
        Ok(Self {
            mount_path,
            data_key,
            pair: RwLock::new(pair),
        })
    }

    /// The current key pair.
    #[must_use]
    pub fn key_pair(&self) -> KeyPair {
        self.pair.read().expect("key ring lock").clone()
    }

    /// Generates a fresh identity and swaps it in atomically. Readers see
    /// either the old pair or the new one, never a mix.
    ///
    /// # Errors
    ///
    /// Fails when generation fails; the old pair stays current.
    pub fn regenerate(&self) -> Result<(), KeyRingError> {
        let key_path = self.mount_path.join(&self.data_key);
        let staging = self.mount_path.join(format!("{}.new", self.data_key));
        let _ = std::fs::remove_file(&staging);
        generate_key(&staging)?;
        let fresh = load_pair(&staging)?;

        let mut pair = self.pair.write().expect("key ring lock");
        std::fs::rename(&staging, &key_path).map_err(|e| KeyRingError::Io {
            path: key_path.clone(),
            source: e,
        })?;
        let _ = std::fs::remove_file(staging.with_extension("new.pub"));
        *pair = KeyPair {
            public_key: fresh.public_key,
            private_key_path: key_path,
        };
        Ok(())
    }
}

fn generate_key(path: &Path) -> Result<(), KeyRingError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| KeyRingError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let output = Command::new("ssh-keygen")
        .args(["-q", "-t", "ed25519", "-N", "", "-C", "stevedore", "-f"])
        .arg(path)
        .output()
        .map_err(|e| KeyRingError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
    if !output.status.success() {
        return Err(KeyRingError::Keygen {
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    enforce_mode(path)
}

fn load_pair(key_path: &Path) -> Result<KeyPair, KeyRingError> {
    let resolved = std::fs::canonicalize(key_path).map_err(|e| KeyRingError::Io {
        path: key_path.to_path_buf(),
        source: e,
    })?;
    enforce_mode(&resolved)?;

    let output = Command::new("ssh-keygen")
        .args(["-y", "-f"])
        .arg(&resolved)
        .output()
        .map_err(|e| KeyRingError::Io {
            path: resolved.clone(),
            source: e,
        })?;
    if !output.status.success() {
        return Err(KeyRingError::Keygen {
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(KeyPair {
        public_key: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        private_key_path: resolved,
    })
}

#[cfg(unix)]
fn enforce_mode(path: &Path) -> Result<(), KeyRingError> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = std::fs::metadata(path).map_err(|e| KeyRingError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    if metadata.permissions().mode() & 0o777 != PRIVATE_KEY_MODE {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(PRIVATE_KEY_MODE))
            .map_err(|e| KeyRingError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn enforce_mode(_path: &Path) -> Result<(), KeyRingError> {
    Ok(())
}
