//! The repository manifest: everything a repository's on-disk format pins.
//!
//! Written once at init, read at open, never rewritten. Chunker parameters
//! live here (not in client config) so every client of a repository produces
//! identical chunk boundaries, and the KDF salt lives here in cleartext so
//! any client holding the passphrase can derive the seal key.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parapet_protocol::ManifestInfo;
use parapet_types::{ParapetError, Result};

use crate::chunker::CHUNKER_FORMAT_VERSION;
use crate::compress::COMPRESS_FORMAT_VERSION;
use crate::config::ChunkerConfig;
use crate::crypto::{self, CRYPTO_FORMAT_VERSION, SALT_LEN};

pub const MANIFEST_FORMAT_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub chunker_format: u32,
    pub crypto_format: u32,
    pub compress_format: u32,
    pub chunker: ChunkerConfig,
    pub kdf_salt: Vec<u8>,
    pub kdf_iterations: u32,
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    /// Build a fresh manifest with a random salt.
    pub fn new(chunker: ChunkerConfig) -> Result<Self> {
        chunker.validate()?;
        Ok(Manifest {
            format_version: MANIFEST_FORMAT_VERSION,
            chunker_format: CHUNKER_FORMAT_VERSION,
            crypto_format: CRYPTO_FORMAT_VERSION,
            compress_format: COMPRESS_FORMAT_VERSION,
            chunker,
            kdf_salt: crypto::generate_salt().to_vec(),
            kdf_iterations: crypto::DEFAULT_KDF_ITERATIONS,
            created_at: Utc::now(),
        })
    }

    /// Persist to `<repo_root>/manifest`. Refuses to overwrite.
    pub fn write(&self, repo_root: &Path) -> Result<()> {
        let path = repo_root.join(MANIFEST_FILE);
        if path.exists() {
            return Err(ParapetError::Config(format!(
                "manifest already exists at '{}'",
                path.display()
            )));
        }
        let data = rmp_serde::to_vec(self)?;
        fs::write(&path, data)?;
        Ok(())
    }

    /// Load from `<repo_root>/manifest` and validate format versions.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = repo_root.join(MANIFEST_FILE);
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ParapetError::NotFound(format!(
                    "repository manifest at '{}'",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let manifest: Manifest = rmp_serde::from_slice(&data)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.format_version != MANIFEST_FORMAT_VERSION {
            return Err(ParapetError::UnsupportedVersion(self.format_version));
        }
        if self.chunker_format != CHUNKER_FORMAT_VERSION {
            return Err(ParapetError::UnsupportedVersion(self.chunker_format));
        }
        if self.crypto_format != CRYPTO_FORMAT_VERSION {
            return Err(ParapetError::UnsupportedVersion(self.crypto_format));
        }
        if self.compress_format != COMPRESS_FORMAT_VERSION {
            return Err(ParapetError::UnsupportedVersion(self.compress_format));
        }
        if self.kdf_salt.len() != SALT_LEN {
            return Err(ParapetError::Config(format!(
                "manifest salt has {} bytes, expected {SALT_LEN}",
                self.kdf_salt.len()
            )));
        }
        self.chunker.validate()
    }

    pub fn salt(&self) -> [u8; SALT_LEN] {
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&self.kdf_salt);
        salt
    }

    /// The subset of the manifest a client needs, carried in the hello frame.
    pub fn info(&self) -> ManifestInfo {
        ManifestInfo {
            chunker_format: self.chunker_format,
            crypto_format: self.crypto_format,
            compress_format: self.compress_format,
            window: self.chunker.window,
            min_size: self.chunker.min_size,
            avg_size: self.chunker.avg_size,
            max_size: self.chunker.max_size,
            kdf_salt: self.kdf_salt.clone(),
            kdf_iterations: self.kdf_iterations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::new(ChunkerConfig::default()).unwrap();
        manifest.write(dir.path()).unwrap();

        let loaded = Manifest::load(dir.path()).unwrap();
        assert_eq!(loaded.kdf_salt, manifest.kdf_salt);
        assert_eq!(loaded.chunker, manifest.chunker);
        assert_eq!(loaded.kdf_iterations, manifest.kdf_iterations);
    }

    #[test]
    fn write_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::new(ChunkerConfig::default()).unwrap();
        manifest.write(dir.path()).unwrap();
        assert!(manifest.write(dir.path()).is_err());
    }

    #[test]
    fn load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Manifest::load(dir.path()),
            Err(ParapetError::NotFound(_))
        ));
    }

    #[test]
    fn unknown_format_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::new(ChunkerConfig::default()).unwrap();
        manifest.format_version = 99;
        let data = rmp_serde::to_vec(&manifest).unwrap();
        std::fs::write(dir.path().join("manifest"), data).unwrap();
        assert!(matches!(
            Manifest::load(dir.path()),
            Err(ParapetError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn fresh_manifests_have_distinct_salts() {
        let a = Manifest::new(ChunkerConfig::default()).unwrap();
        let b = Manifest::new(ChunkerConfig::default()).unwrap();
        assert_ne!(a.kdf_salt, b.kdf_salt);
    }
}
