pub mod manifest;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use parapet_types::{ParapetError, Result};

use crate::blockstore::BlockStore;
use crate::catalog::Catalog;
use crate::config::ChunkerConfig;

use self::manifest::Manifest;

const TMP_DIR: &str = "tmp";

/// An opened repository: manifest, block store, and catalog, constructed at
/// startup and passed by reference to every RPC handler.
///
/// The agent holds no key material: clients seal records before upload and
/// the server stores them opaque, so a compromised backup host cannot read
/// or silently rewrite history.
pub struct Repository {
    pub root: PathBuf,
    pub manifest: Manifest,
    pub store: BlockStore,
    pub catalog: Catalog,
}

impl Repository {
    /// Initialize a new repository directory.
    pub fn init(root: &Path, chunker: ChunkerConfig) -> Result<Self> {
        if root.join("manifest").exists() {
            return Err(ParapetError::Config(format!(
                "repository already exists at '{}'",
                root.display()
            )));
        }
        fs::create_dir_all(root)?;
        fs::create_dir_all(root.join(TMP_DIR))?;

        let manifest = Manifest::new(chunker)?;
        manifest.write(root)?;
        let store = BlockStore::create(root)?;
        let catalog = Catalog::open(root)?;

        info!(root = %root.display(), "initialized repository");
        Ok(Repository {
            root: root.to_path_buf(),
            manifest,
            store,
            catalog,
        })
    }

    /// Open an existing repository.
    pub fn open(root: &Path) -> Result<Self> {
        let manifest = Manifest::load(root)?;
        let store = BlockStore::open(root)?;
        let catalog = Catalog::open(root)?;
        Ok(Repository {
            root: root.to_path_buf(),
            manifest,
            store,
            catalog,
        })
    }

    /// Staging directory for restore-to-staging output.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = dir.path().join("repo");
        Repository::init(&repo_root, ChunkerConfig::default()).unwrap();

        assert!(repo_root.join("manifest").is_file());
        assert!(repo_root.join("catalog.db").is_file());
        assert!(repo_root.join("blocks").is_dir());
        assert!(repo_root.join("tmp").is_dir());
    }

    #[test]
    fn init_refuses_existing_repo() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = dir.path().join("repo");
        Repository::init(&repo_root, ChunkerConfig::default()).unwrap();
        assert!(Repository::init(&repo_root, ChunkerConfig::default()).is_err());
    }

    #[test]
    fn open_round_trips_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = dir.path().join("repo");
        let created = Repository::init(&repo_root, ChunkerConfig::default()).unwrap();
        let salt = created.manifest.kdf_salt.clone();
        drop(created);

        let opened = Repository::open(&repo_root).unwrap();
        assert_eq!(opened.manifest.kdf_salt, salt);
    }

    #[test]
    fn open_missing_repo_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Repository::open(&dir.path().join("nowhere")).is_err());
    }
}
