//! Content-addressed block storage on the agent's filesystem.
//!
//! Layout: `blocks/<aa>/<bb>/<hexhash>` where `aa`/`bb` are the first two
//! hex bytes of the chunk hash. Each file holds exactly one sealed record.
//! Writes land in a `.tmp.`-prefixed file in the destination shard directory,
//! are fsynced, and are atomically renamed into place; the directory is
//! fsynced after the rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use parapet_types::{ChunkHash, ParapetError, Result};

const BLOCKS_DIR: &str = "blocks";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct BlockStore {
    root: PathBuf,
}

impl BlockStore {
    /// Create the block directory tree under a repository root.
    pub fn create(repo_root: &Path) -> Result<Self> {
        let root = repo_root.join(BLOCKS_DIR);
        fs::create_dir_all(&root)?;
        Ok(BlockStore { root })
    }

    /// Open an existing block store.
    pub fn open(repo_root: &Path) -> Result<Self> {
        let root = repo_root.join(BLOCKS_DIR);
        if !root.is_dir() {
            return Err(ParapetError::NotFound(format!(
                "block store at '{}'",
                root.display()
            )));
        }
        Ok(BlockStore { root })
    }

    fn shard_dir(&self, hash: &ChunkHash) -> PathBuf {
        self.root
            .join(hash.shard_prefix())
            .join(hash.subshard_prefix())
    }

    fn block_path(&self, hash: &ChunkHash) -> PathBuf {
        self.shard_dir(hash).join(hash.to_hex())
    }

    /// Store a sealed record under its hash unless one is already present.
    /// Returns whether a write occurred. Safe under concurrent calls for the
    /// same hash: at most one write wins, the rest become no-ops.
    pub fn put_if_absent(&self, hash: &ChunkHash, record: &[u8]) -> Result<bool> {
        let dest = self.block_path(hash);
        if dest.exists() {
            return Ok(false);
        }

        let dir = self.shard_dir(hash);
        fs::create_dir_all(&dir)?;

        let unique = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp = dir.join(format!(".tmp.{}.{}.{}", hash.to_hex(), process::id(), unique));

        let mut file = fs::File::create(&temp)?;
        file.write_all(record)?;
        file.sync_all()?;
        drop(file);

        // A concurrent writer may have won the race while we were writing.
        if dest.exists() {
            let _ = fs::remove_file(&temp);
            return Ok(false);
        }

        if let Err(e) = fs::rename(&temp, &dest) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        fs::File::open(&dir)?.sync_all()?;

        debug!(hash = %hash, bytes = record.len(), "stored block");
        Ok(true)
    }

    /// Fetch a sealed record.
    pub fn get(&self, hash: &ChunkHash) -> Result<Vec<u8>> {
        match fs::read(self.block_path(hash)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ParapetError::NotFound(format!("block {hash}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// On-disk size of a stored record.
    pub fn stored_size(&self, hash: &ChunkHash) -> Result<u64> {
        match fs::metadata(self.block_path(hash)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ParapetError::NotFound(format!("block {hash}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// First byte of a stored record: the sealed record's flags byte.
    pub fn record_flag(&self, hash: &ChunkHash) -> Result<u8> {
        use std::io::Read;
        let mut file = match fs::File::open(self.block_path(hash)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ParapetError::NotFound(format!("block {hash}")))
            }
            Err(e) => return Err(e.into()),
        };
        let mut flag = [0u8; 1];
        file.read_exact(&mut flag).map_err(|_| {
            ParapetError::MalformedRecord(format!("block {hash} is empty"))
        })?;
        Ok(flag[0])
    }

    pub fn exists(&self, hash: &ChunkHash) -> Result<bool> {
        match fs::metadata(self.block_path(hash)) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate every stored hash. Used by the GC audit only.
    pub fn iter(&self) -> Result<Vec<ChunkHash>> {
        let mut hashes = Vec::new();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for subshard in fs::read_dir(shard.path())? {
                let subshard = subshard?;
                if !subshard.file_type()?.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(subshard.path())? {
                    let entry = entry?;
                    if !entry.file_type()?.is_file() {
                        continue;
                    }
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    // Skip abandoned temp files from interrupted writes.
                    if name.starts_with(".tmp.") {
                        continue;
                    }
                    if let Some(hash) = ChunkHash::from_hex(name) {
                        hashes.push(hash);
                    }
                }
            }
        }
        Ok(hashes)
    }

    /// Remove a block. `NotFound` if it does not exist.
    pub fn unlink(&self, hash: &ChunkHash) -> Result<()> {
        match fs::remove_file(self.block_path(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ParapetError::NotFound(format!("block {hash}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, BlockStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::create(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, store) = test_store();
        let hash = ChunkHash::compute(b"block data");
        assert!(store.put_if_absent(&hash, b"sealed bytes").unwrap());
        assert_eq!(store.get(&hash).unwrap(), b"sealed bytes");
    }

    #[test]
    fn second_put_is_noop() {
        let (_dir, store) = test_store();
        let hash = ChunkHash::compute(b"dup");
        assert!(store.put_if_absent(&hash, b"first").unwrap());
        assert!(!store.put_if_absent(&hash, b"second").unwrap());
        assert_eq!(store.get(&hash).unwrap(), b"first");
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, store) = test_store();
        let hash = ChunkHash::compute(b"never stored");
        assert!(matches!(
            store.get(&hash),
            Err(ParapetError::NotFound(_))
        ));
        assert!(!store.exists(&hash).unwrap());
    }

    #[test]
    fn unlink_then_put_restores_block() {
        let (_dir, store) = test_store();
        let hash = ChunkHash::compute(b"cycle");
        store.put_if_absent(&hash, b"record").unwrap();
        store.unlink(&hash).unwrap();
        assert!(!store.exists(&hash).unwrap());
        assert!(store.put_if_absent(&hash, b"record").unwrap());
        assert!(store.exists(&hash).unwrap());
    }

    #[test]
    fn unlink_missing_is_not_found() {
        let (_dir, store) = test_store();
        let hash = ChunkHash::compute(b"ghost");
        assert!(matches!(
            store.unlink(&hash),
            Err(ParapetError::NotFound(_))
        ));
    }

    #[test]
    fn iter_lists_stored_hashes_and_skips_temp_files() {
        let (_dir, store) = test_store();
        let h1 = ChunkHash::compute(b"one");
        let h2 = ChunkHash::compute(b"two");
        store.put_if_absent(&h1, b"1").unwrap();
        store.put_if_absent(&h2, b"2").unwrap();

        // Plant an abandoned temp file where a crashed writer would leave one.
        let shard = store.shard_dir(&h1);
        fs::write(shard.join(".tmp.deadbeef.1.0"), b"junk").unwrap();

        let mut listed = store.iter().unwrap();
        listed.sort();
        let mut expected = vec![h1, h2];
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[test]
    fn blocks_land_in_two_level_shards() {
        let (dir, store) = test_store();
        let hash = ChunkHash::compute(b"sharded");
        store.put_if_absent(&hash, b"x").unwrap();
        let expected = dir
            .path()
            .join("blocks")
            .join(hash.shard_prefix())
            .join(hash.subshard_prefix())
            .join(hash.to_hex());
        assert!(expected.is_file());
    }

    #[test]
    fn concurrent_puts_one_winner() {
        let (_dir, store) = test_store();
        let store = std::sync::Arc::new(store);
        let hash = ChunkHash::compute(b"contended");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || store.put_if_absent(&hash, b"same record").unwrap())
            })
            .collect();
        let wrote: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Every call succeeded; the block is readable; no temp litter remains.
        assert!(wrote.iter().any(|w| *w));
        assert_eq!(store.get(&hash).unwrap(), b"same record");
        let shard = store.shard_dir(&hash);
        let leftovers: Vec<_> = fs::read_dir(shard)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }
}
