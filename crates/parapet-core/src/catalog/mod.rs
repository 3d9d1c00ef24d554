//! The metadata catalog: files, versions, chunks, and the version→chunk graph.
//!
//! A single SQLite database in WAL mode. One writer connection serializes all
//! mutations; read-only connections (see [`Catalog::open_reader`]) serve the
//! agent's reader pool concurrently. Every mutation runs inside a transaction
//! so a crash leaves either all of {version, version_chunks, refcounts} or
//! none.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, warn};

use parapet_protocol::{ChunkSpec, RepoStats};
use parapet_types::{Action, ChunkHash, ParapetError, Result, VersionId};

use crate::blockstore::BlockStore;
use crate::compress::FLAG_GZIP;

const COMMIT_RETRY_LIMIT: u32 = 3;

/// One row of `files`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRow {
    pub path: String,
    pub first_seen_at_us: i64,
    pub last_action: Action,
    pub current_size: u64,
}

/// One row of `versions`. Immutable after insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRow {
    pub version_id: VersionId,
    pub path: String,
    pub timestamp_us: i64,
    pub action: Action,
    pub plain_size: u64,
    pub stored_size: u64,
    pub is_compressed: bool,
    pub content_hash: Option<ChunkHash>,
}

/// One row of `chunks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRow {
    pub chunk_hash: ChunkHash,
    pub plain_size: u64,
    pub stored_size: u64,
    pub refcount: u64,
    pub created_at_us: i64,
}

/// One row of `version_chunks`, ordered by `sequence` within a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionChunkRow {
    pub sequence: u32,
    pub chunk_hash: ChunkHash,
    pub offset: u64,
    pub length: u32,
}

fn db_err(e: rusqlite::Error) -> ParapetError {
    ParapetError::Catalog(e.to_string())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn open_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "NORMAL").map_err(db_err)?;
    conn.pragma_update(None, "foreign_keys", "ON").map_err(db_err)?;
    Ok(())
}

/// Writer handle. Exactly one exists per repository; the agent funnels every
/// mutating RPC through it.
pub struct Catalog {
    conn: Connection,
    db_path: PathBuf,
}

/// Read-only handle for concurrent readers.
pub struct CatalogReader {
    conn: Connection,
}

impl Catalog {
    /// Open (creating if needed) the catalog at `<repo_root>/catalog.db`.
    pub fn open(repo_root: &Path) -> Result<Self> {
        let db_path = repo_root.join("catalog.db");
        let conn = Connection::open(&db_path).map_err(db_err)?;
        open_pragmas(&conn)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                path TEXT PRIMARY KEY,
                first_seen_at_us INTEGER NOT NULL,
                last_action TEXT NOT NULL CHECK (last_action IN ('created','modified','deleted')),
                current_size INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS versions (
                version_id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL REFERENCES files(path),
                timestamp_us INTEGER NOT NULL,
                action TEXT NOT NULL CHECK (action IN ('created','modified','deleted')),
                plain_size INTEGER NOT NULL,
                stored_size INTEGER NOT NULL,
                is_compressed INTEGER NOT NULL DEFAULT 0,
                content_hash BLOB,
                UNIQUE (path, timestamp_us)
            );
            CREATE TABLE IF NOT EXISTS chunks (
                chunk_hash BLOB PRIMARY KEY,
                plain_size INTEGER NOT NULL,
                stored_size INTEGER NOT NULL,
                refcount INTEGER NOT NULL DEFAULT 0,
                created_at_us INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS version_chunks (
                version_id INTEGER NOT NULL REFERENCES versions(version_id),
                sequence INTEGER NOT NULL,
                chunk_hash BLOB NOT NULL REFERENCES chunks(chunk_hash),
                offset INTEGER NOT NULL,
                length INTEGER NOT NULL,
                PRIMARY KEY (version_id, sequence)
            );
            CREATE INDEX IF NOT EXISTS idx_version_chunks_hash
                ON version_chunks (chunk_hash);",
        )
        .map_err(db_err)?;
        Ok(Catalog { conn, db_path })
    }

    /// Open an additional read-only connection for a reader-pool worker.
    pub fn open_reader(&self) -> Result<CatalogReader> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(db_err)?;
        Ok(CatalogReader { conn })
    }

    /// Commit a new version in one transaction: resolve the file row, insert
    /// the version, verify and reference every chunk, update the file state.
    ///
    /// A non-delete commit whose content hash equals the path's newest
    /// version is accepted as a no-op and returns the existing version id.
    pub fn commit_version(
        &mut self,
        store: &BlockStore,
        path: &str,
        action: Action,
        plain_size: u64,
        content_hash: Option<ChunkHash>,
        chunks: &[ChunkSpec],
    ) -> Result<VersionId> {
        if action == Action::Deleted {
            if !chunks.is_empty() || content_hash.is_some() {
                return Err(ParapetError::Config(
                    "delete commits carry no chunks and no content hash".into(),
                ));
            }
        } else if content_hash.is_none() {
            return Err(ParapetError::Config(
                "non-delete commits require a content hash".into(),
            ));
        }

        // Unchanged content: nothing to record.
        if action != Action::Deleted {
            if let Some(latest) = latest_version(&self.conn, path)? {
                if latest.action != Action::Deleted && latest.content_hash == content_hash {
                    debug!(path, version_id = %latest.version_id, "content unchanged, commit is a no-op");
                    return Ok(latest.version_id);
                }
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_commit(store, path, action, plain_size, content_hash, chunks) {
                Err(ParapetError::CatalogConflict(msg)) if attempt < COMMIT_RETRY_LIMIT => {
                    warn!(path, attempt, "timestamp collision, regenerating: {msg}");
                    continue;
                }
                other => return other,
            }
        }
    }

    fn try_commit(
        &mut self,
        store: &BlockStore,
        path: &str,
        action: Action,
        plain_size: u64,
        content_hash: Option<ChunkHash>,
        chunks: &[ChunkSpec],
    ) -> Result<VersionId> {
        let tx = self.conn.transaction().map_err(db_err)?;
        let now_us = Utc::now().timestamp_micros();

        // Timestamps are monotonic within a path: bump past the newest
        // existing version if the clock has not moved.
        let newest_ts: Option<i64> = tx
            .query_row(
                "SELECT MAX(timestamp_us) FROM versions WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let timestamp_us = match newest_ts {
            Some(ts) if ts >= now_us => ts + 1,
            _ => now_us,
        };

        // Resolve or create the file row; tombstoned files are revived by a
        // non-delete commit.
        let existing: Option<String> = tx
            .query_row(
                "SELECT path FROM files WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if existing.is_none() {
            tx.execute(
                "INSERT INTO files (path, first_seen_at_us, last_action, current_size)
                 VALUES (?1, ?2, ?3, ?4)",
                params![path, timestamp_us, action.as_str(), plain_size],
            )
            .map_err(db_err)?;
        }

        let insert = tx.execute(
            "INSERT INTO versions
                 (path, timestamp_us, action, plain_size, stored_size, is_compressed, content_hash)
             VALUES (?1, ?2, ?3, ?4, 0, 0, ?5)",
            params![
                path,
                timestamp_us,
                action.as_str(),
                plain_size,
                content_hash.map(|h| h.0.to_vec()),
            ],
        );
        if let Err(e) = insert {
            if is_unique_violation(&e) {
                return Err(ParapetError::CatalogConflict(format!(
                    "version ({path}, {timestamp_us}) already exists"
                )));
            }
            return Err(db_err(e));
        }
        let version_id = VersionId(tx.last_insert_rowid());

        let mut stored_size: u64 = 0;
        let mut any_compressed = false;
        for spec in chunks {
            // The client owes every referenced block before committing.
            if !store.exists(&spec.hash)? {
                return Err(ParapetError::MissingBlock(spec.hash));
            }
            let block_len = store.stored_size(&spec.hash)?;
            let flag = store.record_flag(&spec.hash)?;
            any_compressed |= flag == FLAG_GZIP;
            stored_size += block_len;

            tx.execute(
                "INSERT INTO chunks (chunk_hash, plain_size, stored_size, refcount, created_at_us)
                 VALUES (?1, ?2, ?3, 0, ?4)
                 ON CONFLICT (chunk_hash) DO NOTHING",
                params![spec.hash.0.to_vec(), spec.length, block_len, now_us],
            )
            .map_err(db_err)?;
            tx.execute(
                "INSERT INTO version_chunks (version_id, sequence, chunk_hash, offset, length)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    version_id.0,
                    spec.sequence,
                    spec.hash.0.to_vec(),
                    spec.offset,
                    spec.length
                ],
            )
            .map_err(db_err)?;
            tx.execute(
                "UPDATE chunks SET refcount = refcount + 1 WHERE chunk_hash = ?1",
                params![spec.hash.0.to_vec()],
            )
            .map_err(db_err)?;
        }

        tx.execute(
            "UPDATE versions SET stored_size = ?2, is_compressed = ?3 WHERE version_id = ?1",
            params![version_id.0, stored_size, any_compressed],
        )
        .map_err(db_err)?;

        let current_size = if action == Action::Deleted { 0 } else { plain_size };
        tx.execute(
            "UPDATE files SET last_action = ?2, current_size = ?3 WHERE path = ?1",
            params![path, action.as_str(), current_size],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        debug!(path, version_id = version_id.0, chunks = chunks.len(), "committed version");
        Ok(version_id)
    }

    /// Remove one version, decrementing the refcount of every chunk it
    /// referenced. Blocks whose refcount reaches zero stay on disk until the
    /// next GC sweep.
    pub fn delete_version(&mut self, version_id: VersionId) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        drop_version_tx(&tx, version_id)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    /// Versions strictly older than `cutoff_us`, never including the newest
    /// version of any path (so no file becomes unrecoverable).
    pub fn expired_versions(&self, cutoff_us: i64) -> Result<Vec<VersionRow>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT version_id, path, timestamp_us, action, plain_size, stored_size,
                        is_compressed, content_hash
                 FROM versions v
                 WHERE timestamp_us < ?1
                   AND timestamp_us < (SELECT MAX(timestamp_us)
                                       FROM versions
                                       WHERE path = v.path)
                 ORDER BY path, timestamp_us",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![cutoff_us], version_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Drop an expired version inside its own transaction (GC phase A).
    pub fn expire_version(&mut self, version_id: VersionId) -> Result<()> {
        self.delete_version(version_id)
    }

    /// Chunks whose refcount has reached zero (GC phase B candidates).
    pub fn zero_ref_chunks(&self) -> Result<Vec<ChunkRow>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT chunk_hash, plain_size, stored_size, refcount, created_at_us
                 FROM chunks WHERE refcount = 0",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], chunk_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Delete one chunk row. The block file is unlinked afterwards, so a
    /// crash between the two leaves an orphan file, never a dangling row.
    pub fn remove_chunk_row(&mut self, hash: &ChunkHash) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        let removed = tx
            .execute(
                "DELETE FROM chunks WHERE chunk_hash = ?1 AND refcount = 0",
                params![hash.0.to_vec()],
            )
            .map_err(db_err)?;
        if removed == 0 {
            return Err(ParapetError::CatalogConflict(format!(
                "chunk {hash} is no longer a sweep candidate"
            )));
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    /// All chunk hashes known to the catalog (audit).
    pub fn all_chunk_hashes(&self) -> Result<Vec<ChunkHash>> {
        all_chunk_hashes(&self.conn)
    }

    /// Recompute every chunk's refcount from `version_chunks` and report
    /// drift as `(hash, stored_refcount, actual_refcount)` for the audit.
    pub fn refcount_drift(&self) -> Result<Vec<(ChunkHash, u64, u64)>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT c.chunk_hash, c.refcount,
                        (SELECT COUNT(*) FROM version_chunks vc
                         WHERE vc.chunk_hash = c.chunk_hash)
                 FROM chunks c",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                let raw: Vec<u8> = row.get(0)?;
                Ok((raw, row.get::<_, u64>(1)?, row.get::<_, u64>(2)?))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .filter(|(_, stored, actual)| stored != actual)
            .map(|(raw, stored, actual)| (hash_from_blob(&raw), stored, actual))
            .collect())
    }

    /// A random sample of non-tombstone versions for reliability checks.
    pub fn sample_versions(&self, sample_size: usize) -> Result<Vec<VersionRow>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!(
                "SELECT {VERSION_COLUMNS} FROM versions
                 WHERE action != 'deleted'
                 ORDER BY RANDOM() LIMIT ?1"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![sample_size as i64], version_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Run SQLite's `PRAGMA integrity_check`. Empty result means healthy.
    pub fn integrity_check(&self) -> Result<Vec<String>> {
        integrity_check(&self.conn)
    }

    /// Raw statement escape hatch for tests that need to corrupt the catalog
    /// on purpose (audit scenarios).
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<usize> {
        self.conn.execute(sql, []).map_err(db_err)
    }

    // Read methods shared with CatalogReader.

    pub fn list_files(&self, prefix: Option<&str>) -> Result<Vec<FileRow>> {
        list_files(&self.conn, prefix)
    }

    pub fn list_versions(&self, path: &str) -> Result<Vec<VersionRow>> {
        list_versions(&self.conn, path)
    }

    pub fn latest_version(&self, path: &str) -> Result<Option<VersionRow>> {
        latest_version(&self.conn, path)
    }

    pub fn version_by_id(&self, version_id: VersionId) -> Result<Option<VersionRow>> {
        version_by_id(&self.conn, version_id)
    }

    pub fn version_chunks(&self, version_id: VersionId) -> Result<Vec<VersionChunkRow>> {
        version_chunks(&self.conn, version_id)
    }

    pub fn chunk_by_hash(&self, hash: &ChunkHash) -> Result<Option<ChunkRow>> {
        chunk_by_hash(&self.conn, hash)
    }

    pub fn stats(&self) -> Result<RepoStats> {
        stats(&self.conn)
    }
}

impl CatalogReader {
    pub fn list_files(&self, prefix: Option<&str>) -> Result<Vec<FileRow>> {
        list_files(&self.conn, prefix)
    }

    pub fn list_versions(&self, path: &str) -> Result<Vec<VersionRow>> {
        list_versions(&self.conn, path)
    }

    pub fn version_by_id(&self, version_id: VersionId) -> Result<Option<VersionRow>> {
        version_by_id(&self.conn, version_id)
    }

    pub fn version_chunks(&self, version_id: VersionId) -> Result<Vec<VersionChunkRow>> {
        version_chunks(&self.conn, version_id)
    }

    pub fn stats(&self) -> Result<RepoStats> {
        stats(&self.conn)
    }

    /// Run SQLite's `PRAGMA integrity_check`. Empty result means healthy.
    pub fn integrity_check(&self) -> Result<Vec<String>> {
        integrity_check(&self.conn)
    }
}

/// Delete a version's chunk references (decrementing refcounts) and the
/// version row itself, inside the caller's transaction.
fn drop_version_tx(tx: &rusqlite::Transaction<'_>, version_id: VersionId) -> Result<()> {
    let exists: Option<i64> = tx
        .query_row(
            "SELECT version_id FROM versions WHERE version_id = ?1",
            params![version_id.0],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if exists.is_none() {
        return Err(ParapetError::NotFound(format!("version {version_id}")));
    }

    // A version can reference the same chunk at several sequences, so
    // decrement by the reference count this version actually holds.
    tx.execute(
        "UPDATE chunks SET refcount = refcount -
             (SELECT COUNT(*) FROM version_chunks vc
              WHERE vc.version_id = ?1 AND vc.chunk_hash = chunks.chunk_hash)
         WHERE chunk_hash IN
             (SELECT chunk_hash FROM version_chunks WHERE version_id = ?1)",
        params![version_id.0],
    )
    .map_err(db_err)?;
    tx.execute(
        "DELETE FROM version_chunks WHERE version_id = ?1",
        params![version_id.0],
    )
    .map_err(db_err)?;
    tx.execute(
        "DELETE FROM versions WHERE version_id = ?1",
        params![version_id.0],
    )
    .map_err(db_err)?;
    Ok(())
}

fn hash_from_blob(raw: &[u8]) -> ChunkHash {
    let mut out = [0u8; 32];
    out.copy_from_slice(&raw[..32]);
    ChunkHash(out)
}

fn action_from_str(s: &str) -> Action {
    Action::from_str(s).unwrap_or(Action::Modified)
}

fn version_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionRow> {
    let action: String = row.get(3)?;
    let hash_blob: Option<Vec<u8>> = row.get(7)?;
    Ok(VersionRow {
        version_id: VersionId(row.get(0)?),
        path: row.get(1)?,
        timestamp_us: row.get(2)?,
        action: action_from_str(&action),
        plain_size: row.get(4)?,
        stored_size: row.get(5)?,
        is_compressed: row.get(6)?,
        content_hash: hash_blob.map(|b| hash_from_blob(&b)),
    })
}

fn chunk_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRow> {
    let raw: Vec<u8> = row.get(0)?;
    Ok(ChunkRow {
        chunk_hash: hash_from_blob(&raw),
        plain_size: row.get(1)?,
        stored_size: row.get(2)?,
        refcount: row.get(3)?,
        created_at_us: row.get(4)?,
    })
}

const VERSION_COLUMNS: &str = "version_id, path, timestamp_us, action, plain_size, stored_size,
                               is_compressed, content_hash";

fn list_files(conn: &Connection, prefix: Option<&str>) -> Result<Vec<FileRow>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT path, first_seen_at_us, last_action, current_size
             FROM files
             WHERE ?1 IS NULL OR path LIKE ?1 || '%'
             ORDER BY path",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![prefix], |row| {
            let action: String = row.get(2)?;
            Ok(FileRow {
                path: row.get(0)?,
                first_seen_at_us: row.get(1)?,
                last_action: action_from_str(&action),
                current_size: row.get(3)?,
            })
        })
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    Ok(rows)
}

fn list_versions(conn: &Connection, path: &str) -> Result<Vec<VersionRow>> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {VERSION_COLUMNS} FROM versions WHERE path = ?1 ORDER BY timestamp_us"
        ))
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![path], version_from_row)
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    Ok(rows)
}

fn latest_version(conn: &Connection, path: &str) -> Result<Option<VersionRow>> {
    conn.query_row(
        &format!(
            "SELECT {VERSION_COLUMNS} FROM versions
             WHERE path = ?1 ORDER BY timestamp_us DESC LIMIT 1"
        ),
        params![path],
        version_from_row,
    )
    .optional()
    .map_err(db_err)
}

fn version_by_id(conn: &Connection, version_id: VersionId) -> Result<Option<VersionRow>> {
    conn.query_row(
        &format!("SELECT {VERSION_COLUMNS} FROM versions WHERE version_id = ?1"),
        params![version_id.0],
        version_from_row,
    )
    .optional()
    .map_err(db_err)
}

fn version_chunks(conn: &Connection, version_id: VersionId) -> Result<Vec<VersionChunkRow>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT sequence, chunk_hash, offset, length
             FROM version_chunks WHERE version_id = ?1 ORDER BY sequence",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![version_id.0], |row| {
            let raw: Vec<u8> = row.get(1)?;
            Ok(VersionChunkRow {
                sequence: row.get(0)?,
                chunk_hash: hash_from_blob(&raw),
                offset: row.get(2)?,
                length: row.get(3)?,
            })
        })
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    Ok(rows)
}

fn chunk_by_hash(conn: &Connection, hash: &ChunkHash) -> Result<Option<ChunkRow>> {
    conn.query_row(
        "SELECT chunk_hash, plain_size, stored_size, refcount, created_at_us
         FROM chunks WHERE chunk_hash = ?1",
        params![hash.0.to_vec()],
        chunk_from_row,
    )
    .optional()
    .map_err(db_err)
}

fn all_chunk_hashes(conn: &Connection) -> Result<Vec<ChunkHash>> {
    let mut stmt = conn
        .prepare_cached("SELECT chunk_hash FROM chunks")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, Vec<u8>>(0))
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    Ok(rows.iter().map(|raw| hash_from_blob(raw)).collect())
}

/// `PRAGMA integrity_check` yields one `ok` row when the database is sound,
/// or one row per problem otherwise. Return only the problems.
fn integrity_check(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA integrity_check").map_err(db_err)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    Ok(rows.into_iter().filter(|line| line != "ok").collect())
}

fn stats(conn: &Connection) -> Result<RepoStats> {
    conn.query_row(
        "SELECT (SELECT COUNT(*) FROM files),
                (SELECT COUNT(*) FROM versions),
                (SELECT COUNT(*) FROM chunks),
                (SELECT COALESCE(SUM(plain_size), 0) FROM versions),
                (SELECT COALESCE(SUM(stored_size), 0) FROM chunks)",
        [],
        |row| {
            Ok(RepoStats {
                file_count: row.get(0)?,
                version_count: row.get(1)?,
                chunk_count: row.get(2)?,
                total_plain_bytes: row.get(3)?,
                total_stored_bytes: row.get(4)?,
            })
        },
    )
    .map_err(db_err)
}
