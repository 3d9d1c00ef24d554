//! The delta engine: transfer only the chunks a new version contributes.
//!
//! Chunk the file, probe the agent for hashes it already holds, seal and
//! upload the missing ones with a bounded in-flight window, then commit the
//! full chunk list. A failed upload is retried with exponential backoff; once
//! a chunk exhausts its attempts the whole commit is abandoned and no catalog
//! mutation occurs.

use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use parapet_protocol::ChunkSpec;
use parapet_types::{Action, ChunkHash, ParapetError, Result, VersionId};

use crate::chunker::{chunk_stream, ChunkRef};
use crate::client::{Connection, PendingCall};
use crate::compress;
use crate::crypto::Sealer;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaStats {
    pub chunks_total: u64,
    pub chunks_uploaded: u64,
    pub bytes_total: u64,
    pub bytes_uploaded: u64,
}

/// Wraps a reader, hashing everything read through it. Lets one pass over
/// the file produce both the chunk list and the whole-file content hash.
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Commit one file as a new version of `repo_path`.
pub fn commit_file(
    conn: &Connection,
    sealer: &Sealer,
    repo_path: &str,
    source: &Path,
    action: Action,
) -> Result<(VersionId, DeltaStats)> {
    let chunker = conn.chunker_config();

    // One streaming pass: chunk boundaries plus the whole-file hash.
    let file = File::open(source)?;
    let mut hashing = HashingReader {
        inner: file,
        hasher: Sha256::new(),
    };
    let chunks: Vec<ChunkRef> = chunk_stream(&mut hashing, &chunker).collect::<Result<_>>()?;
    let digest = hashing.hasher.finalize();
    let mut content_hash = [0u8; 32];
    content_hash.copy_from_slice(&digest);
    let content_hash = ChunkHash(content_hash);
    let plain_size: u64 = chunks.iter().map(|c| c.length as u64).sum();

    let mut stats = DeltaStats {
        chunks_total: chunks.len() as u64,
        bytes_total: plain_size,
        ..Default::default()
    };

    // Probe which chunks the repository already holds. Batched internally.
    let unique: Vec<ChunkHash> = {
        let mut seen = HashSet::new();
        chunks
            .iter()
            .map(|c| c.hash)
            .filter(|h| seen.insert(*h))
            .collect()
    };
    let present: HashSet<ChunkHash> = conn.probe(&unique)?.into_iter().collect();

    // Upload missing chunks, pipelined up to the in-flight window. A chunk
    // shared by several boundaries is uploaded once.
    let mut source_file = hashing.inner;
    let try_compress = compress::is_compressible_hint(Some(repo_path));
    let window = conn.config().upload_window.max(1);
    let mut in_flight: VecDeque<(ChunkHash, PendingCall<'_>)> = VecDeque::new();
    let mut queued: HashSet<ChunkHash> = HashSet::new();

    for chunk in &chunks {
        if present.contains(&chunk.hash) || queued.contains(&chunk.hash) {
            continue;
        }
        let record = seal_chunk(sealer, &mut source_file, chunk, try_compress)?;
        stats.chunks_uploaded += 1;
        stats.bytes_uploaded += chunk.length as u64;
        queued.insert(chunk.hash);

        if in_flight.len() >= window {
            let (hash, call) = in_flight.pop_front().expect("window is non-empty");
            settle_upload(conn, sealer, &mut source_file, &chunks, hash, call, try_compress)?;
        }
        in_flight.push_back((chunk.hash, conn.put_chunk_start(chunk.hash, record)?));
    }
    while let Some((hash, call)) = in_flight.pop_front() {
        settle_upload(conn, sealer, &mut source_file, &chunks, hash, call, try_compress)?;
    }

    let specs: Vec<ChunkSpec> = chunks
        .iter()
        .enumerate()
        .map(|(sequence, c)| ChunkSpec {
            sequence: sequence as u32,
            hash: c.hash,
            offset: c.offset,
            length: c.length as u32,
        })
        .collect();

    let version_id = conn.commit_version(repo_path, action, plain_size, Some(content_hash), specs)?;
    info!(
        path = repo_path,
        version_id = %version_id,
        uploaded = stats.chunks_uploaded,
        total = stats.chunks_total,
        "committed version"
    );
    Ok((version_id, stats))
}

/// Commit a tombstone recording that `repo_path` was removed.
pub fn commit_delete(conn: &Connection, repo_path: &str) -> Result<VersionId> {
    let version_id = conn.commit_version(repo_path, Action::Deleted, 0, None, Vec::new())?;
    info!(path = repo_path, version_id = %version_id, "committed tombstone");
    Ok(version_id)
}

/// Read a chunk's plaintext range and produce its sealed record.
fn seal_chunk(
    sealer: &Sealer,
    file: &mut File,
    chunk: &ChunkRef,
    try_compress: bool,
) -> Result<Vec<u8>> {
    let mut plaintext = vec![0u8; chunk.length];
    file.seek(SeekFrom::Start(chunk.offset))?;
    file.read_exact(&mut plaintext)?;

    // The file changed underneath us if the bytes no longer match; the
    // debouncer will deliver another event, so fail this commit cleanly.
    let actual = ChunkHash::compute(&plaintext);
    if actual != chunk.hash {
        return Err(ParapetError::HashMismatch {
            expected: chunk.hash,
            actual,
        });
    }

    let (flag, payload) = compress::compress(&plaintext, try_compress)?;
    sealer.seal(flag, &payload)
}

/// Wait for a pipelined upload; on transient failure re-upload this chunk
/// synchronously with exponential backoff.
fn settle_upload(
    conn: &Connection,
    sealer: &Sealer,
    file: &mut File,
    chunks: &[ChunkRef],
    hash: ChunkHash,
    call: PendingCall<'_>,
    try_compress: bool,
) -> Result<()> {
    match Connection::put_chunk_finish(call) {
        Ok(_) => Ok(()),
        Err(first_err) if first_err.is_transient() => {
            warn!(%hash, "chunk upload failed, retrying: {first_err}");
            let chunk = chunks
                .iter()
                .find(|c| c.hash == hash)
                .expect("settled hash comes from this chunk list");
            retry_upload(conn, sealer, file, chunk, try_compress, first_err)
        }
        Err(e) => Err(e),
    }
}

/// Synchronous retry loop: base 250 ms, doubling, capped, bounded attempts.
fn retry_upload(
    conn: &Connection,
    sealer: &Sealer,
    file: &mut File,
    chunk: &ChunkRef,
    try_compress: bool,
    first_err: ParapetError,
) -> Result<()> {
    let cfg = conn.config();
    let mut delay_ms = cfg.retry_base_ms;
    let mut last_err = first_err;

    // Attempt 1 was the pipelined upload that already failed.
    for attempt in 2..=cfg.retry_attempts {
        std::thread::sleep(Duration::from_millis(delay_ms));
        delay_ms = (delay_ms * 2).min(cfg.retry_cap_ms);

        let record = seal_chunk(sealer, file, chunk, try_compress)?;
        match conn.put_chunk(chunk.hash, record) {
            Ok(_) => {
                debug!(hash = %chunk.hash, attempt, "chunk upload recovered");
                return Ok(());
            }
            Err(e) if e.is_transient() => {
                warn!(hash = %chunk.hash, attempt, "chunk upload failed again: {e}");
                last_err = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(ParapetError::RetryExhausted {
        attempts: cfg.retry_attempts,
        last: last_err.to_string(),
    })
}
