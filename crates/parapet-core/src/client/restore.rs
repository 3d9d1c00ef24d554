//! Client-side restore: consume the streamed sealed records, decrypt,
//! decompress, reassemble in sequence order, and verify the result against
//! the version's recorded content hash.

use std::io::Write;

use sha2::{Digest, Sha256};
use tracing::info;

use parapet_protocol::RestoreEvent;
use parapet_types::{ChunkHash, ParapetError, Result, VersionId};

use crate::client::Connection;
use crate::compress;
use crate::crypto::Sealer;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub chunks: u64,
    pub bytes: u64,
}

/// Restore `(path, version_id)` into `out`, byte-for-byte.
pub fn restore_to_writer(
    conn: &Connection,
    sealer: &Sealer,
    path: &str,
    version_id: VersionId,
    out: &mut dyn Write,
) -> Result<RestoreStats> {
    let stream = conn.restore(path, version_id)?;

    let (total_chunks, plain_size, content_hash) = match stream.next_event()? {
        RestoreEvent::Begin {
            total_chunks,
            plain_size,
            content_hash,
            ..
        } => (total_chunks, plain_size, content_hash),
        _ => {
            return Err(ParapetError::Transport(
                "restore stream did not begin with a header".into(),
            ))
        }
    };

    let mut stats = RestoreStats::default();
    let mut hasher = Sha256::new();
    let mut next_sequence = 0u32;

    loop {
        match stream.next_event()? {
            RestoreEvent::Chunk {
                sequence, record, ..
            } => {
                if sequence != next_sequence {
                    return Err(ParapetError::Transport(format!(
                        "restore stream out of order: expected sequence {next_sequence}, got {sequence}"
                    )));
                }
                next_sequence += 1;

                let (flag, payload) = sealer.open(&record)?;
                let plaintext = compress::decompress(flag, &payload)?;
                hasher.update(&plaintext);
                out.write_all(&plaintext)?;
                stats.chunks += 1;
                stats.bytes += plaintext.len() as u64;
            }
            RestoreEvent::End { .. } => break,
            RestoreEvent::Begin { .. } => {
                return Err(ParapetError::Transport(
                    "restore stream restarted unexpectedly".into(),
                ))
            }
        }
    }

    if stats.chunks != total_chunks as u64 || stats.bytes != plain_size {
        return Err(ParapetError::IntegrityViolation(format!(
            "restore of '{path}' version {version_id} reassembled {} chunks / {} bytes, \
             expected {total_chunks} / {plain_size}",
            stats.chunks, stats.bytes
        )));
    }
    if let Some(expected) = content_hash {
        let digest = hasher.finalize();
        let mut actual = [0u8; 32];
        actual.copy_from_slice(&digest);
        let actual = ChunkHash(actual);
        if actual != expected {
            return Err(ParapetError::HashMismatch { expected, actual });
        }
    }

    out.flush()?;
    info!(path, version_id = %version_id, bytes = stats.bytes, "restored");
    Ok(stats)
}

/// Restore into a byte buffer (small files, tests).
pub fn restore_to_vec(
    conn: &Connection,
    sealer: &Sealer,
    path: &str,
    version_id: VersionId,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    restore_to_writer(conn, sealer, path, version_id, &mut buf)?;
    Ok(buf)
}
