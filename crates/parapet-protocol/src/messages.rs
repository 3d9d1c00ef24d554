//! Request and response DTOs for every RPC.
//!
//! Requests carry a client-assigned `request_id`; responses echo it so the
//! client can pipeline requests and demultiplex responses in any order.

use parapet_types::{Action, ChunkHash, VersionId};
use serde::{Deserialize, Serialize};

// ── Handshake ──────────────────────────────────────────────────────────────

/// Repository parameters a client needs before it can talk to the agent:
/// chunker geometry (to chunk compatibly) and KDF inputs (to derive the seal
/// key from its passphrase). The salt is public by design; the passphrase
/// never crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestInfo {
    pub chunker_format: u32,
    pub crypto_format: u32,
    pub compress_format: u32,
    pub window: u32,
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
    pub kdf_salt: Vec<u8>,
    pub kdf_iterations: u32,
}

/// Sent once by the agent when a connection opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    pub manifest: ManifestInfo,
}

// ── Error envelope ─────────────────────────────────────────────────────────

/// Failure response for any request. `kind` matches `ParapetError::kind()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: u64,
    pub kind: String,
    pub message: String,
}

// ── probe ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub request_id: u64,
    pub hashes: Vec<ChunkHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub request_id: u64,
    /// The subset of requested hashes already present in the block store.
    pub present: Vec<ChunkHash>,
}

// ── put_chunk / get_chunk ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutChunkRequest {
    pub request_id: u64,
    pub hash: ChunkHash,
    /// Sealed record: `flags ‖ nonce ‖ ciphertext ‖ tag`.
    pub record: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutChunkResponse {
    pub request_id: u64,
    /// False when the block already existed and the write was a no-op.
    pub stored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChunkRequest {
    pub request_id: u64,
    pub hash: ChunkHash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChunkResponse {
    pub request_id: u64,
    pub record: Vec<u8>,
}

// ── commit_version ─────────────────────────────────────────────────────────

/// One ordered chunk reference within a version commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub sequence: u32,
    pub hash: ChunkHash,
    pub offset: u64,
    pub length: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitVersionRequest {
    pub request_id: u64,
    pub path: String,
    pub action: Action,
    pub plain_size: u64,
    /// SHA-256 of the whole plaintext file; `None` only for deletes.
    pub content_hash: Option<ChunkHash>,
    /// Empty for deletes.
    pub chunks: Vec<ChunkSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitVersionResponse {
    pub request_id: u64,
    pub version_id: VersionId,
}

// ── list_files / list_versions ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListFilesRequest {
    pub request_id: u64,
    /// Restrict to paths starting with this prefix; `None` lists everything.
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub first_seen_at_us: i64,
    pub last_action: Action,
    pub current_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListFilesResponse {
    pub request_id: u64,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListVersionsRequest {
    pub request_id: u64,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version_id: VersionId,
    pub path: String,
    pub timestamp_us: i64,
    pub action: Action,
    pub plain_size: u64,
    pub stored_size: u64,
    pub is_compressed: bool,
    pub content_hash: Option<ChunkHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListVersionsResponse {
    pub request_id: u64,
    pub versions: Vec<VersionEntry>,
}

// ── restore ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub request_id: u64,
    pub path: String,
    pub version_id: VersionId,
}

/// Streamed restore response: one `Begin`, one `Chunk` per stored block in
/// sequence order, then `End`. The client decrypts and reassembles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RestoreEvent {
    Begin {
        request_id: u64,
        total_chunks: u32,
        plain_size: u64,
        content_hash: Option<ChunkHash>,
    },
    Chunk {
        request_id: u64,
        sequence: u32,
        record: Vec<u8>,
    },
    End {
        request_id: u64,
    },
}

impl RestoreEvent {
    pub fn request_id(&self) -> u64 {
        match self {
            RestoreEvent::Begin { request_id, .. }
            | RestoreEvent::Chunk { request_id, .. }
            | RestoreEvent::End { request_id } => *request_id,
        }
    }
}

// ── delete_version ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteVersionRequest {
    pub request_id: u64,
    pub version_id: VersionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteVersionResponse {
    pub request_id: u64,
}

// ── gc ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcRequest {
    pub request_id: u64,
    pub retention_days: u32,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcResponse {
    pub request_id: u64,
    pub expired_versions: u64,
    pub freed_blocks: u64,
    pub freed_bytes: u64,
}

// ── stats / health ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsRequest {
    pub request_id: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoStats {
    pub file_count: u64,
    pub version_count: u64,
    pub chunk_count: u64,
    /// Sum of plain_size over all versions.
    pub total_plain_bytes: u64,
    /// Sum of stored_size over all chunks (deduplicated, on-disk).
    pub total_stored_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Warning,
    Critical,
    /// Disk usage could not be determined on this platform.
    Unknown,
}

/// Agent-side health snapshot, carried with every stats response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthInfo {
    pub disk_total_bytes: u64,
    pub disk_free_bytes: u64,
    pub disk_used_percent: f64,
    pub disk_status: HealthStatus,
    /// Result of the catalog's `PRAGMA integrity_check`.
    pub catalog_ok: bool,
    /// Messages reported by the integrity check when it is not ok.
    pub catalog_errors: Vec<String>,
}

impl HealthInfo {
    pub fn overall_ok(&self) -> bool {
        self.catalog_ok && self.disk_status != HealthStatus::Critical
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub request_id: u64,
    pub stats: RepoStats,
    pub health: HealthInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{decode_body, encode_body};

    #[test]
    fn commit_request_roundtrip() {
        let req = CommitVersionRequest {
            request_id: 7,
            path: "docs/a.txt".into(),
            action: Action::Modified,
            plain_size: 12,
            content_hash: Some(ChunkHash::compute(b"hello world\n")),
            chunks: vec![ChunkSpec {
                sequence: 0,
                hash: ChunkHash::compute(b"hello world\n"),
                offset: 0,
                length: 12,
            }],
        };
        let body = encode_body(&req).unwrap();
        let back: CommitVersionRequest = decode_body(&body).unwrap();
        assert_eq!(back.request_id, 7);
        assert_eq!(back.path, "docs/a.txt");
        assert_eq!(back.chunks, req.chunks);
    }

    #[test]
    fn restore_event_request_id_accessor() {
        let begin = RestoreEvent::Begin {
            request_id: 3,
            total_chunks: 1,
            plain_size: 10,
            content_hash: None,
        };
        let chunk = RestoreEvent::Chunk {
            request_id: 3,
            sequence: 0,
            record: vec![1, 2, 3],
        };
        let end = RestoreEvent::End { request_id: 3 };
        assert_eq!(begin.request_id(), 3);
        assert_eq!(chunk.request_id(), 3);
        assert_eq!(end.request_id(), 3);
    }

    #[test]
    fn health_info_roundtrip() {
        let health = HealthInfo {
            disk_total_bytes: 1 << 40,
            disk_free_bytes: 1 << 38,
            disk_used_percent: 75.0,
            disk_status: HealthStatus::Ok,
            catalog_ok: true,
            catalog_errors: Vec::new(),
        };
        let body = encode_body(&health).unwrap();
        let back: HealthInfo = decode_body(&body).unwrap();
        assert_eq!(back.disk_status, HealthStatus::Ok);
        assert!(back.overall_ok());
    }

    #[test]
    fn overall_health_requires_catalog_and_disk() {
        let mut health = HealthInfo {
            disk_total_bytes: 100,
            disk_free_bytes: 5,
            disk_used_percent: 95.0,
            disk_status: HealthStatus::Critical,
            catalog_ok: true,
            catalog_errors: Vec::new(),
        };
        assert!(!health.overall_ok());

        health.disk_status = HealthStatus::Warning;
        assert!(health.overall_ok());

        health.catalog_ok = false;
        health.catalog_errors.push("row 17 missing from index".into());
        assert!(!health.overall_ok());
    }

    #[test]
    fn tombstone_commit_has_no_chunks() {
        let req = CommitVersionRequest {
            request_id: 1,
            path: "gone.txt".into(),
            action: Action::Deleted,
            plain_size: 0,
            content_hash: None,
            chunks: Vec::new(),
        };
        let body = encode_body(&req).unwrap();
        let back: CommitVersionRequest = decode_body(&body).unwrap();
        assert!(back.chunks.is_empty());
        assert!(back.content_hash.is_none());
    }
}
