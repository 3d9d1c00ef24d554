use thiserror::Error;

use crate::chunk_hash::ChunkHash;

pub type Result<T> = std::result::Result<T, ParapetError>;

#[derive(Debug, Error)]
pub enum ParapetError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("path escapes repository root: '{0}'")]
    PathEscape(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication failed: wrong key or corrupted block")]
    AuthFailure,

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ChunkHash,
        actual: ChunkHash,
    },

    #[error("missing block for chunk {0}")]
    MissingBlock(ChunkHash),

    #[error("catalog conflict: {0}")]
    CatalogConflict(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{opcode} failed on agent: [{kind}] {message}")]
    Remote {
        opcode: &'static str,
        kind: String,
        message: String,
    },

    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
}

impl ParapetError {
    /// Short machine-readable kind name, carried in RPC error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            ParapetError::Config(_) => "config",
            ParapetError::PathEscape(_) => "path_escape",
            ParapetError::NotFound(_) => "not_found",
            ParapetError::AuthFailure => "auth_failure",
            ParapetError::MalformedRecord(_) => "malformed_record",
            ParapetError::HashMismatch { .. } => "hash_mismatch",
            ParapetError::MissingBlock(_) => "missing_block",
            ParapetError::CatalogConflict(_) => "catalog_conflict",
            ParapetError::Catalog(_) => "catalog",
            ParapetError::Transport(_) => "transport",
            ParapetError::RetryExhausted { .. } => "retry_exhausted",
            ParapetError::IntegrityViolation(_) => "integrity_violation",
            ParapetError::Cancelled => "cancelled",
            ParapetError::Remote { .. } => "remote",
            ParapetError::UnknownOpcode(_) => "unknown_opcode",
            ParapetError::UnsupportedVersion(_) => "unsupported_version",
            ParapetError::Io(_) => "io",
            ParapetError::Serialization(_) => "serialization",
            ParapetError::Deserialization(_) => "deserialization",
        }
    }

    /// Whether a failed chunk upload with this error is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            ParapetError::Transport(_) => true,
            ParapetError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ParapetError::Transport("reset".into()).is_transient());
        assert!(ParapetError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timeout"
        ))
        .is_transient());
        assert!(!ParapetError::AuthFailure.is_transient());
        assert!(!ParapetError::PathEscape("../x".into()).is_transient());
        assert!(!ParapetError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied"
        ))
        .is_transient());
    }

    #[test]
    fn error_display_never_leaks_record_bytes() {
        let err = ParapetError::MalformedRecord("record shorter than header".into());
        let msg = err.to_string();
        assert!(msg.contains("malformed record"));
    }
}
