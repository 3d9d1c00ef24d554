//! Shared wire-format types and constants for parapet client ↔ agent communication.
//!
//! This crate is intentionally minimal: the frame codec, opcode table, request
//! and response DTOs, protocol versioning, and transport-level validation.
//! No storage I/O, no crypto.

pub mod frame;
pub mod messages;

pub use frame::{read_frame, write_frame, Frame, MAX_FRAME_LEN};
pub use messages::*;

/// Current protocol version. Announced by the agent in its hello frame.
pub const PROTOCOL_VERSION: u32 = 1;

/// Minimum protocol version the agent accepts.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Maximum number of hashes in a single probe request.
pub const PROBE_BATCH_LIMIT: usize = 1024;

/// Validate a peer's protocol version. Returns `Err(message)` if incompatible.
pub fn check_protocol_version(version: u32) -> Result<(), String> {
    if version < MIN_PROTOCOL_VERSION {
        return Err(format!(
            "protocol version {version} too old; peer requires >= {MIN_PROTOCOL_VERSION}"
        ));
    }
    if version > PROTOCOL_VERSION {
        return Err(format!(
            "protocol version {version} not supported; peer supports <= {PROTOCOL_VERSION}"
        ));
    }
    Ok(())
}

/// Opcode byte carried in every frame.
///
/// Requests and their successful responses share an opcode; error responses
/// always use [`OpCode::Error`]. [`OpCode::Hello`] is sent once by the agent
/// when a connection opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Error = 0x00,
    Probe = 0x01,
    PutChunk = 0x02,
    GetChunk = 0x03,
    CommitVersion = 0x04,
    ListFiles = 0x05,
    ListVersions = 0x06,
    Restore = 0x07,
    DeleteVersion = 0x08,
    Gc = 0x09,
    Stats = 0x0a,
    Hello = 0x0b,
}

impl OpCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::Error),
            0x01 => Some(Self::Probe),
            0x02 => Some(Self::PutChunk),
            0x03 => Some(Self::GetChunk),
            0x04 => Some(Self::CommitVersion),
            0x05 => Some(Self::ListFiles),
            0x06 => Some(Self::ListVersions),
            0x07 => Some(Self::Restore),
            0x08 => Some(Self::DeleteVersion),
            0x09 => Some(Self::Gc),
            0x0a => Some(Self::Stats),
            0x0b => Some(Self::Hello),
            _ => None,
        }
    }

    /// Whether this request mutates the metadata catalog.
    ///
    /// Catalog writers are serialized on the agent; everything else (including
    /// `put_chunk`, which only touches the concurrency-safe block store) runs
    /// on the reader pool.
    pub fn is_catalog_write(&self) -> bool {
        matches!(
            self,
            OpCode::CommitVersion | OpCode::DeleteVersion | OpCode::Gc
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpCode::Error => "error",
            OpCode::Probe => "probe",
            OpCode::PutChunk => "put_chunk",
            OpCode::GetChunk => "get_chunk",
            OpCode::CommitVersion => "commit_version",
            OpCode::ListFiles => "list_files",
            OpCode::ListVersions => "list_versions",
            OpCode::Restore => "restore",
            OpCode::DeleteVersion => "delete_version",
            OpCode::Gc => "gc",
            OpCode::Stats => "stats",
            OpCode::Hello => "hello",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrip() {
        for op in [
            OpCode::Error,
            OpCode::Probe,
            OpCode::PutChunk,
            OpCode::GetChunk,
            OpCode::CommitVersion,
            OpCode::ListFiles,
            OpCode::ListVersions,
            OpCode::Restore,
            OpCode::DeleteVersion,
            OpCode::Gc,
            OpCode::Stats,
            OpCode::Hello,
        ] {
            assert_eq!(OpCode::from_u8(op as u8), Some(op));
        }
        assert_eq!(OpCode::from_u8(0xff), None);
    }

    #[test]
    fn catalog_write_classification() {
        assert!(OpCode::CommitVersion.is_catalog_write());
        assert!(OpCode::DeleteVersion.is_catalog_write());
        assert!(OpCode::Gc.is_catalog_write());
        assert!(!OpCode::Probe.is_catalog_write());
        assert!(!OpCode::PutChunk.is_catalog_write());
        assert!(!OpCode::Restore.is_catalog_write());
    }

    #[test]
    fn protocol_version_current_accepted() {
        assert!(check_protocol_version(PROTOCOL_VERSION).is_ok());
    }

    #[test]
    fn protocol_version_zero_rejected() {
        assert!(check_protocol_version(0).is_err());
    }

    #[test]
    fn protocol_version_too_new_rejected() {
        let err = check_protocol_version(PROTOCOL_VERSION + 1).unwrap_err();
        assert!(err.contains("not supported"));
    }
}
