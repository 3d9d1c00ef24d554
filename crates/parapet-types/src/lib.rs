pub mod chunk_hash;
pub mod error;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use chunk_hash::ChunkHash;
pub use error::{ParapetError, Result};

/// Monotonic identifier of a committed version, assigned by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionId(pub i64);

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a version records about the watched file at its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Modified,
    Deleted,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Modified => "modified",
            Action::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Action::Created),
            "modified" => Some(Action::Modified),
            "deleted" => Some(Action::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_str_roundtrip() {
        for action in [Action::Created, Action::Modified, Action::Deleted] {
            assert_eq!(Action::from_str(action.as_str()), Some(action));
        }
        assert_eq!(Action::from_str("renamed"), None);
    }
}
