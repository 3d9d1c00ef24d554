pub mod agent;
pub mod blockstore;
pub mod catalog;
pub mod chunker;
pub mod client;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod gc;
pub mod paths;
pub mod reliability;
pub mod repo;

pub use parapet_protocol::{HealthInfo, HealthStatus, RepoStats};
pub use parapet_types::{Action, ChunkHash, ParapetError, Result, VersionId};

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
