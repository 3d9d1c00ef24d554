//! Sampled restore tests: the client-side half of the reliability checks.
//!
//! Only the client holds the seal key, so this is the check that proves
//! history is actually recoverable: pick random versions, restore each one
//! end-to-end through the normal restore RPC into a sink, and let the
//! authentication tag and content hash catch any block that rotted, even to
//! a different value of the same length.

use std::time::Instant;

use rand::seq::SliceRandom;
use tracing::{info, warn};

use parapet_types::{Action, Result, VersionId};

use crate::client::{restore, Connection};
use crate::crypto::Sealer;

/// Default number of versions sampled per run.
pub const DEFAULT_RESTORE_SAMPLE: usize = 5;

#[derive(Debug, Clone)]
pub struct RestoreFailure {
    pub path: String,
    pub version_id: VersionId,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct RestoreTestStats {
    pub total: u64,
    pub ok: u64,
    pub failed: u64,
    pub total_time_ms: u64,
    pub failures: Vec<RestoreFailure>,
}

impl RestoreTestStats {
    /// Fold into a result: any failed restore is an integrity violation.
    pub fn into_result(self) -> Result<RestoreTestStats> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            let first = &self.failures[0];
            Err(parapet_types::ParapetError::IntegrityViolation(format!(
                "{} of {} sampled restore(s) failed \
                 (first: '{}' version {}: {})",
                self.failures.len(),
                self.total,
                first.path,
                first.version_id,
                first.error
            )))
        }
    }
}

/// Restore a random sample of non-tombstone versions into a sink, verifying
/// every block's authentication tag and the whole-file content hash.
pub fn run_sampled_restore_tests(
    conn: &Connection,
    sealer: &Sealer,
    sample_size: usize,
) -> Result<RestoreTestStats> {
    // Every restorable (path, version) pair the repository knows about.
    let mut candidates: Vec<(String, VersionId)> = Vec::new();
    for file in conn.list_files(None)? {
        for version in conn.list_versions(&file.path)? {
            if version.action != Action::Deleted {
                candidates.push((version.path, version.version_id));
            }
        }
    }
    candidates.shuffle(&mut rand::thread_rng());
    candidates.truncate(sample_size);

    let mut stats = RestoreTestStats::default();
    for (path, version_id) in candidates {
        stats.total += 1;
        let started = Instant::now();
        match restore::restore_to_writer(conn, sealer, &path, version_id, &mut std::io::sink()) {
            Ok(restored) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                stats.ok += 1;
                stats.total_time_ms += elapsed_ms;
                info!(
                    %path,
                    %version_id,
                    bytes = restored.bytes,
                    elapsed_ms,
                    "restore test ok"
                );
            }
            Err(e) => {
                warn!(%path, %version_id, "restore test failed: {e}");
                stats.failed += 1;
                stats.failures.push(RestoreFailure {
                    path,
                    version_id,
                    error: e.to_string(),
                });
            }
        }
    }

    info!(
        total = stats.total,
        ok = stats.ok,
        failed = stats.failed,
        "restore tests complete"
    );
    Ok(stats)
}
