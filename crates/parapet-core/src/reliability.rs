//! Repository self-checks: host health and sampled record verification.
//!
//! The agent holds no key material, so what it can verify splits in two.
//! Server-side: disk headroom, the catalog's own `PRAGMA integrity_check`,
//! and a structural scan of sampled versions (every referenced block present,
//! sized as recorded, carrying a known codec flag). Client-side, the key
//! holder runs sampled restore-to-sink tests over the normal restore RPC
//! (see `client::verify`), which is what catches a block that bit-rotted to
//! a different value of the same length.

use std::path::Path;

use tracing::{debug, warn};

use parapet_protocol::{HealthInfo, HealthStatus};
use parapet_types::{ParapetError, Result, VersionId};

use crate::blockstore::BlockStore;
use crate::catalog::Catalog;
use crate::compress::{FLAG_GZIP, FLAG_RAW};
use crate::crypto::MIN_RECORD_LEN;

/// Disk-usage thresholds for the health report.
const DISK_WARNING_PERCENT: f64 = 80.0;
const DISK_CRITICAL_PERCENT: f64 = 90.0;

/// Default number of versions the structural scan samples.
pub const DEFAULT_RECORD_SAMPLE: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct DiskUsage {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

/// Filesystem usage for the volume holding `path`.
pub fn disk_usage(path: &Path) -> Option<DiskUsage> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
            return None;
        }
        let frsize = stat.f_frsize as u64;
        let total = stat.f_blocks as u64 * frsize;
        Some(DiskUsage {
            total,
            // Free for unprivileged writers, matching what a backup can use.
            free: stat.f_bavail as u64 * frsize,
            used: total.saturating_sub(stat.f_bfree as u64 * frsize),
        })
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        None
    }
}

/// Build the health snapshot: disk headroom for the repository volume plus
/// the outcome of the catalog's integrity pragma.
pub fn health_check(repo_root: &Path, catalog_errors: Vec<String>) -> HealthInfo {
    let (disk_total_bytes, disk_free_bytes, disk_used_percent, disk_status) =
        match disk_usage(repo_root) {
            Some(usage) if usage.total > 0 => {
                let percent = usage.used as f64 / usage.total as f64 * 100.0;
                let status = if percent > DISK_CRITICAL_PERCENT {
                    HealthStatus::Critical
                } else if percent > DISK_WARNING_PERCENT {
                    HealthStatus::Warning
                } else {
                    HealthStatus::Ok
                };
                (usage.total, usage.free, percent, status)
            }
            _ => (0, 0, 0.0, HealthStatus::Unknown),
        };

    if disk_status == HealthStatus::Critical {
        warn!(
            used_percent = disk_used_percent,
            "repository volume critically full"
        );
    }
    for error in &catalog_errors {
        warn!("catalog integrity: {error}");
    }

    HealthInfo {
        disk_total_bytes,
        disk_free_bytes,
        disk_used_percent,
        disk_status,
        catalog_ok: catalog_errors.is_empty(),
        catalog_errors,
    }
}

/// One version that failed the structural record scan.
#[derive(Debug, Clone)]
pub struct RecordFailure {
    pub path: String,
    pub version_id: VersionId,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct RecordCheckStats {
    pub sampled: u64,
    pub versions_ok: u64,
    pub failures: Vec<RecordFailure>,
}

impl RecordCheckStats {
    /// Fold into a result: any failed version is an integrity violation.
    pub fn into_result(self) -> Result<RecordCheckStats> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            let first = &self.failures[0];
            Err(ParapetError::IntegrityViolation(format!(
                "{} of {} sampled version(s) failed record checks \
                 (first: '{}' version {}: {})",
                self.failures.len(),
                self.sampled,
                first.path,
                first.version_id,
                first.detail
            )))
        }
    }
}

/// Structurally verify a random sample of versions against the block store.
///
/// For every chunk of every sampled version: the block must exist, match the
/// catalog's recorded stored size, be long enough to hold a sealed record,
/// and carry a known codec flag; the chunk lengths must add up to the
/// version's plain size. Content authenticity is the client's check.
pub fn verify_records(
    catalog: &Catalog,
    store: &BlockStore,
    sample_size: usize,
) -> Result<RecordCheckStats> {
    let mut stats = RecordCheckStats::default();

    for version in catalog.sample_versions(sample_size)? {
        stats.sampled += 1;
        match verify_one(catalog, store, &version) {
            Ok(()) => {
                stats.versions_ok += 1;
                debug!(path = %version.path, version_id = %version.version_id, "record check ok");
            }
            Err(detail) => {
                warn!(
                    path = %version.path,
                    version_id = %version.version_id,
                    "record check failed: {detail}"
                );
                stats.failures.push(RecordFailure {
                    path: version.path.clone(),
                    version_id: version.version_id,
                    detail,
                });
            }
        }
    }
    Ok(stats)
}

fn verify_one(
    catalog: &Catalog,
    store: &BlockStore,
    version: &crate::catalog::VersionRow,
) -> std::result::Result<(), String> {
    let chunks = catalog
        .version_chunks(version.version_id)
        .map_err(|e| e.to_string())?;

    let mut reassembled: u64 = 0;
    for vc in &chunks {
        let row = catalog
            .chunk_by_hash(&vc.chunk_hash)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("chunk {} has no catalog row", vc.chunk_hash))?;

        let on_disk = store
            .stored_size(&vc.chunk_hash)
            .map_err(|e| format!("chunk {}: {e}", vc.chunk_hash))?;
        if on_disk != row.stored_size {
            return Err(format!(
                "chunk {}: block is {on_disk} bytes, catalog records {}",
                vc.chunk_hash, row.stored_size
            ));
        }
        if on_disk < MIN_RECORD_LEN as u64 {
            return Err(format!(
                "chunk {}: block of {on_disk} bytes is shorter than a sealed record",
                vc.chunk_hash
            ));
        }
        let flag = store
            .record_flag(&vc.chunk_hash)
            .map_err(|e| format!("chunk {}: {e}", vc.chunk_hash))?;
        if flag != FLAG_RAW && flag != FLAG_GZIP {
            return Err(format!(
                "chunk {}: unknown codec flag {flag:#04x}",
                vc.chunk_hash
            ));
        }
        reassembled += vc.length as u64;
    }

    if reassembled != version.plain_size {
        return Err(format!(
            "chunk lengths add up to {reassembled} bytes, version records {}",
            version.plain_size
        ));
    }
    Ok(())
}
