//! Retention-driven garbage collection and the repository audit.
//!
//! GC runs under the catalog write lock in two phases. Phase A expires
//! versions older than the retention horizon, always keeping the newest
//! version of every path. Phase B sweeps chunks whose refcount reached zero,
//! deleting the catalog row *before* the block file: a crash between the two
//! leaves a dangling file for a later audit to reclaim, never a dangling row
//! referencing a missing block.

use std::collections::{HashMap, HashSet};

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use parapet_types::{ChunkHash, ParapetError, Result};

use crate::blockstore::BlockStore;
use crate::catalog::Catalog;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub expired_versions: u64,
    pub freed_blocks: u64,
    pub freed_bytes: u64,
}

/// Expire versions beyond `retention_days` and sweep unreferenced blocks.
/// In dry-run mode the projected result is computed without any mutation.
pub fn run(
    catalog: &mut Catalog,
    store: &BlockStore,
    retention_days: u32,
    dry_run: bool,
) -> Result<GcStats> {
    let cutoff_us = (Utc::now() - Duration::days(retention_days as i64)).timestamp_micros();
    let candidates = catalog.expired_versions(cutoff_us)?;

    if dry_run {
        return project(catalog, &candidates);
    }

    let mut stats = GcStats::default();

    // Phase A: version expiry, one transaction per version.
    for version in &candidates {
        catalog.expire_version(version.version_id)?;
        stats.expired_versions += 1;
        debug!(
            path = %version.path,
            version_id = %version.version_id,
            "expired version"
        );
    }

    // Phase B: block sweep.
    for chunk in catalog.zero_ref_chunks()? {
        catalog.remove_chunk_row(&chunk.chunk_hash)?;
        match store.unlink(&chunk.chunk_hash) {
            Ok(()) => {
                stats.freed_blocks += 1;
                stats.freed_bytes += chunk.stored_size;
            }
            Err(ParapetError::NotFound(_)) => {
                // Crash leftover from an earlier interrupted sweep.
                warn!(hash = %chunk.chunk_hash, "sweep repair: block already gone");
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        expired = stats.expired_versions,
        freed_blocks = stats.freed_blocks,
        freed_bytes = stats.freed_bytes,
        "gc complete"
    );
    Ok(stats)
}

/// Compute what a real run would free, without mutating anything.
fn project(catalog: &Catalog, candidates: &[crate::catalog::VersionRow]) -> Result<GcStats> {
    let mut stats = GcStats {
        expired_versions: candidates.len() as u64,
        ..Default::default()
    };

    // References each expired version holds, per chunk.
    let mut dropped_refs: HashMap<ChunkHash, u64> = HashMap::new();
    for version in candidates {
        for vc in catalog.version_chunks(version.version_id)? {
            *dropped_refs.entry(vc.chunk_hash).or_default() += 1;
        }
    }

    for (hash, dropped) in &dropped_refs {
        if let Some(chunk) = catalog.chunk_by_hash(hash)? {
            if chunk.refcount <= *dropped {
                stats.freed_blocks += 1;
                stats.freed_bytes += chunk.stored_size;
            }
        }
    }

    // Chunks already at refcount zero would be swept too.
    for chunk in catalog.zero_ref_chunks()? {
        if !dropped_refs.contains_key(&chunk.chunk_hash) {
            stats.freed_blocks += 1;
            stats.freed_bytes += chunk.stored_size;
        }
    }

    Ok(stats)
}

/// What the audit found. A chunk row with no backing block is an integrity
/// violation; an orphan block is merely reclaimable space.
#[derive(Debug, Default)]
pub struct AuditReport {
    /// Blocks on disk with no chunk row: reclaimable.
    pub orphan_blocks: Vec<ChunkHash>,
    /// Chunk rows with no backing block: should never happen.
    pub missing_blocks: Vec<ChunkHash>,
    /// `(hash, stored_refcount, actual_refcount)` where the stored count
    /// disagrees with `version_chunks`.
    pub refcount_drift: Vec<(ChunkHash, u64, u64)>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_blocks.is_empty()
            && self.missing_blocks.is_empty()
            && self.refcount_drift.is_empty()
    }

    /// Fold the report into a result. Missing blocks and refcount drift are
    /// fatal; orphan blocks are merely reclaimable.
    pub fn into_result(self) -> Result<AuditReport> {
        if !self.missing_blocks.is_empty() {
            return Err(ParapetError::IntegrityViolation(format!(
                "{} chunk row(s) have no backing block (first: {})",
                self.missing_blocks.len(),
                self.missing_blocks[0]
            )));
        }
        if !self.refcount_drift.is_empty() {
            let (hash, stored, actual) = &self.refcount_drift[0];
            return Err(ParapetError::IntegrityViolation(format!(
                "{} chunk row(s) have drifted refcounts (first: {hash} stored={stored} actual={actual})",
                self.refcount_drift.len()
            )));
        }
        Ok(self)
    }
}

/// Cross-check the block store against the catalog.
pub fn audit(catalog: &Catalog, store: &BlockStore) -> Result<AuditReport> {
    let catalog_hashes: HashSet<ChunkHash> = catalog.all_chunk_hashes()?.into_iter().collect();
    let disk_hashes: HashSet<ChunkHash> = store.iter()?.into_iter().collect();

    let mut report = AuditReport {
        orphan_blocks: disk_hashes.difference(&catalog_hashes).copied().collect(),
        missing_blocks: catalog_hashes.difference(&disk_hashes).copied().collect(),
        refcount_drift: catalog.refcount_drift()?,
    };
    report.orphan_blocks.sort();
    report.missing_blocks.sort();

    if !report.orphan_blocks.is_empty() {
        info!(count = report.orphan_blocks.len(), "audit: reclaimable orphan blocks");
    }
    for (hash, stored, actual) in &report.refcount_drift {
        warn!(%hash, stored, actual, "audit: refcount drift");
    }
    Ok(report)
}
