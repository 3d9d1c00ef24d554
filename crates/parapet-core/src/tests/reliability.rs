use parapet_protocol::{ChunkSpec, HealthStatus};
use parapet_types::{Action, ChunkHash, ParapetError};

use crate::blockstore::BlockStore;
use crate::catalog::Catalog;
use crate::compress::FLAG_RAW;
use crate::reliability;

struct Fixture {
    dir: tempfile::TempDir,
    catalog: Catalog,
    store: BlockStore,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    let store = BlockStore::create(dir.path()).unwrap();
    Fixture {
        dir,
        catalog,
        store,
    }
}

fn put_block(store: &BlockStore, data: &[u8]) -> ChunkSpec {
    let hash = ChunkHash::compute(data);
    let mut record = vec![FLAG_RAW];
    record.extend_from_slice(data);
    store.put_if_absent(&hash, &record).unwrap();
    ChunkSpec {
        sequence: 0,
        hash,
        offset: 0,
        length: data.len() as u32,
    }
}

fn commit_one(fx: &mut Fixture, path: &str, data: &[u8]) -> ChunkSpec {
    let spec = put_block(&fx.store, data);
    fx.catalog
        .commit_version(
            &fx.store,
            path,
            Action::Created,
            data.len() as u64,
            Some(ChunkHash::compute(data)),
            &[spec],
        )
        .unwrap();
    spec
}

/// Replace a stored block with arbitrary bytes, bypassing put_if_absent's
/// write-once behavior.
fn replace_block(store: &BlockStore, hash: &ChunkHash, record: &[u8]) {
    store.unlink(hash).unwrap();
    assert!(store.put_if_absent(hash, record).unwrap());
}

#[test]
fn health_check_reports_consistent_disk_and_clean_catalog() {
    let fx = fixture();
    let health = reliability::health_check(fx.dir.path(), fx.catalog.integrity_check().unwrap());

    assert!(health.catalog_ok);
    assert!(health.catalog_errors.is_empty());

    // Disk numbers depend on the host; only their consistency is testable.
    match health.disk_status {
        HealthStatus::Unknown => {
            assert_eq!(health.disk_total_bytes, 0);
        }
        _ => {
            assert!(health.disk_total_bytes > 0);
            assert!(health.disk_free_bytes <= health.disk_total_bytes);
            assert!((0.0..=100.0).contains(&health.disk_used_percent));
        }
    }
}

#[test]
fn integrity_check_clean_on_fresh_catalog() {
    let fx = fixture();
    assert!(fx.catalog.integrity_check().unwrap().is_empty());
    let reader = fx.catalog.open_reader().unwrap();
    assert!(reader.integrity_check().unwrap().is_empty());
}

#[test]
fn catalog_errors_mark_health_unhealthy() {
    let fx = fixture();
    let health = reliability::health_check(
        fx.dir.path(),
        vec!["wrong # of entries in index idx_version_chunks_hash".into()],
    );
    assert!(!health.catalog_ok);
    assert!(!health.overall_ok());
}

#[test]
fn sample_versions_excludes_tombstones() {
    let mut fx = fixture();
    commit_one(&mut fx, "a.txt", b"alpha");
    commit_one(&mut fx, "b.txt", b"bravo");
    fx.catalog
        .commit_version(&fx.store, "a.txt", Action::Deleted, 0, None, &[])
        .unwrap();

    let sampled = fx.catalog.sample_versions(10).unwrap();
    assert_eq!(sampled.len(), 2);
    assert!(sampled.iter().all(|v| v.action != Action::Deleted));

    assert_eq!(fx.catalog.sample_versions(1).unwrap().len(), 1);
    assert!(fx.catalog.sample_versions(0).unwrap().is_empty());
}

#[test]
fn verify_records_passes_on_healthy_repo() {
    let mut fx = fixture();
    commit_one(&mut fx, "a.txt", b"first file");
    commit_one(&mut fx, "b.txt", b"second file");

    let stats = reliability::verify_records(&fx.catalog, &fx.store, 10).unwrap();
    assert_eq!(stats.sampled, 2);
    assert_eq!(stats.versions_ok, 2);
    assert!(stats.into_result().is_ok());
}

#[test]
fn verify_records_detects_size_drift() {
    let mut fx = fixture();
    let spec = commit_one(&mut fx, "shrunk.txt", b"original record payload");

    // A truncated block no longer matches the catalog's stored size.
    replace_block(&fx.store, &spec.hash, &[FLAG_RAW, 0x01]);

    let stats = reliability::verify_records(&fx.catalog, &fx.store, 10).unwrap();
    assert_eq!(stats.failures.len(), 1);
    assert!(stats.failures[0].detail.contains("catalog records"));
    assert!(matches!(
        stats.into_result(),
        Err(ParapetError::IntegrityViolation(_))
    ));
}

#[test]
fn verify_records_detects_unknown_codec_flag() {
    let mut fx = fixture();
    let data = b"payload with a soon-corrupt flag";
    let spec = commit_one(&mut fx, "flag.txt", data);

    // Same length as the original record, but an impossible flag byte.
    let mut corrupt = vec![0x7f];
    corrupt.extend_from_slice(data);
    replace_block(&fx.store, &spec.hash, &corrupt);

    let stats = reliability::verify_records(&fx.catalog, &fx.store, 10).unwrap();
    assert_eq!(stats.failures.len(), 1);
    assert!(stats.failures[0].detail.contains("codec flag"));
}

#[test]
fn verify_records_detects_missing_block() {
    let mut fx = fixture();
    let spec = commit_one(&mut fx, "gone.txt", b"about to vanish");
    fx.store.unlink(&spec.hash).unwrap();

    let stats = reliability::verify_records(&fx.catalog, &fx.store, 10).unwrap();
    assert_eq!(stats.failures.len(), 1);
    assert_eq!(stats.versions_ok, 0);
}

#[test]
fn verify_records_empty_repo_is_clean() {
    let fx = fixture();
    let stats = reliability::verify_records(&fx.catalog, &fx.store, 10).unwrap();
    assert_eq!(stats.sampled, 0);
    assert!(stats.into_result().is_ok());
}
