use parapet_protocol::ChunkSpec;
use parapet_types::{Action, ChunkHash, ParapetError};

use crate::blockstore::BlockStore;
use crate::catalog::Catalog;
use crate::compress::FLAG_RAW;

struct Fixture {
    _dir: tempfile::TempDir,
    catalog: Catalog,
    store: BlockStore,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    let store = BlockStore::create(dir.path()).unwrap();
    Fixture {
        _dir: dir,
        catalog,
        store,
    }
}

/// Store a raw-flagged record for `data` and return its hash and spec.
fn put_block(store: &BlockStore, data: &[u8], sequence: u32, offset: u64) -> ChunkSpec {
    let hash = ChunkHash::compute(data);
    let mut record = vec![FLAG_RAW];
    record.extend_from_slice(data);
    store.put_if_absent(&hash, &record).unwrap();
    ChunkSpec {
        sequence,
        hash,
        offset,
        length: data.len() as u32,
    }
}

fn commit_one(fx: &mut Fixture, path: &str, data: &[u8]) -> parapet_types::VersionId {
    let spec = put_block(&fx.store, data, 0, 0);
    fx.catalog
        .commit_version(
            &fx.store,
            path,
            Action::Created,
            data.len() as u64,
            Some(ChunkHash::compute(data)),
            &[spec],
        )
        .unwrap()
}

#[test]
fn commit_creates_all_rows() {
    let mut fx = fixture();
    let version_id = commit_one(&mut fx, "a.txt", b"hello world\n");

    let files = fx.catalog.list_files(None).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, "a.txt");
    assert_eq!(files[0].last_action, Action::Created);
    assert_eq!(files[0].current_size, 12);

    let versions = fx.catalog.list_versions("a.txt").unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].version_id, version_id);
    assert_eq!(versions[0].plain_size, 12);
    // One raw record: flag byte + payload.
    assert_eq!(versions[0].stored_size, 13);

    let chunks = fx.catalog.version_chunks(version_id).unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].sequence, 0);
    assert_eq!(chunks[0].length, 12);

    let chunk = fx.catalog.chunk_by_hash(&chunks[0].chunk_hash).unwrap().unwrap();
    assert_eq!(chunk.refcount, 1);
    assert_eq!(chunk.plain_size, 12);
}

#[test]
fn shared_chunk_has_one_row_and_counted_refs() {
    let mut fx = fixture();
    let shared = b"identical run of bytes shared between two files";
    let spec_a = put_block(&fx.store, shared, 0, 0);
    let spec_b = put_block(&fx.store, shared, 0, 0);
    assert_eq!(spec_a.hash, spec_b.hash);

    fx.catalog
        .commit_version(&fx.store, "a.bin", Action::Created, 47, Some(ChunkHash::compute(b"a")), &[spec_a])
        .unwrap();
    fx.catalog
        .commit_version(&fx.store, "b.bin", Action::Created, 47, Some(ChunkHash::compute(b"b")), &[spec_b])
        .unwrap();

    let stats = fx.catalog.stats().unwrap();
    assert_eq!(stats.chunk_count, 1, "identical plaintexts share one chunk row");
    let chunk = fx.catalog.chunk_by_hash(&spec_a.hash).unwrap().unwrap();
    assert_eq!(chunk.refcount, 2, "refcount equals referencing version_chunk rows");
}

#[test]
fn missing_block_aborts_commit_without_partial_state() {
    let mut fx = fixture();
    let absent = ChunkHash::compute(b"never uploaded");
    let spec = ChunkSpec {
        sequence: 0,
        hash: absent,
        offset: 0,
        length: 14,
    };

    let err = fx
        .catalog
        .commit_version(&fx.store, "a.txt", Action::Created, 14, Some(absent), &[spec])
        .unwrap_err();
    assert!(matches!(err, ParapetError::MissingBlock(h) if h == absent));

    // The rolled-back transaction left nothing behind, including the file
    // row created earlier in the same transaction.
    let stats = fx.catalog.stats().unwrap();
    assert_eq!(stats.version_count, 0);
    assert_eq!(stats.chunk_count, 0);
    assert!(fx.catalog.list_files(None).unwrap().is_empty());
}

#[test]
fn tombstone_has_no_chunks_and_null_hash() {
    let mut fx = fixture();
    commit_one(&mut fx, "a.txt", b"content");

    let tomb = fx
        .catalog
        .commit_version(&fx.store, "a.txt", Action::Deleted, 0, None, &[])
        .unwrap();

    let versions = fx.catalog.list_versions("a.txt").unwrap();
    assert_eq!(versions.len(), 2);
    let tombstone = &versions[1];
    assert_eq!(tombstone.version_id, tomb);
    assert_eq!(tombstone.action, Action::Deleted);
    assert!(tombstone.content_hash.is_none());
    assert!(fx.catalog.version_chunks(tomb).unwrap().is_empty());

    let files = fx.catalog.list_files(None).unwrap();
    assert_eq!(files[0].last_action, Action::Deleted);
    assert_eq!(files[0].current_size, 0);
}

#[test]
fn tombstone_rejects_chunks() {
    let mut fx = fixture();
    let spec = put_block(&fx.store, b"data", 0, 0);
    let err = fx
        .catalog
        .commit_version(&fx.store, "a.txt", Action::Deleted, 0, None, &[spec])
        .unwrap_err();
    assert!(matches!(err, ParapetError::Config(_)));
}

#[test]
fn revived_file_after_tombstone() {
    let mut fx = fixture();
    commit_one(&mut fx, "a.txt", b"v1");
    fx.catalog
        .commit_version(&fx.store, "a.txt", Action::Deleted, 0, None, &[])
        .unwrap();
    let spec = put_block(&fx.store, b"reborn", 0, 0);
    fx.catalog
        .commit_version(
            &fx.store,
            "a.txt",
            Action::Created,
            6,
            Some(ChunkHash::compute(b"reborn")),
            &[spec],
        )
        .unwrap();

    let files = fx.catalog.list_files(None).unwrap();
    assert_eq!(files.len(), 1, "files are never deleted, only revived");
    assert_eq!(files[0].last_action, Action::Created);
    assert_eq!(files[0].current_size, 6);
}

#[test]
fn unchanged_content_commit_is_noop() {
    let mut fx = fixture();
    let v1 = commit_one(&mut fx, "a.txt", b"stable content");
    let spec = put_block(&fx.store, b"stable content", 0, 0);
    let v2 = fx
        .catalog
        .commit_version(
            &fx.store,
            "a.txt",
            Action::Modified,
            14,
            Some(ChunkHash::compute(b"stable content")),
            &[spec],
        )
        .unwrap();

    assert_eq!(v1, v2);
    assert_eq!(fx.catalog.stats().unwrap().version_count, 1);
}

#[test]
fn timestamps_are_monotonic_within_path() {
    let mut fx = fixture();
    commit_one(&mut fx, "a.txt", b"one");
    let spec = put_block(&fx.store, b"two", 0, 0);
    fx.catalog
        .commit_version(
            &fx.store,
            "a.txt",
            Action::Modified,
            3,
            Some(ChunkHash::compute(b"two")),
            &[spec],
        )
        .unwrap();

    let versions = fx.catalog.list_versions("a.txt").unwrap();
    assert_eq!(versions.len(), 2);
    assert!(versions[0].timestamp_us < versions[1].timestamp_us);
}

#[test]
fn delete_version_decrements_refcounts() {
    let mut fx = fixture();
    let shared = b"shared between versions";
    let spec = put_block(&fx.store, shared, 0, 0);
    let v1 = fx
        .catalog
        .commit_version(&fx.store, "a.txt", Action::Created, 23, Some(ChunkHash::compute(b"x")), &[spec])
        .unwrap();
    let spec2 = put_block(&fx.store, shared, 0, 0);
    fx.catalog
        .commit_version(&fx.store, "b.txt", Action::Created, 23, Some(ChunkHash::compute(b"y")), &[spec2])
        .unwrap();

    fx.catalog.delete_version(v1).unwrap();
    let chunk = fx.catalog.chunk_by_hash(&spec.hash).unwrap().unwrap();
    assert_eq!(chunk.refcount, 1);
    assert!(fx.catalog.version_by_id(v1).unwrap().is_none());
}

#[test]
fn delete_version_with_repeated_chunk_decrements_per_reference() {
    let mut fx = fixture();
    let data = b"repeated block";
    let hash = ChunkHash::compute(data);
    let mut record = vec![FLAG_RAW];
    record.extend_from_slice(data);
    fx.store.put_if_absent(&hash, &record).unwrap();

    // One version referencing the same chunk at two sequences.
    let specs = [
        ChunkSpec { sequence: 0, hash, offset: 0, length: 14 },
        ChunkSpec { sequence: 1, hash, offset: 14, length: 14 },
    ];
    let v = fx
        .catalog
        .commit_version(&fx.store, "rep.bin", Action::Created, 28, Some(hash), &specs)
        .unwrap();

    assert_eq!(fx.catalog.chunk_by_hash(&hash).unwrap().unwrap().refcount, 2);
    fx.catalog.delete_version(v).unwrap();
    assert_eq!(fx.catalog.chunk_by_hash(&hash).unwrap().unwrap().refcount, 0);
}

#[test]
fn delete_missing_version_is_not_found() {
    let mut fx = fixture();
    assert!(matches!(
        fx.catalog.delete_version(parapet_types::VersionId(999)),
        Err(ParapetError::NotFound(_))
    ));
}

#[test]
fn reader_sees_writer_commits() {
    let mut fx = fixture();
    let reader = fx.catalog.open_reader().unwrap();
    commit_one(&mut fx, "a.txt", b"visible");

    let versions = reader.list_versions("a.txt").unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(reader.stats().unwrap().version_count, 1);
}

#[test]
fn stats_aggregate_all_tables() {
    let mut fx = fixture();
    commit_one(&mut fx, "a.txt", b"aaaa");
    commit_one(&mut fx, "b.txt", b"bbbbbbbb");

    let stats = fx.catalog.stats().unwrap();
    assert_eq!(stats.file_count, 2);
    assert_eq!(stats.version_count, 2);
    assert_eq!(stats.chunk_count, 2);
    assert_eq!(stats.total_plain_bytes, 12);
    // Each record carries one flag byte.
    assert_eq!(stats.total_stored_bytes, 14);
}

#[test]
fn list_files_prefix_filter() {
    let mut fx = fixture();
    commit_one(&mut fx, "docs/a.txt", b"a");
    commit_one(&mut fx, "docs/b.txt", b"b");
    commit_one(&mut fx, "src/main.rs", b"c");

    assert_eq!(fx.catalog.list_files(Some("docs/")).unwrap().len(), 2);
    assert_eq!(fx.catalog.list_files(None).unwrap().len(), 3);
}
