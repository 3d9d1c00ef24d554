//! The long-lived RPC dispatcher.
//!
//! One connection, one frame reader. Catalog-mutating requests are funneled
//! to a single writer worker; pure reads (and `put_chunk`, which only touches
//! the concurrency-safe block store) fan out to a bounded reader pool. All
//! responses flow through one output thread, so frames are never interleaved
//! and are written in completion order; clients correlate by `request_id`.

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use tracing::{debug, info, warn};

use parapet_protocol as proto;
use parapet_protocol::frame::{decode_body, encode_body, read_frame, write_frame};
use parapet_protocol::{Frame, OpCode};
use parapet_types::{ParapetError, Result};

use crate::blockstore::BlockStore;
use crate::catalog::{Catalog, CatalogReader, FileRow, VersionRow};
use crate::config::AgentConfig;
use crate::gc;
use crate::paths;
use crate::reliability;
use crate::repo::Repository;

type OutFrame = (OpCode, Vec<u8>);

/// Serve one client connection until it closes, then return.
///
/// The repository is consumed for the duration of the connection; callers
/// re-open it to serve the next one.
pub fn serve<R, W>(repo: Repository, config: &AgentConfig, reader: R, writer: W) -> Result<()>
where
    R: Read + Send,
    W: Write + Send + 'static,
{
    let Repository {
        root,
        manifest,
        store,
        catalog,
    } = repo;
    let store = Arc::new(store);
    let root = Arc::new(root);

    let pool_size = config.reader_pool.max(1);
    let mut catalog_readers = Vec::with_capacity(pool_size);
    for _ in 0..pool_size {
        catalog_readers.push(catalog.open_reader()?);
    }

    let (out_tx, out_rx) = bounded::<OutFrame>(64);
    let (write_tx, write_rx) = bounded::<Frame>(16);
    let (read_tx, read_rx) = bounded::<Frame>(pool_size * 2);

    thread::scope(|scope| -> Result<()> {
        let output = scope.spawn(move || output_loop(writer, out_rx));

        {
            let out_tx = out_tx.clone();
            let store = Arc::clone(&store);
            scope.spawn(move || writer_loop(catalog, store, write_rx, out_tx));
        }
        for catalog_reader in catalog_readers {
            let out_tx = out_tx.clone();
            let store = Arc::clone(&store);
            let root = Arc::clone(&root);
            let read_rx = read_rx.clone();
            scope.spawn(move || reader_loop(catalog_reader, store, root, read_rx, out_tx));
        }
        drop(read_rx);

        let hello = proto::Hello {
            protocol_version: proto::PROTOCOL_VERSION,
            manifest: manifest.info(),
        };
        out_tx
            .send((OpCode::Hello, encode_body(&hello)?))
            .map_err(|_| ParapetError::Transport("output channel closed".into()))?;
        info!("agent serving connection");

        let result = read_loop(reader, write_tx, read_tx);
        drop(out_tx);

        // Channel senders are dropped by read_loop; workers drain and exit,
        // then the output thread sees its channel close and finishes.
        match output.join() {
            Ok(out_result) => result.and(out_result),
            Err(_) => Err(ParapetError::Transport("output thread panicked".into())),
        }
    })
}

/// Read frames and dispatch by opcode until EOF or a framing error.
/// Dropping the dispatch senders on return shuts the worker pool down.
fn read_loop<R: Read>(
    mut reader: R,
    write_tx: Sender<Frame>,
    read_tx: Sender<Frame>,
) -> Result<()> {
    loop {
        let frame = match read_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("client closed connection");
                return Ok(());
            }
            Err(e) => {
                warn!("dropping connection: {e}");
                return Err(e);
            }
        };
        match frame.opcode {
            OpCode::Error | OpCode::Hello => {
                warn!(opcode = frame.opcode.name(), "unexpected frame from client");
            }
            op if op.is_catalog_write() => {
                if write_tx.send(frame).is_err() {
                    return Err(ParapetError::Transport("writer worker shut down".into()));
                }
            }
            _ => {
                if read_tx.send(frame).is_err() {
                    return Err(ParapetError::Transport("reader pool shut down".into()));
                }
            }
        }
    }
}

/// Single thread that owns the write half, preserving frame atomicity.
fn output_loop<W: Write>(mut writer: W, out_rx: Receiver<OutFrame>) -> Result<()> {
    for (opcode, body) in out_rx {
        write_frame(&mut writer, opcode, &body)?;
    }
    Ok(())
}

fn send_ok<T: Serialize>(out_tx: &Sender<OutFrame>, opcode: OpCode, msg: &T) {
    match encode_body(msg) {
        Ok(body) => {
            let _ = out_tx.send((opcode, body));
        }
        Err(e) => warn!("failed to encode response: {e}"),
    }
}

fn send_err(out_tx: &Sender<OutFrame>, request_id: u64, err: &ParapetError) {
    let resp = proto::ErrorResponse {
        request_id,
        kind: err.kind().to_string(),
        message: err.to_string(),
    };
    send_ok(out_tx, OpCode::Error, &resp);
}

// ── Writer worker ──────────────────────────────────────────────────────────

fn writer_loop(
    mut catalog: Catalog,
    store: Arc<BlockStore>,
    write_rx: Receiver<Frame>,
    out_tx: Sender<OutFrame>,
) {
    for frame in write_rx {
        match frame.opcode {
            OpCode::CommitVersion => handle_commit(&mut catalog, &store, &frame.body, &out_tx),
            OpCode::DeleteVersion => handle_delete_version(&mut catalog, &frame.body, &out_tx),
            OpCode::Gc => handle_gc(&mut catalog, &store, &frame.body, &out_tx),
            other => warn!(opcode = other.name(), "non-write opcode on writer queue"),
        }
    }
}

fn handle_commit(
    catalog: &mut Catalog,
    store: &BlockStore,
    body: &[u8],
    out_tx: &Sender<OutFrame>,
) {
    let req: proto::CommitVersionRequest = match decode_body(body) {
        Ok(req) => req,
        Err(e) => return send_err(out_tx, 0, &e),
    };
    let result = paths::normalize(&req.path).and_then(|path| {
        catalog.commit_version(
            store,
            &path,
            req.action,
            req.plain_size,
            req.content_hash,
            &req.chunks,
        )
    });
    match result {
        Ok(version_id) => send_ok(
            out_tx,
            OpCode::CommitVersion,
            &proto::CommitVersionResponse {
                request_id: req.request_id,
                version_id,
            },
        ),
        Err(e) => {
            warn!(path = %req.path, op = "commit_version", "commit failed: {e}");
            send_err(out_tx, req.request_id, &e);
        }
    }
}

fn handle_delete_version(catalog: &mut Catalog, body: &[u8], out_tx: &Sender<OutFrame>) {
    let req: proto::DeleteVersionRequest = match decode_body(body) {
        Ok(req) => req,
        Err(e) => return send_err(out_tx, 0, &e),
    };
    match catalog.delete_version(req.version_id) {
        Ok(()) => send_ok(
            out_tx,
            OpCode::DeleteVersion,
            &proto::DeleteVersionResponse {
                request_id: req.request_id,
            },
        ),
        Err(e) => send_err(out_tx, req.request_id, &e),
    }
}

fn handle_gc(
    catalog: &mut Catalog,
    store: &BlockStore,
    body: &[u8],
    out_tx: &Sender<OutFrame>,
) {
    let req: proto::GcRequest = match decode_body(body) {
        Ok(req) => req,
        Err(e) => return send_err(out_tx, 0, &e),
    };
    match gc::run(catalog, store, req.retention_days, req.dry_run) {
        Ok(stats) => send_ok(
            out_tx,
            OpCode::Gc,
            &proto::GcResponse {
                request_id: req.request_id,
                expired_versions: stats.expired_versions,
                freed_blocks: stats.freed_blocks,
                freed_bytes: stats.freed_bytes,
            },
        ),
        Err(e) => send_err(out_tx, req.request_id, &e),
    }
}

// ── Reader pool ────────────────────────────────────────────────────────────

fn reader_loop(
    catalog: CatalogReader,
    store: Arc<BlockStore>,
    root: Arc<std::path::PathBuf>,
    read_rx: Receiver<Frame>,
    out_tx: Sender<OutFrame>,
) {
    for frame in read_rx {
        match frame.opcode {
            OpCode::Probe => handle_probe(&store, &frame.body, &out_tx),
            OpCode::PutChunk => handle_put_chunk(&store, &frame.body, &out_tx),
            OpCode::GetChunk => handle_get_chunk(&store, &frame.body, &out_tx),
            OpCode::ListFiles => handle_list_files(&catalog, &frame.body, &out_tx),
            OpCode::ListVersions => handle_list_versions(&catalog, &frame.body, &out_tx),
            OpCode::Restore => handle_restore(&catalog, &store, &frame.body, &out_tx),
            OpCode::Stats => handle_stats(&catalog, &root, &frame.body, &out_tx),
            other => warn!(opcode = other.name(), "non-read opcode on reader queue"),
        }
    }
}

fn handle_probe(store: &BlockStore, body: &[u8], out_tx: &Sender<OutFrame>) {
    let req: proto::ProbeRequest = match decode_body(body) {
        Ok(req) => req,
        Err(e) => return send_err(out_tx, 0, &e),
    };
    if req.hashes.len() > proto::PROBE_BATCH_LIMIT {
        return send_err(
            out_tx,
            req.request_id,
            &ParapetError::Config(format!(
                "probe batch of {} exceeds limit of {}",
                req.hashes.len(),
                proto::PROBE_BATCH_LIMIT
            )),
        );
    }
    let mut present = Vec::new();
    for hash in &req.hashes {
        match store.exists(hash) {
            Ok(true) => present.push(*hash),
            Ok(false) => {}
            Err(e) => return send_err(out_tx, req.request_id, &e),
        }
    }
    send_ok(
        out_tx,
        OpCode::Probe,
        &proto::ProbeResponse {
            request_id: req.request_id,
            present,
        },
    );
}

fn handle_put_chunk(store: &BlockStore, body: &[u8], out_tx: &Sender<OutFrame>) {
    let req: proto::PutChunkRequest = match decode_body(body) {
        Ok(req) => req,
        Err(e) => return send_err(out_tx, 0, &e),
    };
    // The record is ciphertext; the announced hash cannot be verified here.
    // The client re-hashes plaintext on restore instead.
    match store.put_if_absent(&req.hash, &req.record) {
        Ok(stored) => send_ok(
            out_tx,
            OpCode::PutChunk,
            &proto::PutChunkResponse {
                request_id: req.request_id,
                stored,
            },
        ),
        Err(e) => send_err(out_tx, req.request_id, &e),
    }
}

fn handle_get_chunk(store: &BlockStore, body: &[u8], out_tx: &Sender<OutFrame>) {
    let req: proto::GetChunkRequest = match decode_body(body) {
        Ok(req) => req,
        Err(e) => return send_err(out_tx, 0, &e),
    };
    match store.get(&req.hash) {
        Ok(record) => send_ok(
            out_tx,
            OpCode::GetChunk,
            &proto::GetChunkResponse {
                request_id: req.request_id,
                record,
            },
        ),
        Err(e) => send_err(out_tx, req.request_id, &e),
    }
}

fn handle_list_files(catalog: &CatalogReader, body: &[u8], out_tx: &Sender<OutFrame>) {
    let req: proto::ListFilesRequest = match decode_body(body) {
        Ok(req) => req,
        Err(e) => return send_err(out_tx, 0, &e),
    };
    let prefix = match req.prefix.as_deref().map(paths::normalize).transpose() {
        Ok(p) => p,
        Err(e) => return send_err(out_tx, req.request_id, &e),
    };
    match catalog.list_files(prefix.as_deref()) {
        Ok(rows) => send_ok(
            out_tx,
            OpCode::ListFiles,
            &proto::ListFilesResponse {
                request_id: req.request_id,
                files: rows.into_iter().map(file_entry).collect(),
            },
        ),
        Err(e) => send_err(out_tx, req.request_id, &e),
    }
}

fn handle_list_versions(catalog: &CatalogReader, body: &[u8], out_tx: &Sender<OutFrame>) {
    let req: proto::ListVersionsRequest = match decode_body(body) {
        Ok(req) => req,
        Err(e) => return send_err(out_tx, 0, &e),
    };
    let result = paths::normalize(&req.path).and_then(|path| catalog.list_versions(&path));
    match result {
        Ok(rows) => send_ok(
            out_tx,
            OpCode::ListVersions,
            &proto::ListVersionsResponse {
                request_id: req.request_id,
                versions: rows.into_iter().map(version_entry).collect(),
            },
        ),
        Err(e) => send_err(out_tx, req.request_id, &e),
    }
}

fn handle_restore(
    catalog: &CatalogReader,
    store: &BlockStore,
    body: &[u8],
    out_tx: &Sender<OutFrame>,
) {
    let req: proto::RestoreRequest = match decode_body(body) {
        Ok(req) => req,
        Err(e) => return send_err(out_tx, 0, &e),
    };
    let request_id = req.request_id;

    let version = match paths::normalize(&req.path).and_then(|path| {
        let version = catalog
            .version_by_id(req.version_id)?
            .filter(|v| v.path == path)
            .ok_or_else(|| {
                ParapetError::NotFound(format!("version {} of '{path}'", req.version_id))
            })?;
        Ok(version)
    }) {
        Ok(v) => v,
        Err(e) => return send_err(out_tx, request_id, &e),
    };

    let chunks = match catalog.version_chunks(version.version_id) {
        Ok(c) => c,
        Err(e) => return send_err(out_tx, request_id, &e),
    };

    send_ok(
        out_tx,
        OpCode::Restore,
        &proto::RestoreEvent::Begin {
            request_id,
            total_chunks: chunks.len() as u32,
            plain_size: version.plain_size,
            content_hash: version.content_hash,
        },
    );
    for vc in &chunks {
        match store.get(&vc.chunk_hash) {
            Ok(record) => send_ok(
                out_tx,
                OpCode::Restore,
                &proto::RestoreEvent::Chunk {
                    request_id,
                    sequence: vc.sequence,
                    record,
                },
            ),
            Err(e) => {
                // A referenced block that is gone mid-restore means the
                // catalog and the store disagree; abort the stream and
                // surface it.
                let err = match e {
                    ParapetError::NotFound(what) => ParapetError::IntegrityViolation(format!(
                        "restore of version {} hit missing {what}",
                        version.version_id
                    )),
                    other => other,
                };
                return send_err(out_tx, request_id, &err);
            }
        }
    }
    send_ok(out_tx, OpCode::Restore, &proto::RestoreEvent::End { request_id });
}

fn handle_stats(
    catalog: &CatalogReader,
    root: &std::path::Path,
    body: &[u8],
    out_tx: &Sender<OutFrame>,
) {
    let req: proto::StatsRequest = match decode_body(body) {
        Ok(req) => req,
        Err(e) => return send_err(out_tx, 0, &e),
    };
    let result = catalog.stats().and_then(|stats| {
        let health = reliability::health_check(root, catalog.integrity_check()?);
        Ok((stats, health))
    });
    match result {
        Ok((stats, health)) => send_ok(
            out_tx,
            OpCode::Stats,
            &proto::StatsResponse {
                request_id: req.request_id,
                stats,
                health,
            },
        ),
        Err(e) => send_err(out_tx, req.request_id, &e),
    }
}

fn file_entry(row: FileRow) -> proto::FileEntry {
    proto::FileEntry {
        path: row.path,
        first_seen_at_us: row.first_seen_at_us,
        last_action: row.last_action,
        current_size: row.current_size,
    }
}

fn version_entry(row: VersionRow) -> proto::VersionEntry {
    proto::VersionEntry {
        version_id: row.version_id,
        path: row.path,
        timestamp_us: row.timestamp_us,
        action: row.action,
        plain_size: row.plain_size,
        stored_size: row.stored_size,
        is_compressed: row.is_compressed,
        content_hash: row.content_hash,
    }
}
