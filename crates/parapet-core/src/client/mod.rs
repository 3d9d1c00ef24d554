//! Client-side machinery: the multiplexed connection, the delta engine, the
//! restore path, and the debounce/commit worker pair.

pub mod debounce;
pub mod delta;
pub mod restore;
pub mod verify;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use tracing::{debug, warn};

use parapet_protocol as proto;
use parapet_protocol::frame::{decode_body, encode_body, read_frame, write_frame};
use parapet_protocol::{Frame, ManifestInfo, OpCode};
use parapet_types::{ChunkHash, ParapetError, Result, VersionId};

use crate::config::{ChunkerConfig, ClientConfig};

/// A decoded response frame, routed to its awaiting request by id.
#[derive(Debug)]
pub(crate) enum Response {
    Error(proto::ErrorResponse),
    Probe(proto::ProbeResponse),
    PutChunk(proto::PutChunkResponse),
    GetChunk(proto::GetChunkResponse),
    Commit(proto::CommitVersionResponse),
    ListFiles(proto::ListFilesResponse),
    ListVersions(proto::ListVersionsResponse),
    Restore(proto::RestoreEvent),
    DeleteVersion(proto::DeleteVersionResponse),
    Gc(proto::GcResponse),
    Stats(proto::StatsResponse),
}

impl Response {
    fn decode(frame: &Frame) -> Result<Self> {
        Ok(match frame.opcode {
            OpCode::Error => Response::Error(decode_body(&frame.body)?),
            OpCode::Probe => Response::Probe(decode_body(&frame.body)?),
            OpCode::PutChunk => Response::PutChunk(decode_body(&frame.body)?),
            OpCode::GetChunk => Response::GetChunk(decode_body(&frame.body)?),
            OpCode::CommitVersion => Response::Commit(decode_body(&frame.body)?),
            OpCode::ListFiles => Response::ListFiles(decode_body(&frame.body)?),
            OpCode::ListVersions => Response::ListVersions(decode_body(&frame.body)?),
            OpCode::Restore => Response::Restore(decode_body(&frame.body)?),
            OpCode::DeleteVersion => Response::DeleteVersion(decode_body(&frame.body)?),
            OpCode::Gc => Response::Gc(decode_body(&frame.body)?),
            OpCode::Stats => Response::Stats(decode_body(&frame.body)?),
            OpCode::Hello => {
                return Err(ParapetError::Transport(
                    "unexpected hello after handshake".into(),
                ))
            }
        })
    }

    fn request_id(&self) -> u64 {
        match self {
            Response::Error(r) => r.request_id,
            Response::Probe(r) => r.request_id,
            Response::PutChunk(r) => r.request_id,
            Response::GetChunk(r) => r.request_id,
            Response::Commit(r) => r.request_id,
            Response::ListFiles(r) => r.request_id,
            Response::ListVersions(r) => r.request_id,
            Response::Restore(r) => r.request_id(),
            Response::DeleteVersion(r) => r.request_id,
            Response::Gc(r) => r.request_id,
            Response::Stats(r) => r.request_id,
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            Response::Error(_) => "error",
            Response::Probe(_) => "probe",
            Response::PutChunk(_) => "put_chunk",
            Response::GetChunk(_) => "get_chunk",
            Response::Commit(_) => "commit_version",
            Response::ListFiles(_) => "list_files",
            Response::ListVersions(_) => "list_versions",
            Response::Restore(_) => "restore",
            Response::DeleteVersion(_) => "delete_version",
            Response::Gc(_) => "gc",
            Response::Stats(_) => "stats",
        }
    }
}

/// Pending-request table shared between callers and the reader task.
struct Router {
    pending: Mutex<HashMap<u64, Sender<Response>>>,
}

impl Router {
    fn route(&self, response: Response) {
        let id = response.request_id();
        let sender = {
            let pending = self.pending.lock().unwrap();
            pending.get(&id).cloned()
        };
        match sender {
            // A dropped receiver means the caller gave up (timeout); fine.
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => warn!(request_id = id, "response for unknown request"),
        }
    }

    /// Wake every waiter with a closed channel.
    fn fail_all(&self) {
        self.pending.lock().unwrap().clear();
    }
}

/// A multiplexed client connection over one byte-duplex.
///
/// Requests may be pipelined from any thread; a dedicated reader task
/// demultiplexes responses by request id. Closing the transport cancels
/// every in-flight request.
pub struct Connection {
    writer: Mutex<Box<dyn Write + Send>>,
    router: Arc<Router>,
    next_id: AtomicU64,
    manifest: ManifestInfo,
    config: ClientConfig,
    reader_task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Perform the hello handshake and start the demultiplexing reader task.
    pub fn establish<R, W>(mut reader: R, writer: W, config: ClientConfig) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let hello_frame = read_frame(&mut reader)?
            .ok_or_else(|| ParapetError::Transport("connection closed before hello".into()))?;
        if hello_frame.opcode != OpCode::Hello {
            return Err(ParapetError::Transport(format!(
                "expected hello, got {}",
                hello_frame.opcode.name()
            )));
        }
        let hello: proto::Hello = decode_body(&hello_frame.body)?;
        proto::check_protocol_version(hello.protocol_version).map_err(ParapetError::Transport)?;

        let router = Arc::new(Router {
            pending: Mutex::new(HashMap::new()),
        });
        let reader_router = Arc::clone(&router);
        let reader_task = std::thread::spawn(move || {
            loop {
                match read_frame(&mut reader) {
                    Ok(Some(frame)) => match Response::decode(&frame) {
                        Ok(response) => reader_router.route(response),
                        Err(e) => {
                            warn!("undecodable response frame: {e}");
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        debug!("reader task stopping: {e}");
                        break;
                    }
                }
            }
            reader_router.fail_all();
        });

        Ok(Connection {
            writer: Mutex::new(Box::new(writer)),
            router,
            next_id: AtomicU64::new(1),
            manifest: hello.manifest,
            config,
            reader_task: Some(reader_task),
        })
    }

    /// Repository parameters announced by the agent.
    pub fn manifest(&self) -> &ManifestInfo {
        &self.manifest
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Chunker geometry pinned by the repository.
    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            window: self.manifest.window,
            min_size: self.manifest.min_size,
            avg_size: self.manifest.avg_size,
            max_size: self.manifest.max_size,
        }
    }

    fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.config.control_timeout_ms)
    }

    fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.config.chunk_timeout_ms)
    }

    /// Allocate a request id, register its response channel, and send the
    /// frame. Returns the channel responses will arrive on.
    pub(crate) fn start_call<T, F>(&self, opcode: OpCode, build: F) -> Result<PendingCall>
    where
        T: Serialize,
        F: FnOnce(u64) -> T,
    {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Restore streams many events through the same channel.
        let (tx, rx) = bounded::<Response>(16);
        self.router
            .pending
            .lock()
            .unwrap()
            .insert(request_id, tx);

        let body = encode_body(&build(request_id))?;
        let send_result = {
            let mut writer = self.writer.lock().unwrap();
            write_frame(&mut **writer, opcode, &body)
        };
        if let Err(e) = send_result {
            self.router.pending.lock().unwrap().remove(&request_id);
            return Err(e);
        }

        Ok(PendingCall {
            connection: self,
            request_id,
            rx,
        })
    }

    fn finish(&self, request_id: u64) {
        self.router.pending.lock().unwrap().remove(&request_id);
    }

    // ── RPC surface ────────────────────────────────────────────────────────

    /// Which of `hashes` the agent's block store already holds.
    pub fn probe(&self, hashes: &[ChunkHash]) -> Result<Vec<ChunkHash>> {
        let mut present = Vec::new();
        for batch in hashes.chunks(self.config.probe_batch.min(proto::PROBE_BATCH_LIMIT)) {
            let call = self.start_call(OpCode::Probe, |request_id| proto::ProbeRequest {
                request_id,
                hashes: batch.to_vec(),
            })?;
            match call.wait(self.control_timeout())? {
                Response::Probe(resp) => present.extend(resp.present),
                other => return Err(unexpected(OpCode::Probe, &other)),
            }
        }
        Ok(present)
    }

    /// Upload a sealed record; blocks until acknowledged.
    pub fn put_chunk(&self, hash: ChunkHash, record: Vec<u8>) -> Result<bool> {
        let call = self.put_chunk_start(hash, record)?;
        Self::put_chunk_finish(call)
    }

    /// Fire a put_chunk without waiting (pipelined uploads).
    pub(crate) fn put_chunk_start(&self, hash: ChunkHash, record: Vec<u8>) -> Result<PendingCall> {
        self.start_call(OpCode::PutChunk, |request_id| proto::PutChunkRequest {
            request_id,
            hash,
            record,
        })
    }

    pub(crate) fn put_chunk_finish(call: PendingCall) -> Result<bool> {
        let timeout = call.connection.chunk_timeout();
        match call.wait(timeout)? {
            Response::PutChunk(resp) => Ok(resp.stored),
            other => Err(unexpected(OpCode::PutChunk, &other)),
        }
    }

    pub fn get_chunk(&self, hash: ChunkHash) -> Result<Vec<u8>> {
        let call = self.start_call(OpCode::GetChunk, |request_id| proto::GetChunkRequest {
            request_id,
            hash,
        })?;
        let timeout = self.chunk_timeout();
        match call.wait(timeout)? {
            Response::GetChunk(resp) => Ok(resp.record),
            other => Err(unexpected(OpCode::GetChunk, &other)),
        }
    }

    pub fn commit_version(
        &self,
        path: &str,
        action: parapet_types::Action,
        plain_size: u64,
        content_hash: Option<ChunkHash>,
        chunks: Vec<proto::ChunkSpec>,
    ) -> Result<VersionId> {
        let call = self.start_call(OpCode::CommitVersion, |request_id| {
            proto::CommitVersionRequest {
                request_id,
                path: path.to_string(),
                action,
                plain_size,
                content_hash,
                chunks,
            }
        })?;
        match call.wait(self.control_timeout())? {
            Response::Commit(resp) => Ok(resp.version_id),
            other => Err(unexpected(OpCode::CommitVersion, &other)),
        }
    }

    pub fn list_files(&self, prefix: Option<&str>) -> Result<Vec<proto::FileEntry>> {
        let call = self.start_call(OpCode::ListFiles, |request_id| proto::ListFilesRequest {
            request_id,
            prefix: prefix.map(str::to_string),
        })?;
        match call.wait(self.control_timeout())? {
            Response::ListFiles(resp) => Ok(resp.files),
            other => Err(unexpected(OpCode::ListFiles, &other)),
        }
    }

    pub fn list_versions(&self, path: &str) -> Result<Vec<proto::VersionEntry>> {
        let call = self.start_call(OpCode::ListVersions, |request_id| {
            proto::ListVersionsRequest {
                request_id,
                path: path.to_string(),
            }
        })?;
        match call.wait(self.control_timeout())? {
            Response::ListVersions(resp) => Ok(resp.versions),
            other => Err(unexpected(OpCode::ListVersions, &other)),
        }
    }

    /// Begin a restore stream; the caller consumes [`RestoreStream`].
    pub fn restore(&self, path: &str, version_id: VersionId) -> Result<RestoreStream<'_>> {
        let call = self.start_call(OpCode::Restore, |request_id| proto::RestoreRequest {
            request_id,
            path: path.to_string(),
            version_id,
        })?;
        Ok(RestoreStream { call })
    }

    pub fn delete_version(&self, version_id: VersionId) -> Result<()> {
        let call = self.start_call(OpCode::DeleteVersion, |request_id| {
            proto::DeleteVersionRequest {
                request_id,
                version_id,
            }
        })?;
        match call.wait(self.control_timeout())? {
            Response::DeleteVersion(_) => Ok(()),
            other => Err(unexpected(OpCode::DeleteVersion, &other)),
        }
    }

    pub fn gc(&self, retention_days: u32, dry_run: bool) -> Result<proto::GcResponse> {
        let call = self.start_call(OpCode::Gc, |request_id| proto::GcRequest {
            request_id,
            retention_days,
            dry_run,
        })?;
        match call.wait(self.control_timeout())? {
            Response::Gc(resp) => Ok(resp),
            other => Err(unexpected(OpCode::Gc, &other)),
        }
    }

    pub fn stats(&self) -> Result<proto::RepoStats> {
        self.stats_full().map(|(stats, _)| stats)
    }

    /// The agent's health snapshot (disk headroom, catalog integrity).
    pub fn health(&self) -> Result<proto::HealthInfo> {
        self.stats_full().map(|(_, health)| health)
    }

    pub fn stats_full(&self) -> Result<(proto::RepoStats, proto::HealthInfo)> {
        let call = self.start_call(OpCode::Stats, |request_id| proto::StatsRequest {
            request_id,
        })?;
        match call.wait(self.control_timeout())? {
            Response::Stats(resp) => Ok((resp.stats, resp.health)),
            other => Err(unexpected(OpCode::Stats, &other)),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.router.fail_all();
        // Dropping the write half closes the transport; the agent sees EOF,
        // closes its side, and the detached reader task ends on its own EOF.
        if let Some(task) = self.reader_task.take() {
            drop(task);
        }
    }
}

/// An in-flight request: the response channel plus cleanup bookkeeping.
pub(crate) struct PendingCall<'a> {
    connection: &'a Connection,
    request_id: u64,
    rx: Receiver<Response>,
}

impl PendingCall<'_> {
    /// Wait for the single response of a unary call.
    fn wait(self, timeout: Duration) -> Result<Response> {
        match self.recv(timeout)? {
            Response::Error(err) => Err(remote_error(err)),
            other => Ok(other),
        }
    }

    /// Receive one frame without deregistering (streamed responses).
    fn recv(&self, timeout: Duration) -> Result<Response> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            crossbeam_channel::RecvTimeoutError::Timeout => {
                ParapetError::Transport(format!("request {} timed out", self.request_id))
            }
            crossbeam_channel::RecvTimeoutError::Disconnected => {
                ParapetError::Transport("connection closed".into())
            }
        })
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        // Deregister so a late response for an abandoned request is dropped
        // by the router instead of accumulating.
        self.connection.finish(self.request_id);
    }
}

/// Streamed restore frames, yielded in arrival (= sequence) order.
pub struct RestoreStream<'a> {
    call: PendingCall<'a>,
}

impl RestoreStream<'_> {
    /// Next event. Progress on the stream resets the chunk timeout.
    pub fn next_event(&self) -> Result<proto::RestoreEvent> {
        let timeout = self.call.connection.chunk_timeout();
        match self.call.recv(timeout)? {
            Response::Restore(event) => Ok(event),
            Response::Error(err) => Err(remote_error(err)),
            other => Err(unexpected(OpCode::Restore, &other)),
        }
    }
}

fn unexpected(opcode: OpCode, got: &Response) -> ParapetError {
    ParapetError::Transport(format!(
        "{}: unexpected {} response",
        opcode.name(),
        got.variant_name()
    ))
}

/// Reconstruct a typed error from the agent's error response.
fn remote_error(resp: proto::ErrorResponse) -> ParapetError {
    match resp.kind.as_str() {
        "config" => ParapetError::Config(resp.message),
        "path_escape" => ParapetError::PathEscape(resp.message),
        "not_found" => ParapetError::NotFound(resp.message),
        "auth_failure" => ParapetError::AuthFailure,
        "malformed_record" => ParapetError::MalformedRecord(resp.message),
        "catalog_conflict" => ParapetError::CatalogConflict(resp.message),
        "integrity_violation" => ParapetError::IntegrityViolation(resp.message),
        "cancelled" => ParapetError::Cancelled,
        _ => ParapetError::Remote {
            opcode: "rpc",
            kind: resp.kind,
            message: resp.message,
        },
    }
}
