use std::io::{Read, Write};
use std::path::PathBuf;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};

use parapet_types::Result;

use crate::agent;
use crate::client::Connection;
use crate::config::{AgentConfig, ChunkerConfig, ClientConfig};
use crate::crypto::{SealKey, Sealer};
use crate::repo::Repository;

/// In-memory byte-duplex half. Stands in for the credentialed transport
/// collaborator: `duplex()` returns two connected ends, each readable and
/// writable. Dropping an end is seen as EOF by its peer.
pub struct PipeEnd {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    leftover: Vec<u8>,
}

pub fn duplex() -> (PipeEnd, PipeEnd) {
    let (a_tx, a_rx) = unbounded();
    let (b_tx, b_rx) = unbounded();
    (
        PipeEnd {
            tx: a_tx,
            rx: b_rx,
            leftover: Vec::new(),
        },
        PipeEnd {
            tx: b_tx,
            rx: a_rx,
            leftover: Vec::new(),
        },
    )
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.leftover.is_empty() {
            match self.rx.recv() {
                Ok(data) => self.leftover = data,
                Err(_) => return Ok(0), // peer dropped: EOF
            }
        }
        let n = buf.len().min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Small chunker geometry so tests exercise multi-chunk files without
/// megabytes of data.
pub fn test_chunker_config() -> ChunkerConfig {
    ChunkerConfig {
        window: 48,
        min_size: 256,
        avg_size: 1024,
        max_size: 4096,
    }
}

/// Fixed seal key for tests. The agent never sees key material, so tests can
/// skip PBKDF2 and use raw bytes.
pub fn test_sealer() -> Sealer {
    Sealer::new(&SealKey::from_bytes([0xAB; 32]))
}

/// A repository served by an in-process agent, plus a connected client.
/// Field order matters on drop: the connection closes (stopping the agent)
/// before the repository directory is removed.
pub struct TestHarness {
    pub conn: Connection,
    pub sealer: Sealer,
    agent: Option<JoinHandle<Result<()>>>,
    pub dir: tempfile::TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = dir.path().join("repo");
        let repo = Repository::init(&repo_root, test_chunker_config()).unwrap();

        let (client_end, server_end) = duplex();
        let (server_read, server_write) = split(server_end);
        let (client_read, client_write) = split(client_end);

        let agent = std::thread::spawn(move || {
            agent::serve(repo, &AgentConfig::default(), server_read, server_write)
        });
        let conn =
            Connection::establish(client_read, client_write, ClientConfig::default()).unwrap();

        TestHarness {
            conn,
            sealer: test_sealer(),
            agent: Some(agent),
            dir,
        }
    }

    pub fn repo_root(&self) -> PathBuf {
        self.dir.path().join("repo")
    }

    /// Write a source file the delta engine can commit.
    pub fn write_source(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.dir.path().join("source").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// Close the connection and wait for the agent to exit cleanly.
    pub fn shutdown(mut self) -> Result<()> {
        let agent = self.agent.take().unwrap();
        // Dropping the connection closes the client end; the agent sees EOF.
        drop(self);
        agent.join().expect("agent thread panicked")
    }
}

/// Split a duplex end into independently-owned read and write halves.
/// Each half keeps only the channel it actually uses; the other side is a
/// stub that is never touched.
fn split(end: PipeEnd) -> (PipeEnd, PipeEnd) {
    let PipeEnd { tx, rx, leftover } = end;
    let (stub_tx, _) = unbounded();
    let (_, stub_rx) = unbounded::<Vec<u8>>();
    (
        PipeEnd {
            tx: stub_tx,
            rx,
            leftover,
        },
        PipeEnd {
            tx,
            rx: stub_rx,
            leftover: Vec::new(),
        },
    )
}
