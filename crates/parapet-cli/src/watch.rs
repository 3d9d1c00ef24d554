//! Watch mode: a polling scanner stands in for the filesystem-watcher
//! collaborator, feeding change events into the core's debouncer/committer
//! pair.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use parapet_core::client::debounce::{
    run_committer, run_debouncer, ChangeEvent, ChangeKind, EventQueue,
};
use parapet_core::client::Connection;
use parapet_core::crypto::Sealer;
use parapet_types::Result;

use crate::config::CliConfig;

#[derive(Clone, Copy, PartialEq, Eq)]
struct FileSig {
    size: u64,
    mtime_ns: i128,
}

/// Scan the tree and diff against the previous snapshot, pushing one event
/// per changed path.
fn scan(root: &Path, previous: &mut HashMap<String, FileSig>, queue: &EventQueue) {
    let mut current = HashMap::new();
    collect(root, root, &mut current);

    for (path, sig) in &current {
        match previous.get(path) {
            None => queue.push(ChangeEvent {
                path: path.clone(),
                kind: ChangeKind::Created,
            }),
            Some(old) if old != sig => queue.push(ChangeEvent {
                path: path.clone(),
                kind: ChangeKind::Modified,
            }),
            Some(_) => {}
        }
    }
    for path in previous.keys() {
        if !current.contains_key(path) {
            queue.push(ChangeEvent {
                path: path.clone(),
                kind: ChangeKind::Removed,
            });
        }
    }
    *previous = current;
}

fn collect(root: &Path, dir: &Path, out: &mut HashMap<String, FileSig>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!("cannot read '{}': {e}", dir.display());
            return;
        }
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else { continue };
        let path = entry.path();
        if file_type.is_dir() {
            collect(root, &path, out);
        } else if file_type.is_file() {
            let Ok(meta) = entry.metadata() else { continue };
            let mtime_ns = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as i128)
                .unwrap_or(0);
            if let Some(rel) = repo_path(root, &path) {
                out.insert(
                    rel,
                    FileSig {
                        size: meta.len(),
                        mtime_ns,
                    },
                );
            }
        }
    }
}

fn repo_path(root: &Path, path: &Path) -> Option<String> {
    let rel: PathBuf = path.strip_prefix(root).ok()?.to_path_buf();
    Some(
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

/// Run watch mode until the process is interrupted.
pub fn run(conn: &Connection, sealer: &Sealer, config: &CliConfig, root: &Path) -> Result<()> {
    let queue = EventQueue::new(config.client.event_capacity);
    let window = Duration::from_millis(config.client.debounce_ms);
    let poll = Duration::from_secs(config.poll_seconds.max(1));

    info!("watching '{}' (poll every {:?})", root.display(), poll);

    std::thread::scope(|scope| {
        let (debounced_tx, debounced_rx) = crossbeam_channel::bounded::<ChangeEvent>(64);

        scope.spawn(|| run_debouncer(&queue, window, debounced_tx));
        let committer = scope.spawn(|| run_committer(conn, sealer, root, debounced_rx));

        // Scanner loop on this thread. The first scan seeds the snapshot and
        // commits everything present, bringing the repository current.
        let mut snapshot = HashMap::new();
        loop {
            scan(root, &mut snapshot, &queue);
            if committer.is_finished() {
                break;
            }
            std::thread::sleep(poll);
        }

        queue.close();
        match committer.join() {
            Ok(Ok(stats)) => {
                info!(
                    committed = stats.committed,
                    tombstones = stats.tombstones,
                    failed = stats.failed,
                    "watch finished"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(parapet_types::ParapetError::Cancelled),
        }
    })
}
