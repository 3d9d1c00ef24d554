//! Change-event plumbing between the watcher collaborator and the committer.
//!
//! The watcher pushes [`ChangeEvent`]s into a bounded [`EventQueue`];
//! backpressure is expressed by the queue capacity, with oldest-dropped and
//! per-path coalescing. A debouncer worker holds each path until it has been
//! idle for the debounce window, then hands it to the committer, which
//! processes one path at a time.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use parapet_types::{Action, Result};

use crate::client::{delta, Connection};
use crate::crypto::Sealer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: String,
    pub kind: ChangeKind,
}

/// Bounded event queue with per-path coalescing.
///
/// A new event for a path already queued replaces that entry in place (a
/// create followed by a modify is still a create). When full, the oldest
/// entry is dropped; the newest state of a path always survives.
pub struct EventQueue {
    state: Mutex<QueueState>,
    added: Condvar,
    capacity: usize,
}

struct QueueState {
    events: VecDeque<ChangeEvent>,
    closed: bool,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        EventQueue {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                closed: false,
            }),
            added: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue an event. Never blocks.
    pub fn push(&self, event: ChangeEvent) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        if let Some(existing) = state.events.iter_mut().find(|e| e.path == event.path) {
            existing.kind = coalesce(existing.kind, event.kind);
        } else {
            if state.events.len() >= self.capacity {
                if let Some(dropped) = state.events.pop_front() {
                    warn!(path = %dropped.path, "event queue full, dropped oldest");
                }
            }
            state.events.push_back(event);
        }
        self.added.notify_one();
    }

    /// Dequeue the next event, waiting up to `timeout`. `None` on timeout or
    /// when the queue is closed and drained.
    pub fn pop(&self, timeout: Duration) -> Option<ChangeEvent> {
        let mut state = self.state.lock().unwrap();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            if state.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, timed_out) = self.added.wait_timeout(state, deadline - now).unwrap();
            state = next;
            if timed_out.timed_out() && state.events.is_empty() {
                return None;
            }
        }
    }

    /// Close the queue; pending events remain poppable.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.added.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

fn coalesce(old: ChangeKind, new: ChangeKind) -> ChangeKind {
    match (old, new) {
        // The repository has never seen this path; whatever happens next,
        // its first commit is a create.
        (ChangeKind::Created, ChangeKind::Modified) => ChangeKind::Created,
        (_, kind) => kind,
    }
}

/// Drain the queue, coalescing bursts per path: a path is released only
/// after it has been idle for `window`. Returns when the queue closes and
/// every held path has been flushed.
pub fn run_debouncer(queue: &EventQueue, window: Duration, out: Sender<ChangeEvent>) {
    let mut held: HashMap<String, (ChangeKind, Instant)> = HashMap::new();

    loop {
        // Wake early enough to release the path closest to its deadline.
        let wait = held
            .values()
            .map(|(_, since)| {
                let elapsed = since.elapsed();
                window.saturating_sub(elapsed)
            })
            .min()
            .unwrap_or(window);

        if let Some(event) = queue.pop(wait.max(Duration::from_millis(1))) {
            let entry = held
                .entry(event.path.clone())
                .or_insert((event.kind, Instant::now()));
            entry.0 = coalesce(entry.0, event.kind);
            entry.1 = Instant::now();
        }

        // On shutdown, flush everything still held instead of waiting out
        // each window.
        let flush_all = queue.is_closed();
        let due: Vec<String> = held
            .iter()
            .filter(|(_, (_, since))| flush_all || since.elapsed() >= window)
            .map(|(path, _)| path.clone())
            .collect();
        for path in due {
            let (kind, _) = held.remove(&path).expect("path was just listed as due");
            debug!(%path, "debounce window elapsed");
            if out.send(ChangeEvent { path, kind }).is_err() {
                return;
            }
        }

        if queue.is_closed() && held.is_empty() {
            // Drain events pushed before the close.
            match queue.pop(Duration::from_millis(0)) {
                Some(event) => {
                    held.insert(event.path, (event.kind, Instant::now()));
                }
                None => return,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommitterStats {
    pub committed: u64,
    pub tombstones: u64,
    pub failed: u64,
}

/// Drain debounced events, one path at a time. Missing files become
/// tombstones (the file vanished between the event and the commit).
pub fn run_committer(
    conn: &Connection,
    sealer: &Sealer,
    source_root: &Path,
    rx: crossbeam_channel::Receiver<ChangeEvent>,
) -> Result<CommitterStats> {
    let mut stats = CommitterStats::default();
    for event in rx {
        let result = match event.kind {
            ChangeKind::Removed => delta::commit_delete(conn, &event.path).map(|_| ()),
            kind => {
                let source = source_root.join(&event.path);
                if source.is_file() {
                    let action = match kind {
                        ChangeKind::Created => Action::Created,
                        _ => Action::Modified,
                    };
                    delta::commit_file(conn, sealer, &event.path, &source, action).map(|_| ())
                } else {
                    delta::commit_delete(conn, &event.path).map(|_| ())
                }
            }
        };
        match result {
            Ok(()) => {
                if event.kind == ChangeKind::Removed {
                    stats.tombstones += 1;
                } else {
                    stats.committed += 1;
                }
            }
            Err(e) => {
                warn!(path = %event.path, "commit failed: {e}");
                stats.failed += 1;
            }
        }
    }
    Ok(stats)
}
