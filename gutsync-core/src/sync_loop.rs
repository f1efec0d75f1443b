//! The debounced watch → commit → pull control loop.
//!
//! Watchers on both nodes push [`SyncEvent`]s into one unbounded queue.
//! The loop is the only consumer and the only owner of the pending change
//! sets, so nothing here needs a lock.
//!
//! Two states:
//! - draining: nothing pending, block until the next event
//! - debouncing: something pending, wait at most one debounce window for
//!   another event; when the window passes quietly, flush every side that
//!   has pending changes (one after another) and go back to draining
//!
//! [`SyncEvent::Shutdown`] ends the loop in either state.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::node::Side;
use crate::paths::{is_ignore_file, is_metadata_path};

/// A path (relative to the sync root) that changed on one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub side: Side,
    pub path: String,
}

impl ChangeEvent {
    pub fn new(side: Side, path: impl Into<String>) -> Self {
        Self {
            side,
            path: path.into(),
        }
    }
}

/// Items on the shared event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Change(ChangeEvent),
    /// Ends the loop, even mid-debounce.
    Shutdown,
}

pub type EventSender = mpsc::UnboundedSender<SyncEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SyncEvent>;

pub fn event_queue() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Paths changed on one side since the last flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChanges {
    paths: BTreeSet<String>,
    rescan: bool,
}

impl PendingChanges {
    /// Stage everything, including untracked files.
    pub fn full_rescan() -> Self {
        Self {
            paths: BTreeSet::new(),
            rescan: true,
        }
    }

    pub fn record(&mut self, path: &str) {
        if is_ignore_file(path) {
            self.rescan = true;
        }
        self.paths.insert(path.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && !self.rescan
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths.iter().cloned().collect()
    }

    /// Whether the next commit must pick up previously untracked files.
    pub fn rescan(&self) -> bool {
        self.rescan
    }
}

/// Receives flushed change sets.
#[async_trait]
pub trait ChangeSink: Send {
    async fn flush(&mut self, side: Side, changes: PendingChanges) -> Result<()>;
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    /// Every sender was dropped.
    QueueClosed,
}

pub struct SyncLoop {
    events: EventReceiver,
    window: Duration,
    pending: BTreeMap<Side, PendingChanges>,
}

impl SyncLoop {
    pub fn new(events: EventReceiver, window: Duration) -> Self {
        Self {
            events,
            window,
            pending: BTreeMap::new(),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending(&self, side: Side) -> Option<&PendingChanges> {
        self.pending.get(&side)
    }

    /// Merge one event into its side's pending set. Events inside the
    /// backend metadata directory are dropped.
    pub fn record(&mut self, event: ChangeEvent) {
        if is_metadata_path(&event.path) {
            tracing::debug!(side = %event.side, path = %event.path, "ignoring change");
            return;
        }
        if is_ignore_file(&event.path) {
            tracing::info!(side = %event.side, path = %event.path, "ignore file changed; next commit rescans");
        } else {
            tracing::debug!(side = %event.side, path = %event.path, "changed");
        }
        self.pending
            .entry(event.side)
            .or_default()
            .record(&event.path);
    }

    /// Hand every non-empty pending set to `sink`, one side at a time.
    pub async fn flush<S: ChangeSink>(&mut self, sink: &mut S) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for (side, changes) in pending {
            if !changes.is_empty() {
                sink.flush(side, changes).await?;
            }
        }
        Ok(())
    }

    /// Run until shutdown. An error from the sink ends the loop.
    pub async fn run<S: ChangeSink>(&mut self, sink: &mut S) -> Result<LoopExit> {
        loop {
            let next = if self.pending.is_empty() {
                self.events.recv().await
            } else {
                match tokio::time::timeout(self.window, self.events.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        self.flush(sink).await?;
                        continue;
                    }
                }
            };
            match next {
                Some(SyncEvent::Change(event)) => self.record(event),
                Some(SyncEvent::Shutdown) => {
                    tracing::info!("shutdown requested; leaving sync loop");
                    return Ok(LoopExit::Shutdown);
                }
                None => return Ok(LoopExit::QueueClosed),
            }
        }
    }
}
