//! Committed-operation log and per-member fan-out primitives.
//!
//! Messages are encoded once and shared between members as [`Frame`]s.
//! Each connection owns an unbounded send queue; sessions only hold a
//! [`ConnectionLink`], a weak handle to that queue, so a member entry never
//! keeps a dead connection alive.
//!
//! ```text
//! Session::broadcast(msg)
//!       │ encode once
//!       ▼
//! CommittedLog::append ──► seq n
//!       │
//!       ├──► Live member      ──► ConnectionLink ──► send queue ──► socket
//!       └──► Syncing member   ──► SyncBuffer (FIFO, drained on Live)
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A pre-encoded protocol message shared between recipients.
pub type Frame = Arc<Vec<u8>>;

/// Items consumed by a connection's writer half.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Send this frame
    Frame(Frame),
    /// Flush what is queued, then close the connection
    Close,
}

/// Weak back-reference from a session member to its connection's send queue.
#[derive(Debug, Clone)]
pub struct ConnectionLink {
    tx: mpsc::WeakUnboundedSender<Outbound>,
}

impl ConnectionLink {
    pub fn new(tx: &mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx: tx.downgrade() }
    }

    /// Queue a frame. Returns `false` if the connection is gone.
    pub fn send(&self, frame: Frame) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(Outbound::Frame(frame)).is_ok(),
            None => false,
        }
    }

    /// Ask the connection to close after flushing its queue.
    pub fn close(&self) {
        if let Some(tx) = self.tx.upgrade() {
            let _ = tx.send(Outbound::Close);
        }
    }
}

/// Delivery counters, lock-free on the hot path.
#[derive(Debug, Default)]
pub struct BroadcastStats {
    committed: AtomicU64,
    delivered: AtomicU64,
    buffered: AtomicU64,
    undeliverable: AtomicU64,
}

/// Point-in-time copy of [`BroadcastStats`], reported in the admin session view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSnapshot {
    pub committed: u64,
    pub delivered: u64,
    pub buffered: u64,
    pub undeliverable: u64,
}

impl BroadcastStats {
    pub fn record_commit(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self, ok: bool) {
        if ok {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.undeliverable.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_buffered(&self) {
        self.buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BroadcastSnapshot {
        BroadcastSnapshot {
            committed: self.committed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            undeliverable: self.undeliverable.load(Ordering::Relaxed),
        }
    }
}

/// Commit order of everything a session has broadcast.
///
/// Sequence numbers start at 0 and never repeat. Frames are not retained
/// here; the full history goes to the recording sink when one is attached.
#[derive(Debug, Default)]
pub struct CommittedLog {
    next_seq: u64,
}

impl CommittedLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit the next message, returning its sequence number.
    pub fn append(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Sequence number the next commit will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Number of commits so far.
    pub fn len(&self) -> u64 {
        self.next_seq
    }

    pub fn is_empty(&self) -> bool {
        self.next_seq == 0
    }
}
