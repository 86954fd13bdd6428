//! Join synchronization: bootstrapping a new member from a live peer's snapshot.
//!
//! ```text
//!   joiner J                 session                 provider P
//!      │ ── Join ──────────────► │                         │
//!      │ ◄── Welcome, SyncWait ─ │ ── Synchronize ───────► │  cut = next seq
//!      │ ── Ack(SyncWait) ─────► │                         │
//!      │                         │ ◄── Raster(0..4096) ─── │
//!      │ ◄── Raster ──────────── │                         │
//!      │ ── Ack(Raster) ───────► │ ── Ack(Raster) ───────► │
//!      │                         │ ◄── Raster(final) ───── │
//!      │ ◄── Raster ──────────── │                         │
//!      │ ── Ack(Raster) ───────► │  Live: drain SyncBuffer │
//!      │ ◄── buffered ops ────── │                         │
//! ```
//!
//! Operations committed after the cut are held in the joiner's
//! [`SyncBuffer`] until the final chunk is acknowledged, then delivered in
//! commit order. Operations committed before the cut are already part of the
//! provider's picture.
//!
//! This module holds the state machines for all three roles; it does no I/O.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use uuid::Uuid;

use crate::broadcast::Frame;
use crate::protocol::{MessageKind, RasterChunk, UserId, RASTER_CHUNK_SIZE};

/// Phase of a joining member. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    /// Admitted, no snapshot chunk seen yet
    AwaitingSnapshot,
    /// At least one chunk seen, transfer incomplete
    Buffering,
    /// Snapshot applied and buffer drained
    Live,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("raster chunk out of order: expected offset {expected}, got {got}")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("malformed raster chunk: {0}")]
    MalformedChunk(&'static str),

    #[error("snapshot failed to decode: {0}")]
    DecodeFailed(String),

    #[error("sync buffer overflow ({entries} entries, {bytes} bytes)")]
    SyncBufferOverflow { entries: usize, bytes: usize },

    #[error("no member can provide a snapshot")]
    NoSyncSource,

    #[error("raster received while already live")]
    AlreadyLive,
}

/// Progress of a transfer after accepting a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferProgress {
    Partial { received: u32, size: u32 },
    Complete { size: u32 },
}

/// Validates the offset/length/size bookkeeping of a chunk stream.
///
/// Chunks must be contiguous; an offset-0 chunk restarts the transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferCursor {
    received: u32,
    size: Option<u32>,
    complete: bool,
}

impl TransferCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `chunk` against the stream so far and advance.
    ///
    /// Returns `restarted = true` in the second tuple slot when the chunk
    /// discards a previous partial transfer.
    pub fn advance(&mut self, chunk: &RasterChunk) -> Result<(TransferProgress, bool), SyncError> {
        if chunk.length as usize != chunk.data.len() {
            return Err(SyncError::MalformedChunk("length does not match payload"));
        }

        if chunk.size == 0 {
            if chunk.offset != 0 || chunk.length != 0 {
                return Err(SyncError::MalformedChunk("empty transfer with data"));
            }
            let restarted = self.received > 0;
            *self = Self {
                received: 0,
                size: Some(0),
                complete: true,
            };
            return Ok((TransferProgress::Complete { size: 0 }, restarted));
        }

        let mut restarted = false;
        if chunk.offset == 0 {
            restarted = self.received > 0;
            self.received = 0;
            self.size = Some(chunk.size);
            self.complete = false;
        } else {
            if self.complete {
                return Err(SyncError::MalformedChunk("chunk after completed transfer"));
            }
            if self.size != Some(chunk.size) {
                return Err(SyncError::MalformedChunk("total size changed mid-transfer"));
            }
            if chunk.offset != self.received {
                return Err(SyncError::OutOfOrder {
                    expected: self.received,
                    got: chunk.offset,
                });
            }
        }

        if chunk.length == 0 {
            return Err(SyncError::MalformedChunk("empty chunk in non-empty transfer"));
        }
        let end = chunk
            .offset
            .checked_add(chunk.length)
            .filter(|end| *end <= chunk.size)
            .ok_or(SyncError::MalformedChunk("chunk extends past total size"))?;

        self.received = end;
        if end == chunk.size {
            self.complete = true;
            Ok((TransferProgress::Complete { size: chunk.size }, restarted))
        } else {
            Ok((
                TransferProgress::Partial {
                    received: end,
                    size: chunk.size,
                },
                restarted,
            ))
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn received(&self) -> u32 {
        self.received
    }
}

/// Caps on how much a single joining member may have buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncBufferLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for SyncBufferLimits {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 16 * 1024 * 1024,
        }
    }
}

/// FIFO of frames committed while a member is synchronizing.
#[derive(Debug)]
pub struct SyncBuffer {
    queue: VecDeque<Frame>,
    bytes: usize,
    limits: SyncBufferLimits,
}

impl SyncBuffer {
    pub fn new(limits: SyncBufferLimits) -> Self {
        Self {
            queue: VecDeque::new(),
            bytes: 0,
            limits,
        }
    }

    pub fn push(&mut self, frame: Frame) -> Result<(), SyncError> {
        let bytes = self.bytes + frame.len();
        if self.queue.len() >= self.limits.max_entries || bytes > self.limits.max_bytes {
            return Err(SyncError::SyncBufferOverflow {
                entries: self.queue.len(),
                bytes: self.bytes,
            });
        }
        self.bytes = bytes;
        self.queue.push_back(frame);
        Ok(())
    }

    /// Take everything, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = Frame> + '_ {
        self.bytes = 0;
        self.queue.drain(..)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Server-side synchronization state of one joining member.
#[derive(Debug)]
pub struct MemberSync {
    phase: SyncPhase,
    provider: UserId,
    /// `Synchronize` has been sent to the provider for this member
    requested: bool,
    /// The joiner acknowledged `SyncWait`
    joiner_ready: bool,
    /// Log sequence number the snapshot corresponds to
    cut: Option<u64>,
    /// Which of the provider's `Synchronize` requests serves this member
    ticket: u64,
    cursor: TransferCursor,
    /// Chunk relayed to the joiner, not yet acknowledged
    awaiting_ack: bool,
    /// Chunk received before the joiner was ready
    pending: Option<Frame>,
    buffer: SyncBuffer,
}

impl MemberSync {
    pub fn new(provider: UserId, limits: SyncBufferLimits) -> Self {
        Self {
            phase: SyncPhase::AwaitingSnapshot,
            provider,
            requested: false,
            joiner_ready: false,
            cut: None,
            ticket: 0,
            cursor: TransferCursor::new(),
            awaiting_ack: false,
            pending: None,
            buffer: SyncBuffer::new(limits),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn provider(&self) -> UserId {
        self.provider
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub fn cut(&self) -> Option<u64> {
        self.cut
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Every chunk of the snapshot has been accepted from the provider.
    pub fn has_full_snapshot(&self) -> bool {
        self.cursor.is_complete()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Mark the snapshot as requested at log position `cut`. `ticket` is the
    /// provider's request counter at the time `Synchronize` was sent.
    pub fn start(&mut self, cut: u64, ticket: u64) {
        self.requested = true;
        self.cut = Some(cut);
        self.ticket = ticket;
    }

    /// Point this member at a new provider, discarding transfer progress.
    ///
    /// Buffered operations are dropped because the next snapshot is cut
    /// later and already contains them. The other buffered frames are
    /// returned, oldest first, for direct delivery.
    pub fn reassign(&mut self, provider: UserId) -> Vec<Frame> {
        let kept = self
            .buffer
            .drain()
            .filter(|frame| frame.first() != Some(&(MessageKind::Operation as u8)))
            .collect();
        self.provider = provider;
        self.requested = false;
        self.cut = None;
        self.ticket = 0;
        self.cursor = TransferCursor::new();
        self.awaiting_ack = false;
        self.pending = None;
        self.phase = SyncPhase::AwaitingSnapshot;
        kept
    }

    /// Buffer a committed frame. Returns `Ok(false)` when the snapshot has
    /// not been cut yet and the frame was not buffered.
    pub fn buffer_frame(&mut self, frame: Frame) -> Result<bool, SyncError> {
        if self.cut.is_none() {
            return Ok(false);
        }
        self.buffer.push(frame)?;
        Ok(true)
    }

    /// Validate a chunk coming from the provider.
    pub fn accept_chunk(&mut self, chunk: &RasterChunk) -> Result<TransferProgress, SyncError> {
        if self.awaiting_ack || self.pending.is_some() {
            return Err(SyncError::MalformedChunk("chunk sent before previous was acknowledged"));
        }
        let (progress, _) = self.cursor.advance(chunk)?;
        Ok(progress)
    }

    /// Record that a chunk frame is ready for the joiner. Returns the frame
    /// to send now, or `None` if it must wait for the joiner's `SyncWait` ack.
    pub fn stage_chunk(&mut self, frame: Frame) -> Option<Frame> {
        if self.joiner_ready {
            self.awaiting_ack = true;
            self.phase = SyncPhase::Buffering;
            Some(frame)
        } else {
            self.pending = Some(frame);
            None
        }
    }

    /// The joiner acknowledged `SyncWait`. Returns a held chunk to send.
    pub fn joiner_ready(&mut self) -> Option<Frame> {
        self.joiner_ready = true;
        let frame = self.pending.take()?;
        self.awaiting_ack = true;
        self.phase = SyncPhase::Buffering;
        Some(frame)
    }

    /// The joiner acknowledged a chunk. Returns `Ok(true)` when the transfer
    /// is complete and the member may go live.
    pub fn chunk_acked(&mut self) -> Result<bool, SyncError> {
        if !self.awaiting_ack {
            return Err(SyncError::MalformedChunk("acknowledgement without a chunk in flight"));
        }
        self.awaiting_ack = false;
        Ok(self.cursor.is_complete())
    }

    /// Finish: mark live and hand back the buffered frames in commit order.
    pub fn finish(mut self) -> Vec<Frame> {
        self.phase = SyncPhase::Live;
        self.buffer.drain().collect()
    }
}

/// Provider side: a frozen snapshot streamed in fixed-size chunks.
#[derive(Debug, Clone)]
pub struct SnapshotUpload {
    session_id: Uuid,
    data: Vec<u8>,
    offset: usize,
    chunk_size: usize,
    sent_any: bool,
}

impl SnapshotUpload {
    pub fn new(session_id: Uuid, data: Vec<u8>) -> Self {
        Self::with_chunk_size(session_id, data, RASTER_CHUNK_SIZE)
    }

    pub fn with_chunk_size(session_id: Uuid, data: Vec<u8>, chunk_size: usize) -> Self {
        Self {
            session_id,
            data,
            offset: 0,
            chunk_size: chunk_size.max(1),
            sent_any: false,
        }
    }

    /// Next chunk to send, or `None` once everything has been sent.
    /// An empty snapshot yields exactly one degenerate chunk.
    pub fn next_chunk(&mut self) -> Option<RasterChunk> {
        if self.data.is_empty() {
            if self.sent_any {
                return None;
            }
            self.sent_any = true;
            return Some(RasterChunk::empty(self.session_id));
        }
        if self.offset >= self.data.len() {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = RasterChunk {
            session_id: self.session_id,
            offset: self.offset as u32,
            length: (end - self.offset) as u32,
            size: self.data.len() as u32,
            data: self.data[self.offset..end].to_vec(),
        };
        self.offset = end;
        self.sent_any = true;
        Some(chunk)
    }

    pub fn is_complete(&self) -> bool {
        self.sent_any && self.offset >= self.data.len()
    }
}

/// Snapshot decoding failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SnapshotError(pub String);

/// The local picture a client keeps in step with the session.
///
/// Rendering is out of scope here; a canvas only needs to apply operations
/// in order and round-trip its state through an opaque snapshot.
pub trait Canvas: Send + 'static {
    /// Apply one committed operation.
    fn apply(&mut self, user: UserId, op: &[u8]);

    /// Serialize the current picture.
    fn snapshot(&self) -> Vec<u8>;

    /// Replace the picture with a decoded snapshot. An empty slice means a
    /// blank canvas.
    fn restore(&mut self, snapshot: &[u8]) -> Result<(), SnapshotError>;
}

/// A canvas whose picture is the ordered list of applied operations.
///
/// Useful for headless clients and for checking ordering guarantees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayCanvas {
    ops: Vec<(UserId, Vec<u8>)>,
}

impl ReplayCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[(UserId, Vec<u8>)] {
        &self.ops
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.ops.iter().map(|(_, op)| op.clone()).collect()
    }
}

impl Canvas for ReplayCanvas {
    fn apply(&mut self, user: UserId, op: &[u8]) {
        self.ops.push((user, op.to_vec()));
    }

    fn snapshot(&self) -> Vec<u8> {
        if self.ops.is_empty() {
            return Vec::new();
        }
        bincode::serde::encode_to_vec(&self.ops, bincode::config::standard()).unwrap_or_default()
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<(), SnapshotError> {
        if snapshot.is_empty() {
            self.ops.clear();
            return Ok(());
        }
        let (ops, read): (Vec<(UserId, Vec<u8>)>, usize) =
            bincode::serde::decode_from_slice(snapshot, bincode::config::standard())
                .map_err(|e| SnapshotError(e.to_string()))?;
        if read != snapshot.len() {
            return Err(SnapshotError(format!("{} trailing bytes", snapshot.len() - read)));
        }
        self.ops = ops;
        Ok(())
    }
}

/// Joiner side: reassembles the snapshot and buffers operations until live.
#[derive(Debug)]
pub struct JoinSync {
    phase: SyncPhase,
    cursor: TransferCursor,
    raster: Vec<u8>,
    pending: VecDeque<(UserId, Vec<u8>)>,
    limits: SyncBufferLimits,
    pending_bytes: usize,
}

/// Outcome of feeding a chunk to [`JoinSync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinProgress {
    /// More chunks expected; percent received
    Receiving(u8),
    /// Snapshot applied; `replayed` buffered operations drained
    Live { replayed: usize },
}

impl Default for JoinSync {
    fn default() -> Self {
        Self::new(SyncBufferLimits::default())
    }
}

impl JoinSync {
    pub fn new(limits: SyncBufferLimits) -> Self {
        Self {
            phase: SyncPhase::AwaitingSnapshot,
            cursor: TransferCursor::new(),
            raster: Vec::new(),
            pending: VecDeque::new(),
            limits,
            pending_bytes: 0,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn is_live(&self) -> bool {
        self.phase == SyncPhase::Live
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Feed one chunk. On the final chunk the snapshot is restored into
    /// `canvas` and buffered operations are applied in arrival order.
    pub fn on_raster(
        &mut self,
        chunk: &RasterChunk,
        canvas: &mut dyn Canvas,
    ) -> Result<JoinProgress, SyncError> {
        if self.phase == SyncPhase::Live {
            return Err(SyncError::AlreadyLive);
        }
        let (progress, restarted) = self.cursor.advance(chunk)?;
        if restarted || chunk.offset == 0 {
            self.raster.clear();
        }
        self.raster.extend_from_slice(&chunk.data);

        match progress {
            TransferProgress::Partial { received, size } => {
                self.phase = SyncPhase::Buffering;
                Ok(JoinProgress::Receiving(
                    (u64::from(received) * 99 / u64::from(size)) as u8,
                ))
            }
            TransferProgress::Complete { .. } => {
                let raster = std::mem::take(&mut self.raster);
                canvas
                    .restore(&raster)
                    .map_err(|e| SyncError::DecodeFailed(e.0))?;
                self.phase = SyncPhase::Live;
                let replayed = self.pending.len();
                for (user, op) in self.pending.drain(..) {
                    canvas.apply(user, &op);
                }
                self.pending_bytes = 0;
                Ok(JoinProgress::Live { replayed })
            }
        }
    }

    /// Feed one committed operation. Applied immediately when live,
    /// buffered otherwise. Returns whether it was applied.
    pub fn on_operation(
        &mut self,
        user: UserId,
        op: Vec<u8>,
        canvas: &mut dyn Canvas,
    ) -> Result<bool, SyncError> {
        if self.phase == SyncPhase::Live {
            canvas.apply(user, &op);
            return Ok(true);
        }
        if self.pending.len() >= self.limits.max_entries
            || self.pending_bytes + op.len() > self.limits.max_bytes
        {
            return Err(SyncError::SyncBufferOverflow {
                entries: self.pending.len(),
                bytes: self.pending_bytes,
            });
        }
        self.pending_bytes += op.len();
        self.pending.push_back((user, op));
        Ok(false)
    }

    /// Drop partial state (connection lost mid-join).
    pub fn abort(&mut self) {
        self.raster.clear();
        self.pending.clear();
        self.pending_bytes = 0;
        self.cursor = TransferCursor::new();
    }
}
