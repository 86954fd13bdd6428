//! # easel-collab: real-time synchronization core for shared canvases
//!
//! A server hosts named sessions. Members submit opaque drawing operations;
//! the server commits them to a per-session log and delivers them to every
//! member in commit order. A member joining mid-session receives a snapshot
//! streamed by an existing member, followed by every operation committed
//! after the snapshot was cut.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer       │
//! │ (per user)  │     Binary Proto    │  SessionRegistry │
//! └──────┬──────┘                     └────────┬─────────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌─────────────┐                     ┌──────────────────┐
//! │ Canvas      │                     │ Session          │
//! │ + JoinSync  │                     │  CommittedLog    │
//! └─────────────┘                     │  MemberSync      │
//!                                     └────────┬─────────┘
//!                                              │
//!                              ┌───────────────┼──────────────┐
//!                              ▼               ▼              ▼
//!                        BanRegistry    SettingsHandle   RecordingSink
//!                              └──── ServerStore ───┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary wire protocol (kind tag + bincode body)
//! - [`broadcast`]: committed log and per-connection send queues
//! - [`sync`]: join synchronization state, both sides
//! - [`session`]: membership, locks, ownership, fan-out
//! - [`registry`]: admission, lookup, server lifecycle
//! - [`ban`]: address and subnet bans
//! - [`config`]: startup config and runtime settings
//! - [`admin`]: administrative control plane
//! - [`storage`]: RocksDB server state and session recordings
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client

pub mod admin;
pub mod ban;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod sync;

pub use admin::{AdminApi, ApiMethod, ApiResponse, ApiStatus};
pub use ban::{BanEntry, BanError, BanRegistry};
pub use broadcast::{BroadcastStats, CommittedLog, ConnectionLink, Frame, Outbound};
pub use client::{ClientError, ClientSession, ConnectionState, SyncClient, SyncEvent};
pub use config::{ConfigError, ServerConfig, Settings, SettingsError, SettingsHandle};
pub use protocol::{ErrorCode, JoinRequest, Message, MessageKind, ProtocolError, UserId};
pub use registry::{Admission, AdmissionError, ServerState, SessionRegistry};
pub use server::{ServerError, SyncServer};
pub use session::{LeaveReason, Session, SessionError, SessionInfo, SessionOptions};
pub use storage::{
    RecordEntry, RecordingError, RecordingReader, RecordingSink, ServerStore, StoreConfig,
    StoreError,
};
pub use sync::{Canvas, JoinSync, ReplayCanvas, SnapshotUpload, SyncBufferLimits, SyncError, SyncPhase};
