//! Binary wire protocol for the canvas synchronization core.
//!
//! Every WebSocket binary frame carries exactly one message:
//! ```text
//! ┌──────────┬──────────────────────────────────────────────┐
//! │ kind     │ body (bincode, big-endian, fixed-width ints)  │
//! │ 1 byte   │ variable                                      │
//! └──────────┴──────────────────────────────────────────────┘
//! ```
//!
//! The kind tag is decoded first and matched exhaustively; an unknown tag
//! is reported as [`ProtocolError::UnknownMessage`] rather than skipped.
//! The transport delivers frames in order per connection, which the raster
//! transfer relies on.

use bincode::config::Config;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-session member id. Allocated from a monotonically increasing counter,
/// never reused within the lifetime of one session.
pub type UserId = u32;

/// Snapshot chunk size used by providers.
pub const RASTER_CHUNK_SIZE: usize = 4 * 1024;

/// Largest encoded message, tag included.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Message kind tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Session select: host a new session or join an existing one
    Join = 1,
    /// Admission accepted
    Welcome = 2,
    /// Member joined or left
    UserInfo = 3,
    /// Snapshot chunk
    Raster = 4,
    /// Provider: serialize your picture and stream it
    Synchronize = 5,
    /// Joiner: hold still until the snapshot arrives
    SyncWait = 6,
    /// Acknowledgement of an earlier message
    Ack = 7,
    /// Lock / unlock / kick / delegate
    SessionEvent = 8,
    /// Chat line
    Chat = 9,
    /// Opaque drawing command
    Operation = 10,
    /// Error notice
    Error = 11,
    /// Heartbeat ping
    Ping = 12,
    /// Heartbeat pong
    Pong = 13,
}

impl MessageKind {
    /// Resolve a wire tag.
    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        Ok(match tag {
            1 => Self::Join,
            2 => Self::Welcome,
            3 => Self::UserInfo,
            4 => Self::Raster,
            5 => Self::Synchronize,
            6 => Self::SyncWait,
            7 => Self::Ack,
            8 => Self::SessionEvent,
            9 => Self::Chat,
            10 => Self::Operation,
            11 => Self::Error,
            12 => Self::Ping,
            13 => Self::Pong,
            other => return Err(ProtocolError::UnknownMessage(other)),
        })
    }
}

/// Membership change carried by [`UserInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserEvent {
    Join,
    Leave,
    Disconnect,
    BrokenPipe,
    TimedOut,
    Dropped,
    Kicked,
}

/// Session-level action carried by [`SessionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionAction {
    Lock,
    Unlock,
    Kick,
    Delegate,
}

/// Error codes sent to clients in [`ErrorNotice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Banned,
    Full,
    Locked,
    NotFound,
    AliasTaken,
    TooManySessions,
    ShuttingDown,
    Terminating,
    NotOwner,
    NotReady,
    NoSyncSource,
    BadRaster,
    SyncBufferOverflow,
    UnexpectedMessage,
    Malformed,
    BadPassword,
}

/// Host a new session (`host == true`) or join an existing one by id or alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Session UUID or alias. When hosting, a non-empty value becomes the alias.
    pub session: String,
    /// Display name
    pub name: String,
    pub host: bool,
    /// Requested member limit when hosting (0 = server limit)
    pub max_members: u32,
    /// Ask for the session to outlive its last member (honored only when the
    /// server has persistence enabled)
    pub persistent: bool,
    /// Sets the session password when hosting; must match it when joining.
    /// Empty means none.
    pub password: String,
}

impl JoinRequest {
    pub fn host(alias: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            session: alias.into(),
            name: name.into(),
            host: true,
            max_members: 0,
            persistent: false,
            password: String::new(),
        }
    }

    pub fn join(session: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            name: name.into(),
            host: false,
            max_members: 0,
            persistent: false,
            password: String::new(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub session_id: Uuid,
    pub user_id: UserId,
    pub owner: UserId,
    pub alias: Option<String>,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub session_id: Uuid,
    pub user_id: UserId,
    pub event: UserEvent,
    pub name: String,
    pub locked: bool,
}

/// One chunk of a snapshot transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterChunk {
    pub session_id: Uuid,
    /// Byte offset of this chunk in the whole snapshot
    pub offset: u32,
    /// Number of bytes in `data`
    pub length: u32,
    /// Total snapshot size
    pub size: u32,
    pub data: Vec<u8>,
}

impl RasterChunk {
    /// The single chunk describing an empty (blank canvas) transfer.
    pub fn empty(session_id: Uuid) -> Self {
        Self {
            session_id,
            offset: 0,
            length: 0,
            size: 0,
            data: Vec::new(),
        }
    }

    pub fn is_empty_transfer(&self) -> bool {
        self.size == 0
    }

    /// Whether this chunk ends the transfer.
    pub fn is_final(&self) -> bool {
        self.size == 0 || u64::from(self.offset) + u64::from(self.length) == u64::from(self.size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub session_id: Uuid,
    pub event: MessageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub action: SessionAction,
    /// `None` addresses the whole session
    pub target: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub session_id: Uuid,
    /// 0 for server messages
    pub user_id: UserId,
    pub text: String,
}

/// An opaque drawing command. The core never interprets the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub session_id: Uuid,
    pub user_id: UserId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub code: ErrorCode,
    pub detail: String,
}

impl ErrorNotice {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Join(JoinRequest),
    Welcome(Welcome),
    UserInfo(UserInfo),
    Raster(RasterChunk),
    Synchronize { session_id: Uuid },
    SyncWait { session_id: Uuid },
    Ack(Ack),
    SessionEvent(SessionEvent),
    Chat(Chat),
    Operation(Operation),
    Error(ErrorNotice),
    Ping,
    Pong,
}

fn wire_config() -> impl Config {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

fn encode_body<T: Serialize>(kind: MessageKind, body: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut out = vec![kind as u8];
    let encoded = bincode::serde::encode_to_vec(body, wire_config())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
    out.extend_from_slice(&encoded);
    Ok(out)
}

fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (body, read) = bincode::serde::decode_from_slice(bytes, wire_config())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::TrailingBytes(bytes.len() - read));
    }
    Ok(body)
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Join(_) => MessageKind::Join,
            Self::Welcome(_) => MessageKind::Welcome,
            Self::UserInfo(_) => MessageKind::UserInfo,
            Self::Raster(_) => MessageKind::Raster,
            Self::Synchronize { .. } => MessageKind::Synchronize,
            Self::SyncWait { .. } => MessageKind::SyncWait,
            Self::Ack(_) => MessageKind::Ack,
            Self::SessionEvent(_) => MessageKind::SessionEvent,
            Self::Chat(_) => MessageKind::Chat,
            Self::Operation(_) => MessageKind::Operation,
            Self::Error(_) => MessageKind::Error,
            Self::Ping => MessageKind::Ping,
            Self::Pong => MessageKind::Pong,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let kind = self.kind();
        let bytes = match self {
            Self::Join(m) => encode_body(kind, m),
            Self::Welcome(m) => encode_body(kind, m),
            Self::UserInfo(m) => encode_body(kind, m),
            Self::Raster(m) => encode_body(kind, m),
            Self::Synchronize { session_id } | Self::SyncWait { session_id } => {
                encode_body(kind, session_id)
            }
            Self::Ack(m) => encode_body(kind, m),
            Self::SessionEvent(m) => encode_body(kind, m),
            Self::Chat(m) => encode_body(kind, m),
            Self::Operation(m) => encode_body(kind, m),
            Self::Error(m) => encode_body(kind, m),
            Self::Ping | Self::Pong => Ok(vec![kind as u8]),
        }?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge(bytes.len()));
        }
        let (&tag, body) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let kind = MessageKind::from_tag(tag)?;
        Ok(match kind {
            MessageKind::Join => Self::Join(decode_body(body)?),
            MessageKind::Welcome => Self::Welcome(decode_body(body)?),
            MessageKind::UserInfo => Self::UserInfo(decode_body(body)?),
            MessageKind::Raster => Self::Raster(decode_body(body)?),
            MessageKind::Synchronize => Self::Synchronize {
                session_id: decode_body(body)?,
            },
            MessageKind::SyncWait => Self::SyncWait {
                session_id: decode_body(body)?,
            },
            MessageKind::Ack => Self::Ack(decode_body(body)?),
            MessageKind::SessionEvent => Self::SessionEvent(decode_body(body)?),
            MessageKind::Chat => Self::Chat(decode_body(body)?),
            MessageKind::Operation => Self::Operation(decode_body(body)?),
            MessageKind::Error => Self::Error(decode_body(body)?),
            MessageKind::Ping | MessageKind::Pong => {
                if !body.is_empty() {
                    return Err(ProtocolError::TrailingBytes(body.len()));
                }
                if kind == MessageKind::Ping {
                    Self::Ping
                } else {
                    Self::Pong
                }
            }
        })
    }

    pub fn error(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Error(ErrorNotice::new(code, detail))
    }

    pub fn ack(session_id: Uuid, event: MessageKind) -> Self {
        Self::Ack(Ack { session_id, event })
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    UnknownMessage(u8),
    EmptyFrame,
    TrailingBytes(usize),
    TooLarge(usize),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnknownMessage(tag) => write!(f, "Unknown message tag {tag}"),
            Self::EmptyFrame => write!(f, "Empty frame"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after message body"),
            Self::TooLarge(n) => write!(f, "Message of {n} bytes exceeds {MAX_MESSAGE_SIZE}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
