//! WebSocket client: hosts or joins a session and keeps a local canvas in step.
//!
//! A client plays two roles in join synchronization:
//! - **joiner**: reassembles the snapshot chunk by chunk, acknowledging each,
//!   then applies the operations committed since the snapshot was cut
//! - **provider**: on `Synchronize`, freezes a snapshot of its canvas,
//!   acknowledges, and streams it one chunk per acknowledgement. Streaming
//!   waits while a local gesture is in progress.
//!
//! The client never applies its own operations locally; everything reaches the
//! canvas as an echo from the server, so every member applies the same
//! sequence. That is also what makes a snapshot frozen on `Synchronize`
//! exactly match the server's cut.
//!
//! [`ClientSession`] is the synchronous protocol state; [`SyncClient`] drives
//! it over a WebSocket.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use uuid::Uuid;

use crate::protocol::{
    Chat, ErrorCode, ErrorNotice, JoinRequest, Message, MessageKind, Operation, ProtocolError,
    SessionAction, SessionEvent, UserEvent, UserId, RASTER_CHUNK_SIZE,
};
use crate::sync::{Canvas, JoinProgress, JoinSync, SnapshotUpload, SyncBufferLimits, SyncPhase};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(#[from] WsError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Admitted into a session
    Welcome {
        session_id: Uuid,
        user_id: UserId,
        owner: UserId,
    },
    /// Snapshot transfer started for this client
    SyncStarted,
    /// Snapshot transfer progress in percent
    SyncProgress(u8),
    /// Snapshot applied; buffered operations replayed
    Live { replayed: usize },
    /// A committed operation was applied to the canvas
    Operation { user_id: UserId, payload: Vec<u8> },
    /// Another member needs a snapshot from this client
    SnapshotRequested,
    /// The requested snapshot has been fully sent
    SnapshotSent,
    UserJoined { user_id: UserId, name: String },
    UserLeft {
        user_id: UserId,
        name: String,
        event: UserEvent,
    },
    Chat { user_id: UserId, text: String },
    SessionEvent(SessionEvent),
    /// Error notice from the server, or a local sync failure
    Error(ErrorNotice),
    Disconnected,
}

/// Client-side protocol state for one session membership.
pub struct ClientSession<C: Canvas> {
    canvas: C,
    join: JoinSync,
    session_id: Option<Uuid>,
    user_id: Option<UserId>,
    upload: Option<SnapshotUpload>,
    in_flight: bool,
    gesture: bool,
    chunk_size: usize,
}

impl<C: Canvas> ClientSession<C> {
    pub fn new(canvas: C) -> Self {
        Self::with_options(canvas, SyncBufferLimits::default(), RASTER_CHUNK_SIZE)
    }

    pub fn with_options(canvas: C, limits: SyncBufferLimits, chunk_size: usize) -> Self {
        Self {
            canvas,
            join: JoinSync::new(limits),
            session_id: None,
            user_id: None,
            upload: None,
            in_flight: false,
            gesture: false,
            chunk_size,
        }
    }

    pub fn canvas(&self) -> &C {
        &self.canvas
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn phase(&self) -> SyncPhase {
        self.join.phase()
    }

    pub fn is_uploading(&self) -> bool {
        self.upload.is_some()
    }

    fn sid(&self) -> Uuid {
        self.session_id.unwrap_or_else(Uuid::nil)
    }

    /// Process one message from the server. Replies are appended to
    /// `replies`; the returned events are for the application.
    pub fn handle(&mut self, msg: Message, replies: &mut Vec<Message>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        match msg {
            Message::Welcome(welcome) => {
                self.session_id = Some(welcome.session_id);
                self.user_id = Some(welcome.user_id);
                events.push(SyncEvent::Welcome {
                    session_id: welcome.session_id,
                    user_id: welcome.user_id,
                    owner: welcome.owner,
                });
            }
            Message::UserInfo(info) => events.push(match info.event {
                UserEvent::Join => SyncEvent::UserJoined {
                    user_id: info.user_id,
                    name: info.name,
                },
                event => SyncEvent::UserLeft {
                    user_id: info.user_id,
                    name: info.name,
                    event,
                },
            }),
            Message::SyncWait { .. } => {
                replies.push(Message::ack(self.sid(), MessageKind::SyncWait));
                events.push(SyncEvent::SyncStarted);
            }
            Message::Raster(chunk) => {
                if self.join.is_live() {
                    if !chunk.is_empty_transfer() {
                        log::warn!("Ignoring snapshot chunk received while live");
                    }
                    return events;
                }
                match self.join.on_raster(&chunk, &mut self.canvas) {
                    Ok(progress) => {
                        replies.push(Message::ack(self.sid(), MessageKind::Raster));
                        events.push(match progress {
                            JoinProgress::Receiving(percent) => SyncEvent::SyncProgress(percent),
                            JoinProgress::Live { replayed } => SyncEvent::Live { replayed },
                        });
                    }
                    Err(e) => {
                        log::warn!("Snapshot transfer failed: {e}");
                        self.join.abort();
                        events.push(SyncEvent::Error(ErrorNotice::new(
                            ErrorCode::BadRaster,
                            e.to_string(),
                        )));
                    }
                }
            }
            Message::Synchronize { .. } => {
                let snapshot = self.canvas.snapshot();
                log::debug!("Snapshot of {} bytes requested", snapshot.len());
                self.upload = Some(SnapshotUpload::with_chunk_size(
                    self.sid(),
                    snapshot,
                    self.chunk_size,
                ));
                self.in_flight = false;
                replies.push(Message::ack(self.sid(), MessageKind::Synchronize));
                events.push(SyncEvent::SnapshotRequested);
                if !self.gesture {
                    self.send_next_chunk(replies, &mut events);
                }
            }
            Message::Ack(ack) if ack.event == MessageKind::Raster => {
                self.in_flight = false;
                if !self.gesture {
                    self.send_next_chunk(replies, &mut events);
                }
            }
            Message::Ack(ack) => log::trace!("Ack for {:?}", ack.event),
            Message::Operation(op) => {
                let applied = self
                    .join
                    .on_operation(op.user_id, op.payload.clone(), &mut self.canvas);
                match applied {
                    Ok(true) => events.push(SyncEvent::Operation {
                        user_id: op.user_id,
                        payload: op.payload,
                    }),
                    Ok(false) => {}
                    Err(e) => events.push(SyncEvent::Error(ErrorNotice::new(
                        ErrorCode::SyncBufferOverflow,
                        e.to_string(),
                    ))),
                }
            }
            Message::Chat(chat) => events.push(SyncEvent::Chat {
                user_id: chat.user_id,
                text: chat.text,
            }),
            Message::SessionEvent(event) => events.push(SyncEvent::SessionEvent(event)),
            Message::Error(notice) => {
                log::warn!("Server error {:?}: {}", notice.code, notice.detail);
                events.push(SyncEvent::Error(notice));
            }
            Message::Ping => replies.push(Message::Pong),
            Message::Pong => {}
            Message::Join(_) => log::warn!("Unexpected Join from server"),
        }
        events
    }

    fn send_next_chunk(&mut self, replies: &mut Vec<Message>, events: &mut Vec<SyncEvent>) {
        if self.in_flight {
            return;
        }
        let Some(upload) = self.upload.as_mut() else {
            return;
        };
        if let Some(chunk) = upload.next_chunk() {
            replies.push(Message::Raster(chunk));
            self.in_flight = true;
        }
        if upload.is_complete() {
            self.upload = None;
            self.in_flight = false;
            events.push(SyncEvent::SnapshotSent);
        }
    }

    /// A local gesture started; snapshot streaming pauses until it ends.
    pub fn begin_gesture(&mut self) {
        self.gesture = true;
    }

    /// A local gesture ended; resume any pending snapshot stream.
    pub fn end_gesture(&mut self, replies: &mut Vec<Message>) -> Vec<SyncEvent> {
        self.gesture = false;
        let mut events = Vec::new();
        self.send_next_chunk(replies, &mut events);
        events
    }

    /// Connection lost: drop any partial transfer state.
    pub fn reset(&mut self) {
        self.join.abort();
        self.upload = None;
        self.in_flight = false;
    }
}

/// The sync client.
pub struct SyncClient<C: Canvas> {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    session: Arc<Mutex<ClientSession<C>>>,
    outgoing_tx: Option<mpsc::UnboundedSender<WsMessage>>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
}

impl<C: Canvas> SyncClient<C> {
    pub fn new(server_url: impl Into<String>, canvas: C) -> Self {
        Self::with_session(server_url, ClientSession::new(canvas))
    }

    pub fn with_session(server_url: impl Into<String>, session: ClientSession<C>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            session: Arc::new(Mutex::new(session)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn session_id(&self) -> Option<Uuid> {
        self.session.lock().await.session_id()
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.session.lock().await.user_id()
    }

    pub async fn phase(&self) -> SyncPhase {
        self.session.lock().await.phase()
    }

    /// Inspect the local canvas.
    pub async fn with_canvas<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        f(self.session.lock().await.canvas())
    }

    /// Connect and send `request`. Spawns the reader and writer tasks.
    pub async fn connect(&mut self, request: JoinRequest) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;
        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let join = Message::Join(request).encode()?;
        let _ = out_tx.send(WsMessage::Binary(join.into()));

        let session = self.session.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let reply_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(Ok(frame)) = ws_reader.next().await {
                let data = match frame {
                    WsMessage::Binary(data) => data,
                    WsMessage::Close(_) => break,
                    _ => continue,
                };
                let msg = match Message::decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Failed to decode server message: {e}");
                        continue;
                    }
                };
                let mut replies = Vec::new();
                let events = session.lock().await.handle(msg, &mut replies);
                for reply in replies {
                    match reply.encode() {
                        Ok(bytes) => {
                            let _ = reply_tx.send(WsMessage::Binary(bytes.into()));
                        }
                        Err(e) => log::error!("Unable to encode reply: {e}"),
                    }
                }
                for event in events {
                    let _ = event_tx.send(event);
                }
            }
            session.lock().await.reset();
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected);
        });

        self.outgoing_tx = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;
        log::info!("Connected to {}", self.server_url);
        Ok(())
    }

    fn send(&self, msg: &Message) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(WsMessage::Binary(msg.encode()?.into()))
            .map_err(|_| ClientError::NotConnected)
    }

    /// Submit a drawing command. It reaches the local canvas when echoed.
    pub async fn send_operation(&self, payload: Vec<u8>) -> Result<(), ClientError> {
        let session_id = self.session_id().await.unwrap_or_else(Uuid::nil);
        self.send(&Message::Operation(Operation {
            session_id,
            user_id: 0,
            payload,
        }))
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let session_id = self.session_id().await.unwrap_or_else(Uuid::nil);
        self.send(&Message::Chat(Chat {
            session_id,
            user_id: 0,
            text: text.into(),
        }))
    }

    async fn session_event(
        &self,
        action: SessionAction,
        target: Option<UserId>,
    ) -> Result<(), ClientError> {
        let session_id = self.session_id().await.unwrap_or_else(Uuid::nil);
        self.send(&Message::SessionEvent(SessionEvent {
            session_id,
            action,
            target,
        }))
    }

    /// Lock or unlock the whole session (`None`) or one member. Owner only.
    pub async fn set_lock(&self, target: Option<UserId>, locked: bool) -> Result<(), ClientError> {
        let action = if locked {
            SessionAction::Lock
        } else {
            SessionAction::Unlock
        };
        self.session_event(action, target).await
    }

    pub async fn kick(&self, user: UserId) -> Result<(), ClientError> {
        self.session_event(SessionAction::Kick, Some(user)).await
    }

    pub async fn delegate(&self, user: UserId) -> Result<(), ClientError> {
        self.session_event(SessionAction::Delegate, Some(user)).await
    }

    pub async fn begin_gesture(&self) {
        self.session.lock().await.begin_gesture();
    }

    pub async fn end_gesture(&self) -> Result<(), ClientError> {
        let mut replies = Vec::new();
        let events = self.session.lock().await.end_gesture(&mut replies);
        for reply in &replies {
            self.send(reply)?;
        }
        for event in events {
            let _ = self.event_tx.send(event);
        }
        Ok(())
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(WsMessage::Close(None));
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Ack, RasterChunk, UserInfo, Welcome};
    use crate::sync::ReplayCanvas;

    fn welcome(session_id: Uuid, user_id: UserId) -> Message {
        Message::Welcome(Welcome {
            session_id,
            user_id,
            owner: 1,
            alias: None,
            title: String::new(),
        })
    }

    fn op(user_id: UserId, payload: &[u8]) -> Message {
        Message::Operation(Operation {
            session_id: Uuid::nil(),
            user_id,
            payload: payload.to_vec(),
        })
    }

    fn raster_ack() -> Message {
        Message::Ack(Ack {
            session_id: Uuid::nil(),
            event: MessageKind::Raster,
        })
    }

    fn chunks(replies: &[Message]) -> Vec<RasterChunk> {
        replies
            .iter()
            .filter_map(|m| match m {
                Message::Raster(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_host_goes_live_on_empty_raster() {
        let sid = Uuid::new_v4();
        let mut client = ClientSession::new(ReplayCanvas::new());
        let mut replies = Vec::new();
        client.handle(welcome(sid, 1), &mut replies);
        assert_eq!(client.user_id(), Some(1));

        let events = client.handle(Message::Raster(RasterChunk::empty(sid)), &mut replies);
        assert_eq!(events, vec![SyncEvent::Live { replayed: 0 }]);
        assert_eq!(client.phase(), SyncPhase::Live);
        assert!(matches!(replies.last(), Some(Message::Ack(a)) if a.event == MessageKind::Raster));

        let events = client.handle(op(1, b"x"), &mut replies);
        assert_eq!(events.len(), 1);
        assert_eq!(client.canvas().payloads(), vec![b"x".to_vec()]);
    }

    #[test]
    fn test_provider_streams_one_chunk_per_ack() {
        let mut provider = ClientSession::with_options(
            ReplayCanvas::new(),
            SyncBufferLimits::default(),
            4,
        );
        let mut replies = Vec::new();
        provider.handle(welcome(Uuid::nil(), 1), &mut replies);
        provider.handle(Message::Raster(RasterChunk::empty(Uuid::nil())), &mut replies);
        provider.handle(op(1, b"abcdef"), &mut replies);
        provider.handle(op(1, b"ghijkl"), &mut replies);
        replies.clear();

        let events = provider.handle(Message::Synchronize { session_id: Uuid::nil() }, &mut replies);
        assert!(events.contains(&SyncEvent::SnapshotRequested));
        assert!(matches!(&replies[0], Message::Ack(a) if a.event == MessageKind::Synchronize));
        assert_eq!(chunks(&replies).len(), 1);

        let mut sent = chunks(&replies);
        let mut done = false;
        for _ in 0..100 {
            replies.clear();
            let events = provider.handle(raster_ack(), &mut replies);
            sent.extend(chunks(&replies));
            if events.contains(&SyncEvent::SnapshotSent) {
                done = true;
                break;
            }
        }
        assert!(done);
        assert!(!provider.is_uploading());
        let total: usize = sent.iter().map(|c| c.data.len()).sum();
        assert_eq!(total, sent[0].size as usize);
        assert!(sent.iter().all(|c| c.data.len() <= 4));
    }

    #[test]
    fn test_gesture_defers_streaming_and_freezes_snapshot() {
        let mut provider = ClientSession::with_options(
            ReplayCanvas::new(),
            SyncBufferLimits::default(),
            1024,
        );
        let mut replies = Vec::new();
        provider.handle(Message::Raster(RasterChunk::empty(Uuid::nil())), &mut replies);
        provider.handle(op(1, b"before"), &mut replies);
        replies.clear();

        provider.begin_gesture();
        provider.handle(Message::Synchronize { session_id: Uuid::nil() }, &mut replies);
        assert!(chunks(&replies).is_empty());
        assert_eq!(replies.len(), 1);

        // An op committed after the cut must not leak into the snapshot.
        provider.handle(op(1, b"after"), &mut replies);
        let events = provider.end_gesture(&mut replies);
        assert!(events.contains(&SyncEvent::SnapshotSent));

        let sent = chunks(&replies);
        assert_eq!(sent.len(), 1);
        let mut joined = ReplayCanvas::new();
        joined.restore(&sent[0].data).unwrap();
        assert_eq!(joined.payloads(), vec![b"before".to_vec()]);
    }

    #[test]
    fn test_joiner_acks_and_replays() {
        let sid = Uuid::new_v4();
        let mut source = ReplayCanvas::new();
        source.apply(1, b"a");
        source.apply(1, b"b");
        let mut upload = SnapshotUpload::with_chunk_size(sid, source.snapshot(), 3);

        let mut joiner = ClientSession::new(ReplayCanvas::new());
        let mut replies = Vec::new();
        joiner.handle(welcome(sid, 2), &mut replies);
        let events = joiner.handle(Message::SyncWait { session_id: sid }, &mut replies);
        assert_eq!(events, vec![SyncEvent::SyncStarted]);
        assert!(matches!(&replies[0], Message::Ack(a) if a.event == MessageKind::SyncWait));

        let mut live = false;
        while let Some(chunk) = upload.next_chunk() {
            replies.clear();
            let events = joiner.handle(Message::Raster(chunk), &mut replies);
            assert!(matches!(&replies[0], Message::Ack(a) if a.event == MessageKind::Raster));
            live = events.iter().any(|e| matches!(e, SyncEvent::Live { .. }));
        }
        assert!(live);
        joiner.handle(op(1, b"c"), &mut replies);
        assert_eq!(
            joiner.canvas().payloads(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[test]
    fn test_bad_chunk_reports_error() {
        let mut joiner = ClientSession::new(ReplayCanvas::new());
        let mut replies = Vec::new();
        let events = joiner.handle(
            Message::Raster(RasterChunk {
                session_id: Uuid::nil(),
                offset: 10,
                length: 1,
                size: 20,
                data: vec![0],
            }),
            &mut replies,
        );
        assert!(matches!(&events[0], SyncEvent::Error(n) if n.code == ErrorCode::BadRaster));
        assert!(replies.is_empty());
    }

    #[test]
    fn test_user_info_events_and_ping() {
        let mut client = ClientSession::new(ReplayCanvas::new());
        let mut replies = Vec::new();
        let events = client.handle(
            Message::UserInfo(UserInfo {
                session_id: Uuid::nil(),
                user_id: 3,
                event: UserEvent::TimedOut,
                name: "c".into(),
                locked: false,
            }),
            &mut replies,
        );
        assert!(matches!(&events[0], SyncEvent::UserLeft { event: UserEvent::TimedOut, .. }));
        client.handle(Message::Ping, &mut replies);
        assert_eq!(replies, vec![Message::Pong]);
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let mut client = SyncClient::new("ws://127.0.0.1:1", ReplayCanvas::new());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
        assert!(matches!(
            client.send_operation(vec![1]).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_resets_state() {
        let mut client = SyncClient::new("ws://127.0.0.1:1", ReplayCanvas::new());
        assert!(client.connect(JoinRequest::host("x", "y")).await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }
}
