//! WebSocket server: one task per connection, all routing through the registry.
//!
//! ```text
//! Client A ──┐                      ┌── Session (alias "studio")
//!             ├── SessionRegistry ──┤       │ CommittedLog
//! Client B ──┘        │             │       ├── Member A ── send queue ── socket
//!                     │             │       └── Member B ── send queue ── socket
//!                     │             └── Session ...
//!                     ├── BanRegistry ─────┐
//!                     └── SettingsHandle ──┴── ServerStore (RocksDB)
//! ```
//!
//! A connection's first message must be `Join`. After admission every frame
//! is handed to the session; whatever the session wants delivered arrives
//! through the connection's send queue, in commit order.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use crate::admin::{serve_admin, AdminApi};
use crate::ban::{BanError, BanRegistry};
use crate::broadcast::{ConnectionLink, Outbound};
use crate::config::{ServerConfig, SettingsError, SettingsHandle};
use crate::protocol::{ErrorCode, Message, MessageKind};
use crate::registry::{Admission, ServerState, SessionRegistry};
use crate::session::{LeaveReason, SessionError};
use crate::storage::{ServerStore, StoreConfig, StoreError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unable to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to open server store: {0}")]
    Store(#[from] StoreError),

    #[error("unable to load ban list: {0}")]
    Bans(#[from] BanError),

    #[error("unable to load settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("listener failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The canvas synchronization server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
}

impl SyncServer {
    /// Open storage (if configured) and load bans and settings.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(ServerStore::open(StoreConfig::new(path))?)),
            None => None,
        };
        let (bans, settings) = match &store {
            Some(store) => (
                BanRegistry::with_store(store.clone())?,
                SettingsHandle::with_store(config.settings.clone(), store.clone())?,
            ),
            None => (
                BanRegistry::new(),
                SettingsHandle::new(config.settings.clone()),
            ),
        };
        let registry = Arc::new(SessionRegistry::new(
            &config,
            Arc::new(bans),
            Arc::new(settings),
        ));
        Ok(Self { config, registry })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn admin(&self) -> AdminApi {
        AdminApi::new(self.registry.clone())
    }

    /// Bind the client listener.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        bind(&self.config.bind_addr).await
    }

    /// Bind the admin listener, if one is configured.
    pub async fn bind_admin(&self) -> Result<Option<TcpListener>, ServerError> {
        match &self.config.admin_bind_addr {
            Some(addr) => Ok(Some(bind(addr).await?)),
            None => Ok(None),
        }
    }

    /// Accept connections until the server has stopped.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        let reaper = tokio::spawn(reap_idle_sessions(
            self.registry.clone(),
            Duration::from_secs(self.config.reap_interval_secs.max(1)),
        ));
        let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));

        let result = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => break Err(ServerError::Io(e)),
                    };
                    log::debug!("New TCP connection from {addr}");
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, registry, heartbeat).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = self.registry.wait_stopped() => break Ok(()),
            }
        };
        reaper.abort();
        result
    }

    /// Bind both listeners and serve until stopped.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        if let Some(admin) = self.bind_admin().await? {
            log::info!("Admin interface listening on {}", admin.local_addr()?);
            let api = self.admin();
            tokio::spawn(async move {
                if let Err(e) = serve_admin(admin, api).await {
                    log::error!("Admin listener failed: {e}");
                }
            });
        }
        self.serve(listener).await
    }

    /// Begin a graceful stop; see [`SessionRegistry::stop`].
    pub async fn stop(&self) {
        self.registry.stop().await;
    }
}

async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })
}

async fn reap_idle_sessions(registry: Arc<SessionRegistry>, every: Duration) {
    let mut ticker = interval_at(Instant::now() + every, every);
    let mut state = registry.subscribe_state();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reaped = registry.reap_idle().await;
                if reaped > 0 {
                    log::info!("Closed {reaped} idle sessions");
                }
            }
            _ = async { let _ = state.wait_for(|s| *s != ServerState::Running).await; } => {
                log::debug!("Idle session reaper stopped");
                return;
            }
        }
    }
}

fn queue(tx: &mpsc::UnboundedSender<Outbound>, msg: &Message) {
    match msg.encode() {
        Ok(bytes) => {
            let _ = tx.send(Outbound::Frame(Arc::new(bytes)));
        }
        Err(e) => log::error!("Unable to encode {:?}: {e}", msg.kind()),
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    heartbeat: Duration,
) -> Result<(), WsError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::debug!("WebSocket connection established from {addr}");

    if let Some(ban) = registry.bans().find(addr.ip()).await {
        log::info!("Refused banned address {addr} (ban {})", ban.id);
        let notice = Message::error(ErrorCode::Banned, "you are banned from this server");
        if let Ok(bytes) = notice.encode() {
            ws_sender.send(WsMessage::Binary(bytes.into())).await?;
        }
        ws_sender.close().await?;
        return Ok(());
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let link = ConnectionLink::new(&tx);
    let mut joined: Option<Admission> = None;
    let mut last_seen = Instant::now();
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);

    // `None`: the session already removed this member.
    let reason = loop {
        tokio::select! {
            incoming = ws_receiver.next() => {
                let data = match incoming {
                    Some(Ok(WsMessage::Binary(data))) => data,
                    Some(Ok(WsMessage::Close(_))) => break Some(LeaveReason::Quit),
                    None => break Some(LeaveReason::Disconnected),
                    Some(Err(e)) => {
                        log::debug!("WebSocket error from {addr}: {e}");
                        break Some(LeaveReason::BrokenPipe);
                    }
                    Some(Ok(_)) => {
                        last_seen = Instant::now();
                        continue;
                    }
                };
                last_seen = Instant::now();

                let msg = match Message::decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Malformed message from {addr}: {e}");
                        queue(&tx, &Message::error(ErrorCode::Malformed, e.to_string()));
                        if joined.is_none() {
                            let _ = tx.send(Outbound::Close);
                        }
                        continue;
                    }
                };
                log::trace!("{:?} from {addr}", msg.kind());

                match (joined, msg) {
                    (_, Message::Ping) => queue(&tx, &Message::Pong),
                    (_, Message::Pong) => {}
                    (None, Message::Join(request)) => {
                        match registry.admit(addr.ip(), &request, link.clone()).await {
                            Ok(admission) => joined = Some(admission),
                            Err(e) => {
                                log::info!("Rejected {} from {addr}: {e}", request.name);
                                queue(&tx, &e.to_message());
                                let _ = tx.send(Outbound::Close);
                            }
                        }
                    }
                    (None, other) => {
                        log::warn!("{:?} from {addr} before joining", other.kind());
                        queue(&tx, &SessionError::UnexpectedMessage(other.kind()).to_message());
                        let _ = tx.send(Outbound::Close);
                    }
                    (Some(_), Message::Join(_)) => {
                        queue(&tx, &SessionError::UnexpectedMessage(MessageKind::Join).to_message());
                    }
                    (Some(admission), msg) => {
                        let kind = msg.kind();
                        match registry.submit(admission.session_id, admission.user_id, msg).await {
                            Ok(()) => {}
                            Err(SessionError::NoSuchMember(_)) | Err(SessionError::Terminating) => break None,
                            Err(e) => {
                                log::warn!(
                                    "User {} in session {}: rejected {kind:?}: {e}",
                                    admission.user_id,
                                    admission.session_id
                                );
                                queue(&tx, &e.to_message());
                            }
                        }
                    }
                }
            }

            Some(outbound) = rx.recv() => match outbound {
                Outbound::Frame(frame) => {
                    if let Err(e) = ws_sender.send(WsMessage::Binary(frame.to_vec().into())).await {
                        log::debug!("Write to {addr} failed: {e}");
                        break Some(LeaveReason::BrokenPipe);
                    }
                }
                Outbound::Close => break None,
            },

            _ = ticker.tick() => {
                let timeout = registry.settings().get().await.client_timeout();
                if timeout.is_some_and(|limit| last_seen.elapsed() > limit) {
                    log::info!("Connection from {addr} timed out");
                    break Some(LeaveReason::TimedOut);
                }
                queue(&tx, &Message::Ping);
            }
        }
    };

    if let Some(admission) = joined {
        registry
            .leave(
                admission.session_id,
                admission.user_id,
                reason.unwrap_or(LeaveReason::Dropped),
            )
            .await;
    }
    let _ = ws_sender.close().await;
    log::debug!("Connection from {addr} closed ({reason:?})");
    Ok(())
}
