//! Session registry: admission, lookup, aggregate counts, server lifecycle.
//!
//! ```text
//!  admit(addr, JoinRequest)
//!     │ state == Running?         ── no ──► ShuttingDown
//!     │ BanRegistry::find(addr)   ── hit ─► Banned
//!     │ host? create session      ── limit/alias ─► TooManySessions / AliasTaken
//!     │ lookup id or alias        ── miss ─► NotFound
//!     ▼
//!  Session::join ──► Full / Locked / Terminating
//! ```
//!
//! Every mutation of a session goes through [`SessionRegistry::with_session`],
//! which reconciles the user count, removes sessions that have ended, and
//! drives `Running → Stopping → Stopped`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use uuid::Uuid;

use crate::ban::BanRegistry;
use crate::broadcast::ConnectionLink;
use crate::config::{ServerConfig, SettingsHandle};
use crate::protocol::{ErrorCode, JoinRequest, Message, UserId};
use crate::session::{
    Greeting, LeaveReason, Session, SessionError, SessionInfo, SessionOptions,
};
use crate::storage::{expand_pattern, RecordingSink};
use crate::sync::SyncBufferLimits;

/// Server lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Stopping,
    Stopped,
}

/// Why a connection was not admitted.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("banned")]
    Banned,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("no such session: {0}")]
    NotFound(String),

    #[error("session alias {0:?} is taken")]
    AliasTaken(String),

    #[error("session limit reached")]
    TooManySessions,

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl AdmissionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Banned => ErrorCode::Banned,
            Self::ShuttingDown => ErrorCode::ShuttingDown,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AliasTaken(_) => ErrorCode::AliasTaken,
            Self::TooManySessions => ErrorCode::TooManySessions,
            Self::Session(e) => e.code(),
        }
    }

    pub fn to_message(&self) -> Message {
        Message::error(self.code(), self.to_string())
    }
}

/// A successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub session_id: Uuid,
    pub user_id: UserId,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<Uuid, Arc<Mutex<Session>>>,
    aliases: HashMap<String, Uuid>,
}

pub struct SessionRegistry {
    tables: RwLock<Tables>,
    bans: Arc<BanRegistry>,
    settings: Arc<SettingsHandle>,
    total_users: AtomicUsize,
    state: watch::Sender<ServerState>,
    auto_stop: bool,
    recording_pattern: Option<String>,
    sync_limits: SyncBufferLimits,
}

impl SessionRegistry {
    pub fn new(config: &ServerConfig, bans: Arc<BanRegistry>, settings: Arc<SettingsHandle>) -> Self {
        let (state, _) = watch::channel(ServerState::Running);
        Self {
            tables: RwLock::new(Tables::default()),
            bans,
            settings,
            total_users: AtomicUsize::new(0),
            state,
            auto_stop: config.auto_stop,
            recording_pattern: config.recording_path.clone(),
            sync_limits: config.sync_buffer,
        }
    }

    pub fn bans(&self) -> &Arc<BanRegistry> {
        &self.bans
    }

    pub fn settings(&self) -> &Arc<SettingsHandle> {
        &self.settings
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Resolve once the server has fully stopped.
    pub async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ServerState::Stopped).await;
    }

    pub fn total_users(&self) -> usize {
        self.total_users.load(Ordering::SeqCst)
    }

    pub async fn session_count(&self) -> usize {
        self.tables.read().await.sessions.len()
    }

    /// Find a session by UUID or alias.
    pub async fn lookup(&self, key: &str) -> Option<Arc<Mutex<Session>>> {
        let tables = self.tables.read().await;
        let id = match Uuid::parse_str(key) {
            Ok(id) => id,
            Err(_) => *tables.aliases.get(key)?,
        };
        tables.sessions.get(&id).cloned()
    }

    /// Session id for a UUID or alias, if such a session exists.
    pub async fn resolve(&self, key: &str) -> Option<Uuid> {
        let tables = self.tables.read().await;
        let id = match Uuid::parse_str(key) {
            Ok(id) => id,
            Err(_) => *tables.aliases.get(key)?,
        };
        tables.sessions.contains_key(&id).then_some(id)
    }

    pub async fn session_ids(&self) -> Vec<Uuid> {
        self.tables.read().await.sessions.keys().copied().collect()
    }

    /// Admit a connection into a new or existing session.
    pub async fn admit(
        &self,
        addr: IpAddr,
        request: &JoinRequest,
        link: ConnectionLink,
    ) -> Result<Admission, AdmissionError> {
        if self.state() != ServerState::Running {
            return Err(AdmissionError::ShuttingDown);
        }
        if let Some(ban) = self.bans.find(addr).await {
            log::info!("Rejected banned address {addr} (ban {})", ban.id);
            return Err(AdmissionError::Banned);
        }

        let settings = self.settings.get().await;
        let session_id = if request.host {
            self.create_session(request, &settings).await?
        } else {
            let session = self
                .lookup(&request.session)
                .await
                .ok_or_else(|| AdmissionError::NotFound(request.session.clone()))?;
            let id = session.lock().await.id();
            id
        };

        let greeting = Greeting {
            server_title: settings.server_title.clone(),
            message: Some(settings.welcome_message.clone()).filter(|m| !m.is_empty()),
        };
        let address = addr.to_string();
        let ticket = self
            .with_session(session_id, |session| {
                session.check_password(&request.password)?;
                session.join(&request.name, &address, link, &greeting)
            })
            .await
            .ok_or_else(|| AdmissionError::NotFound(request.session.clone()))??;

        Ok(Admission {
            session_id,
            user_id: ticket.user_id,
        })
    }

    async fn create_session(
        &self,
        request: &JoinRequest,
        settings: &crate::config::Settings,
    ) -> Result<Uuid, AdmissionError> {
        let alias = Some(request.session.trim().to_string()).filter(|a| !a.is_empty());
        let limit = settings.session_size_limit.max(1) as usize;
        let max_members = match request.max_members as usize {
            0 => limit,
            requested => requested.min(limit),
        };

        self.check_creatable(&*self.tables.read().await, alias.as_deref(), settings)?;

        let id = Uuid::new_v4();
        let recording = self.open_recording(id, alias.as_deref()).await;

        let mut tables = self.tables.write().await;
        if let Err(e) = self.check_creatable(&tables, alias.as_deref(), settings) {
            drop(tables);
            if let Some(sink) = recording {
                discard_recording(sink).await;
            }
            return Err(e);
        }

        let mut session = Session::new(
            id,
            SessionOptions {
                alias: alias.clone(),
                title: String::new(),
                max_members,
                persistent: request.persistent && settings.persistence,
                lock_blocks_joins: true,
                sync_limits: self.sync_limits,
                password: Some(request.password.clone()),
            },
        );
        if let Some(sink) = recording {
            session.set_recording(sink);
        }

        if let Some(alias) = &alias {
            tables.aliases.insert(alias.clone(), id);
        }
        tables.sessions.insert(id, Arc::new(Mutex::new(session)));
        log::info!(
            "Created session {id}{}",
            alias.map(|a| format!(" ({a})")).unwrap_or_default()
        );
        Ok(id)
    }

    /// Whether a session with `alias` may be created right now. Checked
    /// again under the write lock so a racing `stop` or create wins cleanly.
    fn check_creatable(
        &self,
        tables: &Tables,
        alias: Option<&str>,
        settings: &crate::config::Settings,
    ) -> Result<(), AdmissionError> {
        if self.state() != ServerState::Running {
            return Err(AdmissionError::ShuttingDown);
        }
        if tables.sessions.len() >= settings.session_count_limit as usize {
            return Err(AdmissionError::TooManySessions);
        }
        if let Some(alias) = alias {
            if tables.aliases.contains_key(alias) || Uuid::parse_str(alias).is_ok() {
                return Err(AdmissionError::AliasTaken(alias.to_string()));
            }
        }
        Ok(())
    }

    async fn open_recording(&self, id: Uuid, alias: Option<&str>) -> Option<RecordingSink> {
        let pattern = self.recording_pattern.as_ref()?;
        let path = expand_pattern(pattern, id, alias, chrono::Local::now());
        let target = path.clone();
        match tokio::task::spawn_blocking(move || RecordingSink::create(target)).await {
            Ok(Ok(sink)) => Some(sink),
            Ok(Err(e)) => {
                log::warn!("Unable to record session {id} to {}: {e}", path.display());
                None
            }
            Err(e) => {
                log::warn!("Unable to record session {id}: {e}");
                None
            }
        }
    }

    /// Run `f` against a session, then reconcile counts and lifecycle.
    /// Returns `None` if the session does not exist.
    pub async fn with_session<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let session = self.tables.read().await.sessions.get(&id).cloned()?;
        let mut guard = session.lock().await;
        let before = guard.member_count();
        let result = f(&mut guard);
        let after = guard.member_count();

        let ended = guard.is_empty() && (guard.is_terminating() || !guard.is_persistent());
        if ended {
            guard.close();
        }
        drop(guard);

        if after > before {
            self.total_users.fetch_add(after - before, Ordering::SeqCst);
            self.log_status().await;
        } else if after < before {
            self.total_users.fetch_sub(before - after, Ordering::SeqCst);
        }
        if ended {
            self.remove_session(id).await;
        }
        if after < before || ended {
            self.log_status().await;
            self.after_departure().await;
        }
        Some(result)
    }

    async fn remove_session(&self, id: Uuid) {
        let mut tables = self.tables.write().await;
        if tables.sessions.remove(&id).is_some() {
            tables.aliases.retain(|_, session| *session != id);
            log::info!("Session {id} ended");
        }
    }

    async fn log_status(&self) {
        log::info!(
            "{} users and {} sessions",
            self.total_users(),
            self.session_count().await
        );
    }

    /// Remove a member after its connection went away.
    pub async fn leave(&self, session_id: Uuid, user_id: UserId, reason: LeaveReason) {
        let result = self
            .with_session(session_id, |session| session.leave(user_id, reason))
            .await;
        if let Some(Err(e)) = result {
            log::error!("Error removing user {user_id} from session {session_id}: {e}");
        }
    }

    /// Dispatch an in-session message.
    pub async fn submit(
        &self,
        session_id: Uuid,
        user_id: UserId,
        msg: Message,
    ) -> Result<(), SessionError> {
        self.with_session(session_id, |session| session.submit(user_id, msg))
            .await
            .unwrap_or(Err(SessionError::Terminating))
    }

    /// Terminate a session, disconnecting its members.
    pub async fn terminate(&self, session_id: Uuid, code: ErrorCode, reason: &str) -> bool {
        let result = self
            .with_session(session_id, |session| session.terminate(code, reason))
            .await;
        match result {
            Some(Ok(_)) => true,
            Some(Err(e)) => {
                log::error!("Error terminating session {session_id}: {e}");
                true
            }
            None => false,
        }
    }

    /// Close sessions idle longer than the configured limit.
    pub async fn reap_idle(&self) -> usize {
        let Some(limit) = self.settings.get().await.idle_time_limit() else {
            return 0;
        };
        let mut reaped = 0;
        for id in self.session_ids().await {
            let expired = self
                .with_session(id, |session| {
                    if session.idle_for() < limit {
                        return false;
                    }
                    log::info!("Session {id} idle for {:?}, closing", session.idle_for());
                    if let Err(e) = session.evict_all(LeaveReason::TimedOut) {
                        log::error!("Error evicting members of session {id}: {e}");
                    }
                    session.close();
                    true
                })
                .await;
            if expired == Some(true) {
                reaped += 1;
            }
        }
        reaped
    }

    /// Begin shutdown. Repeated calls are no-ops.
    pub async fn stop(&self) {
        let started = self.state.send_if_modified(|state| {
            if *state == ServerState::Running {
                *state = ServerState::Stopping;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }
        log::info!(
            "Stopping server and kicking out {} users...",
            self.total_users()
        );

        let sessions: Vec<(Uuid, Arc<Mutex<Session>>)> = {
            let mut tables = self.tables.write().await;
            tables.aliases.clear();
            tables.sessions.drain().collect()
        };
        for (id, session) in sessions {
            let mut guard = session.lock().await;
            let before = guard.member_count();
            if let Err(e) = guard.terminate(ErrorCode::ShuttingDown, "server is shutting down") {
                log::error!("Error terminating session {id}: {e}");
            }
            let removed = before - guard.member_count();
            self.total_users.fetch_sub(removed, Ordering::SeqCst);
        }
        self.check_stopped();
    }

    fn check_stopped(&self) {
        if self.total_users() != 0 {
            return;
        }
        let stopped = self.state.send_if_modified(|state| {
            if *state == ServerState::Stopping {
                *state = ServerState::Stopped;
                true
            } else {
                false
            }
        });
        if stopped {
            log::info!("Server stopped.");
        }
    }

    async fn after_departure(&self) {
        match self.state() {
            ServerState::Running => {
                if self.auto_stop && self.total_users() == 0 && self.session_count().await == 0 {
                    log::info!("Autostopping due to lack of sessions");
                    self.stop().await;
                }
            }
            ServerState::Stopping => self.check_stopped(),
            ServerState::Stopped => {}
        }
    }

    /// Admin view of every session.
    pub async fn list(&self, include_members: bool) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Mutex<Session>>> =
            self.tables.read().await.sessions.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.lock().await.info(include_members));
        }
        infos.sort_by_key(|info| info.started_at);
        infos
    }
}

/// Remove the file of a recording whose session was never created.
async fn discard_recording(sink: RecordingSink) {
    let path = sink.path().to_path_buf();
    drop(sink);
    if let Err(e) = tokio::fs::remove_file(&path).await {
        log::warn!("Unable to remove unused recording {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Outbound;
    use crate::config::Settings;
    use crate::protocol::{Ack, MessageKind, Operation};
    use chrono::{Duration, Utc};
    use tokio::sync::mpsc;

    fn registry_with(config: ServerConfig) -> SessionRegistry {
        let settings = Arc::new(SettingsHandle::new(config.settings.clone()));
        SessionRegistry::new(&config, Arc::new(BanRegistry::new()), settings)
    }

    fn registry() -> SessionRegistry {
        registry_with(ServerConfig::for_testing())
    }

    fn conn() -> (ConnectionLink, mpsc::UnboundedReceiver<Outbound>, mpsc::UnboundedSender<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionLink::new(&tx), rx, tx)
    }

    fn local() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_host_then_join_by_alias_and_id() {
        let reg = registry();
        let (link, _rx, _tx) = conn();
        let host = reg
            .admit(local(), &JoinRequest::host("studio", "alice"), link)
            .await
            .unwrap();
        assert_eq!(host.user_id, 1);
        assert_eq!(reg.session_count().await, 1);
        assert_eq!(reg.total_users(), 1);

        let (link, _rx2, _tx2) = conn();
        let by_alias = reg
            .admit(local(), &JoinRequest::join("studio", "bob"), link)
            .await
            .unwrap();
        assert_eq!(by_alias.session_id, host.session_id);

        let (link, _rx3, _tx3) = conn();
        let by_id = reg
            .admit(
                local(),
                &JoinRequest::join(host.session_id.to_string(), "carol"),
                link,
            )
            .await
            .unwrap();
        assert_eq!(by_id.user_id, 3);
        assert_eq!(reg.total_users(), 3);
    }

    #[tokio::test]
    async fn test_admission_errors() {
        let mut config = ServerConfig::for_testing();
        config.settings.session_count_limit = 1;
        let reg = registry_with(config);

        let (link, _rx, _tx) = conn();
        let err = reg
            .admit(local(), &JoinRequest::join("nowhere", "x"), link)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        let (link, _rx, _tx) = conn();
        reg.admit(local(), &JoinRequest::host("a", "x"), link).await.unwrap();

        let (link, _rx2, _tx2) = conn();
        let err = reg
            .admit(local(), &JoinRequest::host("b", "y"), link)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TooManySessions);
    }

    #[tokio::test]
    async fn test_session_password() {
        let reg = registry();
        let (link, _rx, _tx) = conn();
        reg.admit(
            local(),
            &JoinRequest::host("vault", "alice").with_password("hunter2"),
            link,
        )
        .await
        .unwrap();

        let (link, _rx2, _tx2) = conn();
        let err = reg
            .admit(local(), &JoinRequest::join("vault", "bob"), link)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadPassword);
        assert_eq!(reg.total_users(), 1);

        let (link, _rx3, _tx3) = conn();
        let bob = reg
            .admit(
                local(),
                &JoinRequest::join("vault", "bob").with_password("hunter2"),
                link,
            )
            .await
            .unwrap();
        assert_eq!(bob.user_id, 2);
    }

    #[tokio::test]
    async fn test_alias_must_be_unique() {
        let reg = registry();
        let (link, _rx, _tx) = conn();
        reg.admit(local(), &JoinRequest::host("dup", "x"), link).await.unwrap();
        let (link, _rx2, _tx2) = conn();
        let err = reg
            .admit(local(), &JoinRequest::host("dup", "y"), link)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::AliasTaken(_)));
    }

    #[tokio::test]
    async fn test_racing_creates_leave_one_session_and_one_recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::for_testing();
        config.recording_path = Some(format!("{}/", dir.path().display()));
        let reg = registry_with(config);
        let (first, _rx, _tx) = conn();
        let (second, _rx2, _tx2) = conn();
        let request = JoinRequest::host("dup", "alice");

        let (a, b) = tokio::join!(
            reg.admit(local(), &request, first),
            reg.admit(local(), &request, second),
        );
        let errors: Vec<AdmissionError> = [a, b].into_iter().filter_map(Result::err).collect();
        assert!(matches!(&errors[..], [AdmissionError::AliasTaken(_)]));
        assert_eq!(reg.session_count().await, 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_banned_address_rejected_before_session_lookup() {
        let reg = registry();
        reg.bans()
            .add(local(), 0, Utc::now().naive_utc() + Duration::hours(1), "")
            .await
            .unwrap();
        let (link, _rx, _tx) = conn();
        let err = reg
            .admit(local(), &JoinRequest::join("does-not-exist", "x"), link)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Banned);
        assert_eq!(reg.total_users(), 0);
    }

    #[tokio::test]
    async fn test_membership_limit_from_settings() {
        let mut config = ServerConfig::for_testing();
        config.settings.session_size_limit = 2;
        let reg = registry_with(config);
        let mut keep = Vec::new();
        for name in ["a", "b"] {
            let (link, rx, tx) = conn();
            let req = if name == "a" {
                JoinRequest::host("s", name)
            } else {
                JoinRequest::join("s", name)
            };
            reg.admit(local(), &req, link).await.unwrap();
            keep.push((rx, tx));
        }
        let (link, _rx, _tx) = conn();
        let err = reg
            .admit(local(), &JoinRequest::join("s", "c"), link)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Full);
        assert_eq!(reg.total_users(), 2);
    }

    #[tokio::test]
    async fn test_last_leave_ends_session() {
        let reg = registry();
        let (link, _rx, _tx) = conn();
        let adm = reg
            .admit(local(), &JoinRequest::host("gone", "x"), link)
            .await
            .unwrap();
        reg.leave(adm.session_id, adm.user_id, LeaveReason::Quit).await;
        assert_eq!(reg.session_count().await, 0);
        assert_eq!(reg.total_users(), 0);
        assert!(reg.lookup("gone").await.is_none());
        assert_eq!(reg.state(), ServerState::Running);
    }

    #[tokio::test]
    async fn test_persistent_session_survives_when_enabled() {
        let mut config = ServerConfig::for_testing();
        config.settings.persistence = true;
        let reg = registry_with(config);
        let (link, _rx, _tx) = conn();
        let mut request = JoinRequest::host("keep", "x");
        request.persistent = true;
        let adm = reg.admit(local(), &request, link).await.unwrap();
        reg.leave(adm.session_id, adm.user_id, LeaveReason::Quit).await;
        assert_eq!(reg.session_count().await, 1);
        assert_eq!(reg.total_users(), 0);

        let (link, _rx2, _tx2) = conn();
        let again = reg
            .admit(local(), &JoinRequest::join("keep", "y"), link)
            .await
            .unwrap();
        assert_eq!(again.session_id, adm.session_id);
        assert_eq!(again.user_id, 2);
    }

    #[tokio::test]
    async fn test_submit_reaches_session() {
        let reg = registry();
        let (link, mut rx, _tx) = conn();
        let adm = reg
            .admit(local(), &JoinRequest::host("s", "x"), link)
            .await
            .unwrap();
        while rx.try_recv().is_ok() {}

        reg.submit(
            adm.session_id,
            adm.user_id,
            Message::Operation(Operation {
                session_id: adm.session_id,
                user_id: 0,
                payload: vec![1],
            }),
        )
        .await
        .unwrap();
        match rx.try_recv() {
            Ok(Outbound::Frame(f)) => assert!(matches!(Message::decode(&f), Ok(Message::Operation(_)))),
            other => panic!("unexpected {other:?}"),
        }

        let err = reg
            .submit(
                adm.session_id,
                adm.user_id,
                Message::Ack(Ack {
                    session_id: adm.session_id,
                    event: MessageKind::Chat,
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnexpectedMessage);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_reaches_stopped() {
        let reg = registry();
        let (link, mut rx, _tx) = conn();
        reg.admit(local(), &JoinRequest::host("s", "x"), link).await.unwrap();
        let mut state = reg.subscribe_state();

        reg.stop().await;
        reg.stop().await;
        assert_eq!(reg.state(), ServerState::Stopped);
        assert_eq!(reg.total_users(), 0);
        assert_eq!(reg.session_count().await, 0);
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow_and_update(), ServerState::Stopped);

        let mut saw_close = false;
        while let Ok(item) = rx.try_recv() {
            saw_close |= matches!(item, Outbound::Close);
        }
        assert!(saw_close);

        let (link, _rx2, _tx2) = conn();
        let err = reg
            .admit(local(), &JoinRequest::host("t", "y"), link)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShuttingDown);
    }

    #[tokio::test]
    async fn test_auto_stop_when_vacant() {
        let mut config = ServerConfig::for_testing();
        config.auto_stop = true;
        let reg = registry_with(config);
        let (link, _rx, _tx) = conn();
        let a = reg.admit(local(), &JoinRequest::host("s", "a"), link).await.unwrap();
        let (link, _rx2, _tx2) = conn();
        let b = reg.admit(local(), &JoinRequest::join("s", "b"), link).await.unwrap();

        reg.leave(a.session_id, a.user_id, LeaveReason::Quit).await;
        assert_eq!(reg.state(), ServerState::Running);
        reg.leave(b.session_id, b.user_id, LeaveReason::Quit).await;
        assert_eq!(reg.state(), ServerState::Stopped);
        reg.wait_stopped().await;
    }

    #[tokio::test]
    async fn test_reap_idle_sessions() {
        let mut config = ServerConfig::for_testing();
        config.settings = Settings {
            idle_time_limit: 1,
            ..Settings::default()
        };
        let reg = registry_with(config);
        let (link, mut rx, _tx) = conn();
        reg.admit(local(), &JoinRequest::host("s", "a"), link).await.unwrap();

        assert_eq!(reg.reap_idle().await, 0);
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert_eq!(reg.reap_idle().await, 1);
        assert_eq!(reg.session_count().await, 0);
        assert_eq!(reg.total_users(), 0);
        let mut closed = false;
        while let Ok(item) = rx.try_recv() {
            closed |= matches!(item, Outbound::Close);
        }
        assert!(closed);
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let reg = registry();
        let (link, _rx, _tx) = conn();
        reg.admit(local(), &JoinRequest::host("one", "a"), link).await.unwrap();
        let list = reg.list(true).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].alias.as_deref(), Some("one"));
        assert_eq!(list[0].users.as_ref().unwrap()[0].name, "a");
    }
}
