//! A session: one shared canvas, its members, and its committed log.
//!
//! `Session` is a plain state machine. It never awaits; every send is a
//! non-blocking enqueue on a member's [`ConnectionLink`]. The registry keeps
//! each session behind a mutex, which makes `broadcast` atomic with respect
//! to joins and departures.
//!
//! Lifecycle: `Open ⇄ Locked → Terminating → (removed by the registry)`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::broadcast::{BroadcastSnapshot, BroadcastStats, CommittedLog, ConnectionLink, Frame};
use crate::protocol::{
    Chat, ErrorCode, Message, MessageKind, Operation, ProtocolError, RasterChunk, SessionAction,
    SessionEvent, UserEvent, UserId, UserInfo, Welcome,
};
use crate::storage::RecordingSink;
use crate::sync::{MemberSync, SyncBufferLimits, SyncError, SyncPhase};

/// Errors reported to the member that caused them.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is full")]
    Full,

    #[error("session is locked")]
    Locked,

    #[error("session is shutting down")]
    Terminating,

    #[error("no member with id {0}")]
    NoSuchMember(UserId),

    #[error("only the session owner may do that")]
    NotOwner,

    #[error("still synchronizing")]
    NotReady,

    #[error("you are locked")]
    Silenced,

    #[error("unexpected {0:?} message")]
    UnexpectedMessage(MessageKind),

    #[error("malformed session event: {0}")]
    BadEvent(&'static str),

    #[error("wrong session password")]
    BadPassword,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Full => ErrorCode::Full,
            Self::Locked | Self::Silenced => ErrorCode::Locked,
            Self::Terminating => ErrorCode::Terminating,
            Self::NoSuchMember(_) => ErrorCode::NotFound,
            Self::NotOwner => ErrorCode::NotOwner,
            Self::NotReady => ErrorCode::NotReady,
            Self::UnexpectedMessage(_) => ErrorCode::UnexpectedMessage,
            Self::BadEvent(_) | Self::Protocol(_) => ErrorCode::Malformed,
            Self::BadPassword => ErrorCode::BadPassword,
        }
    }

    /// The notice sent to the offending client.
    pub fn to_message(&self) -> Message {
        Message::error(self.code(), self.to_string())
    }
}

/// Why a member left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Quit,
    Disconnected,
    BrokenPipe,
    TimedOut,
    Dropped,
    Kicked,
}

impl From<LeaveReason> for UserEvent {
    fn from(reason: LeaveReason) -> Self {
        match reason {
            LeaveReason::Quit => UserEvent::Leave,
            LeaveReason::Disconnected => UserEvent::Disconnect,
            LeaveReason::BrokenPipe => UserEvent::BrokenPipe,
            LeaveReason::TimedOut => UserEvent::TimedOut,
            LeaveReason::Dropped => UserEvent::Dropped,
            LeaveReason::Kicked => UserEvent::Kicked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Open,
    Locked,
    Terminating,
}

/// Creation-time parameters.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub alias: Option<String>,
    pub title: String,
    pub max_members: usize,
    pub persistent: bool,
    /// A whole-session lock also refuses new members
    pub lock_blocks_joins: bool,
    pub sync_limits: SyncBufferLimits,
    pub password: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            alias: None,
            title: String::new(),
            max_members: 20,
            persistent: false,
            lock_blocks_joins: true,
            sync_limits: SyncBufferLimits::default(),
            password: None,
        }
    }
}

/// Server-wide text shown to a new member.
#[derive(Debug, Clone, Default)]
pub struct Greeting {
    /// Used as the Welcome title when the session has none
    pub server_title: String,
    /// Sent as a server chat line after Welcome
    pub message: Option<String>,
}

/// Result of a successful join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinTicket {
    pub user_id: UserId,
    /// Member asked for a snapshot, `None` if the joiner started blank
    pub provider: Option<UserId>,
}

/// A participant.
#[derive(Debug)]
pub struct Member {
    pub id: UserId,
    pub name: String,
    pub address: String,
    pub locked: bool,
    pub joined_at: DateTime<Utc>,
    link: ConnectionLink,
    /// `Some` until the member is live
    sync: Option<MemberSync>,
    /// `Synchronize` requests sent to this member as a provider
    sync_requests: u64,
    /// ... and acknowledged by it
    sync_acks: u64,
}

impl Member {
    pub fn phase(&self) -> SyncPhase {
        self.sync
            .as_ref()
            .map_or(SyncPhase::Live, |sync| sync.phase())
    }

    pub fn is_live(&self) -> bool {
        self.sync.is_none()
    }
}

/// Admin-facing view of a member.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub id: UserId,
    pub name: String,
    pub ip: String,
    pub owner: bool,
    pub locked: bool,
    pub phase: SyncPhase,
}

/// Admin-facing view of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: Uuid,
    pub alias: Option<String>,
    pub title: String,
    pub state: SessionState,
    pub owner: Option<UserId>,
    pub user_count: usize,
    pub max_users: usize,
    pub locked: bool,
    pub persistent: bool,
    pub has_password: bool,
    pub started_at: DateTime<Utc>,
    pub committed: u64,
    pub delivery: BroadcastSnapshot,
    pub recording: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<MemberInfo>>,
}

pub struct Session {
    id: Uuid,
    alias: Option<String>,
    title: String,
    owner: Option<UserId>,
    max_members: usize,
    locked: bool,
    persistent: bool,
    lock_blocks_joins: bool,
    terminating: bool,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    next_user_id: UserId,
    members: BTreeMap<UserId, Member>,
    log: CommittedLog,
    stats: BroadcastStats,
    recording: Option<RecordingSink>,
    sync_limits: SyncBufferLimits,
    password: Option<String>,
}

fn frame(msg: &Message) -> Result<Frame, SessionError> {
    Ok(Arc::new(msg.encode()?))
}

impl Session {
    pub fn new(id: Uuid, options: SessionOptions) -> Self {
        Self {
            id,
            alias: options.alias,
            title: options.title,
            owner: None,
            max_members: options.max_members.max(1),
            locked: false,
            persistent: options.persistent,
            lock_blocks_joins: options.lock_blocks_joins,
            terminating: false,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            next_user_id: 1,
            members: BTreeMap::new(),
            log: CommittedLog::new(),
            stats: BroadcastStats::default(),
            recording: None,
            sync_limits: options.sync_limits,
            password: options.password.filter(|p| !p.is_empty()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn owner(&self) -> Option<UserId> {
        self.owner
    }

    pub fn state(&self) -> SessionState {
        if self.terminating {
            SessionState::Terminating
        } else if self.locked {
            SessionState::Locked
        } else {
            SessionState::Open
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn max_members(&self) -> usize {
        self.max_members
    }

    pub fn member(&self, id: UserId) -> Option<&Member> {
        self.members.get(&id)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn recording(&self) -> Option<&RecordingSink> {
        self.recording.as_ref()
    }

    pub fn set_recording(&mut self, sink: RecordingSink) {
        self.recording = Some(sink);
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
    }

    pub fn set_max_members(&mut self, max: usize) {
        self.max_members = max.max(1);
    }

    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    /// An empty password removes it.
    pub fn set_password(&mut self, password: &str) {
        self.password = Some(password.to_string()).filter(|p| !p.is_empty());
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    pub fn check_password(&self, given: &str) -> Result<(), SessionError> {
        match &self.password {
            Some(password) if password != given => Err(SessionError::BadPassword),
            _ => Ok(()),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn send_to(&self, id: UserId, frame: Frame) -> bool {
        let ok = self
            .members
            .get(&id)
            .is_some_and(|member| member.link.send(frame));
        self.stats.record_delivery(ok);
        ok
    }

    fn send_message(&self, id: UserId, msg: &Message) -> Result<bool, SessionError> {
        Ok(self.send_to(id, frame(msg)?))
    }

    /// Admit a new member.
    pub fn join(
        &mut self,
        name: &str,
        address: &str,
        link: ConnectionLink,
        greeting: &Greeting,
    ) -> Result<JoinTicket, SessionError> {
        if self.terminating {
            return Err(SessionError::Terminating);
        }
        if self.members.len() >= self.max_members {
            return Err(SessionError::Full);
        }
        if self.locked && self.lock_blocks_joins && !self.members.is_empty() {
            return Err(SessionError::Locked);
        }

        let id = self.next_user_id;
        self.next_user_id += 1;
        if self.owner.is_none() {
            self.owner = Some(id);
        }
        let provider = self.select_provider();

        let title = if self.title.is_empty() {
            greeting.server_title.clone()
        } else {
            self.title.clone()
        };
        let welcome = frame(&Message::Welcome(Welcome {
            session_id: self.id,
            user_id: id,
            owner: self.owner.unwrap_or(id),
            alias: self.alias.clone(),
            title,
        }))?;
        link.send(welcome);

        for member in self.members.values() {
            link.send(frame(&Message::UserInfo(UserInfo {
                session_id: self.id,
                user_id: member.id,
                event: UserEvent::Join,
                name: member.name.clone(),
                locked: member.locked,
            }))?);
        }
        if self.locked {
            link.send(frame(&Message::SessionEvent(SessionEvent {
                session_id: self.id,
                action: SessionAction::Lock,
                target: None,
            }))?);
        }

        self.members.insert(
            id,
            Member {
                id,
                name: name.to_string(),
                address: address.to_string(),
                locked: false,
                joined_at: Utc::now(),
                link,
                sync: provider.map(|p| MemberSync::new(p, self.sync_limits)),
                sync_requests: 0,
                sync_acks: 0,
            },
        );

        self.broadcast(
            &Message::UserInfo(UserInfo {
                session_id: self.id,
                user_id: id,
                event: UserEvent::Join,
                name: name.to_string(),
                locked: false,
            }),
            None,
        )?;

        match provider {
            Some(provider) => {
                self.send_message(id, &Message::SyncWait { session_id: self.id })?;
                if !self.provider_busy(provider) {
                    self.start_transfer(id)?;
                }
            }
            None => {
                self.send_message(id, &Message::Raster(RasterChunk::empty(self.id)))?;
            }
        }

        if let Some(text) = greeting.message.as_deref().filter(|t| !t.is_empty()) {
            self.send_message(
                id,
                &Message::Chat(Chat {
                    session_id: self.id,
                    user_id: 0,
                    text: text.to_string(),
                }),
            )?;
        }

        log::info!(
            "User {id} ({name}) joined session {} from {address}{}",
            self.id,
            match provider {
                Some(p) => format!(", snapshot from {p}"),
                None => String::new(),
            }
        );
        self.touch();
        Ok(JoinTicket {
            user_id: id,
            provider,
        })
    }

    /// Remove a member and notify the rest. Returns `false` if no such member.
    pub fn leave(&mut self, id: UserId, reason: LeaveReason) -> Result<bool, SessionError> {
        let Some(member) = self.members.remove(&id) else {
            return Ok(false);
        };
        log::info!(
            "User {id} ({}) left session {}: {reason:?}",
            member.name,
            self.id
        );

        self.broadcast(
            &Message::UserInfo(UserInfo {
                session_id: self.id,
                user_id: id,
                event: reason.into(),
                name: member.name.clone(),
                locked: member.locked,
            }),
            None,
        )?;

        if self.owner == Some(id) {
            self.owner = self.members.keys().next().copied();
            if let Some(owner) = self.owner {
                log::info!("Session {} ownership passed to {owner}", self.id);
                self.broadcast(
                    &Message::SessionEvent(SessionEvent {
                        session_id: self.id,
                        action: SessionAction::Delegate,
                        target: Some(owner),
                    }),
                    None,
                )?;
            }
        }

        // The departed member may have been waiting on, or serving, a snapshot.
        if let Some(sync) = &member.sync {
            if sync.is_requested() {
                self.advance_provider_queue(sync.provider())?;
            }
        }
        self.reassign_orphans(id)?;

        self.touch();
        Ok(true)
    }

    /// Kick a member: notify everyone, remove, close its connection.
    pub fn kick(&mut self, id: UserId) -> Result<(), SessionError> {
        if !self.members.contains_key(&id) {
            return Err(SessionError::NoSuchMember(id));
        }
        let event = Message::SessionEvent(SessionEvent {
            session_id: self.id,
            action: SessionAction::Kick,
            target: Some(id),
        });
        self.broadcast(&event, Some(id))?;
        // Sent directly: a synchronizing member would only have it buffered.
        self.send_message(id, &event)?;
        let link = self.members.get(&id).map(|m| m.link.clone());
        self.leave(id, LeaveReason::Kicked)?;
        if let Some(link) = link {
            link.close();
        }
        Ok(())
    }

    /// Lock or unlock the whole session (`None`) or one member.
    pub fn set_lock(&mut self, target: Option<UserId>, locked: bool) -> Result<(), SessionError> {
        match target {
            None => self.locked = locked,
            Some(id) => {
                self.members
                    .get_mut(&id)
                    .ok_or(SessionError::NoSuchMember(id))?
                    .locked = locked;
            }
        }
        self.broadcast(
            &Message::SessionEvent(SessionEvent {
                session_id: self.id,
                action: if locked {
                    SessionAction::Lock
                } else {
                    SessionAction::Unlock
                },
                target,
            }),
            None,
        )?;
        Ok(())
    }

    /// Hand ownership to another member.
    pub fn delegate_owner(&mut self, id: UserId) -> Result<(), SessionError> {
        if !self.members.contains_key(&id) {
            return Err(SessionError::NoSuchMember(id));
        }
        self.owner = Some(id);
        self.broadcast(
            &Message::SessionEvent(SessionEvent {
                session_id: self.id,
                action: SessionAction::Delegate,
                target: Some(id),
            }),
            None,
        )?;
        Ok(())
    }

    /// Commit a message and deliver it to every member in commit order.
    ///
    /// Once a synchronizing member's snapshot has been cut, everything
    /// committed for it goes to its sync buffer and is replayed after the
    /// snapshot. Before the cut, operations are skipped (the snapshot will
    /// contain them) and everything else is delivered directly.
    pub fn broadcast(&mut self, msg: &Message, exclude: Option<UserId>) -> Result<u64, SessionError> {
        let frame = frame(msg)?;
        let seq = self.log.append();
        self.stats.record_commit();
        let recorded = self.recording.as_ref().map(|r| r.record(seq, frame.clone()));
        if let Some(Err(e)) = recorded {
            log::warn!("Session {} recording dropped: {e}", self.id);
            self.recording = None;
        }

        let is_operation = msg.kind() == MessageKind::Operation;
        let mut overflowed = Vec::new();
        for member in self.members.values_mut() {
            if Some(member.id) == exclude {
                continue;
            }
            match member.sync.as_mut().map(|sync| sync.buffer_frame(frame.clone())) {
                Some(Ok(true)) => self.stats.record_buffered(),
                Some(Ok(false)) if is_operation => {}
                Some(Err(e)) => overflowed.push((member.id, e)),
                _ => self.stats.record_delivery(member.link.send(frame.clone())),
            }
        }

        for (id, err) in overflowed {
            self.fail_join(id, ErrorCode::SyncBufferOverflow, &err)?;
        }
        self.touch();
        Ok(seq)
    }

    /// Dispatch an in-session message from member `from`.
    pub fn submit(&mut self, from: UserId, msg: Message) -> Result<(), SessionError> {
        let member = self.members.get(&from).ok_or(SessionError::NoSuchMember(from))?;
        match msg {
            Message::Operation(op) => {
                if !member.is_live() {
                    return Err(SessionError::NotReady);
                }
                if self.locked || member.locked {
                    return Err(SessionError::Silenced);
                }
                self.broadcast(
                    &Message::Operation(Operation {
                        session_id: self.id,
                        user_id: from,
                        payload: op.payload,
                    }),
                    None,
                )?;
            }
            Message::Chat(chat) => {
                self.broadcast(
                    &Message::Chat(Chat {
                        session_id: self.id,
                        user_id: from,
                        text: chat.text,
                    }),
                    None,
                )?;
            }
            Message::SessionEvent(event) => {
                if self.owner != Some(from) {
                    return Err(SessionError::NotOwner);
                }
                match (event.action, event.target) {
                    (SessionAction::Lock, target) => self.set_lock(target, true)?,
                    (SessionAction::Unlock, target) => self.set_lock(target, false)?,
                    (SessionAction::Kick, Some(target)) => self.kick(target)?,
                    (SessionAction::Delegate, Some(target)) => self.delegate_owner(target)?,
                    (_, None) => return Err(SessionError::BadEvent("missing target")),
                }
            }
            Message::Raster(chunk) => self.relay_raster(from, chunk)?,
            Message::Ack(ack) => match ack.event {
                MessageKind::SyncWait => self.joiner_ready(from)?,
                MessageKind::Raster => self.raster_acked(from)?,
                MessageKind::Synchronize => self.provider_ready(from)?,
                other => return Err(SessionError::UnexpectedMessage(other)),
            },
            other => return Err(SessionError::UnexpectedMessage(other.kind())),
        }
        Ok(())
    }

    /// Close the session: every member gets `reason` and is disconnected.
    pub fn terminate(&mut self, code: ErrorCode, reason: &str) -> Result<Vec<UserId>, SessionError> {
        self.terminating = true;
        let notice = frame(&Message::error(code, reason))?;
        let ids: Vec<UserId> = self.members.keys().copied().collect();
        for member in std::mem::take(&mut self.members).into_values() {
            member.link.send(notice.clone());
            member.link.close();
        }
        self.owner = None;
        log::info!(
            "Session {} terminated ({reason}), {} members disconnected",
            self.id,
            ids.len()
        );
        Ok(ids)
    }

    /// Remove every member with `reason` and close their connections.
    pub fn evict_all(&mut self, reason: LeaveReason) -> Result<usize, SessionError> {
        let ids: Vec<UserId> = self.members.keys().copied().collect();
        for id in &ids {
            let link = self.members.get(id).map(|m| m.link.clone());
            self.leave(*id, reason)?;
            if let Some(link) = link {
                link.close();
            }
        }
        Ok(ids.len())
    }

    /// Refuse further joins. Used when an empty session is being removed.
    pub fn close(&mut self) {
        self.terminating = true;
    }

    /// Snapshot source for a new member: the owner if live, else the lowest
    /// live member id.
    pub fn select_provider(&self) -> Option<UserId> {
        if let Some(owner) = self.owner.and_then(|id| self.members.get(&id)) {
            if owner.is_live() {
                return Some(owner.id);
            }
        }
        self.members.values().find(|m| m.is_live()).map(|m| m.id)
    }

    fn provider_busy(&self, provider: UserId) -> bool {
        self.members.values().any(|m| {
            m.sync
                .as_ref()
                .is_some_and(|s| s.provider() == provider && s.is_requested())
        })
    }

    /// Cut the log for `joiner` and ask its provider for a snapshot.
    fn start_transfer(&mut self, joiner: UserId) -> Result<(), SessionError> {
        let cut = self.log.next_seq();
        let Some(provider_id) = self
            .members
            .get(&joiner)
            .and_then(|m| m.sync.as_ref())
            .map(|s| s.provider())
        else {
            return Ok(());
        };
        let Some(provider) = self.members.get_mut(&provider_id) else {
            return Ok(());
        };
        provider.sync_requests += 1;
        let ticket = provider.sync_requests;
        provider
            .link
            .send(frame(&Message::Synchronize { session_id: self.id })?);
        if let Some(sync) = self.members.get_mut(&joiner).and_then(|m| m.sync.as_mut()) {
            sync.start(cut, ticket);
        }
        log::debug!(
            "Session {}: snapshot for {joiner} requested from {provider_id} at seq {cut}",
            self.id
        );
        Ok(())
    }

    /// Start the next queued joiner waiting on `provider`, if it is free.
    fn advance_provider_queue(&mut self, provider: UserId) -> Result<(), SessionError> {
        if !self.members.contains_key(&provider) || self.provider_busy(provider) {
            return Ok(());
        }
        let next = self
            .members
            .values()
            .find(|m| {
                m.sync
                    .as_ref()
                    .is_some_and(|s| s.provider() == provider && !s.is_requested())
            })
            .map(|m| m.id);
        match next {
            Some(joiner) => self.start_transfer(joiner),
            None => Ok(()),
        }
    }

    /// Point joiners whose provider left at someone else. A joiner that
    /// already has the whole snapshot relayed or held for it keeps its
    /// transfer and goes live on its final acknowledgement.
    fn reassign_orphans(&mut self, departed: UserId) -> Result<(), SessionError> {
        let orphans: Vec<UserId> = self
            .members
            .values()
            .filter(|m| {
                m.sync
                    .as_ref()
                    .is_some_and(|s| s.provider() == departed && !s.has_full_snapshot())
            })
            .map(|m| m.id)
            .collect();

        for joiner in orphans {
            match self.select_provider() {
                Some(provider) => {
                    log::info!(
                        "Session {}: snapshot source for {joiner} lost, retrying with {provider}",
                        self.id
                    );
                    let kept = self
                        .members
                        .get_mut(&joiner)
                        .and_then(|m| m.sync.as_mut())
                        .map(|sync| sync.reassign(provider))
                        .unwrap_or_default();
                    for frame in kept {
                        self.send_to(joiner, frame);
                    }
                    if !self.provider_busy(provider) {
                        self.start_transfer(joiner)?;
                    }
                }
                None => {
                    self.fail_join(joiner, ErrorCode::NoSyncSource, &SyncError::NoSyncSource)?;
                }
            }
        }
        Ok(())
    }

    /// Abort a join: notify the joiner, drop it, close its connection.
    fn fail_join(&mut self, id: UserId, code: ErrorCode, err: &SyncError) -> Result<(), SessionError> {
        log::warn!("Session {}: join of {id} failed: {err}", self.id);
        let Some(link) = self.members.get(&id).map(|m| m.link.clone()) else {
            return Ok(());
        };
        link.send(frame(&Message::error(code, err.to_string()))?);
        self.leave(id, LeaveReason::Dropped)?;
        link.close();
        Ok(())
    }

    fn active_joiner(&self, provider: UserId) -> Option<UserId> {
        self.members
            .values()
            .find(|m| {
                m.sync
                    .as_ref()
                    .is_some_and(|s| s.provider() == provider && s.is_requested())
            })
            .map(|m| m.id)
    }

    fn provider_ready(&mut self, from: UserId) -> Result<(), SessionError> {
        let member = self
            .members
            .get_mut(&from)
            .ok_or(SessionError::NoSuchMember(from))?;
        if member.sync_acks >= member.sync_requests {
            return Err(SessionError::UnexpectedMessage(MessageKind::Ack));
        }
        member.sync_acks += 1;
        Ok(())
    }

    /// Forward a snapshot chunk from a provider to the joiner it serves.
    fn relay_raster(&mut self, from: UserId, mut chunk: RasterChunk) -> Result<(), SessionError> {
        let acks = match self.members.get(&from) {
            Some(member) if member.is_live() => member.sync_acks,
            _ => return Err(SessionError::UnexpectedMessage(MessageKind::Raster)),
        };
        let Some(joiner) = self.active_joiner(from) else {
            log::debug!("Session {}: dropping stale raster from {from}", self.id);
            return Ok(());
        };

        let session_id = self.id;
        let Some(sync) = self.members.get_mut(&joiner).and_then(|m| m.sync.as_mut()) else {
            return Ok(());
        };
        if sync.ticket() != acks {
            log::debug!("Session {session_id}: raster from {from} predates current request");
            return Ok(());
        }
        if let Err(e) = sync.accept_chunk(&chunk) {
            return self.fail_join(joiner, ErrorCode::BadRaster, &e);
        }

        chunk.session_id = session_id;
        let out = frame(&Message::Raster(chunk))?;
        if let Some(out) = sync.stage_chunk(out) {
            self.send_to(joiner, out);
        }
        Ok(())
    }

    fn joiner_ready(&mut self, id: UserId) -> Result<(), SessionError> {
        let sync = self
            .members
            .get_mut(&id)
            .and_then(|m| m.sync.as_mut())
            .ok_or(SessionError::UnexpectedMessage(MessageKind::Ack))?;
        if let Some(held) = sync.joiner_ready() {
            self.send_to(id, held);
        }
        Ok(())
    }

    fn raster_acked(&mut self, id: UserId) -> Result<(), SessionError> {
        let Some(sync) = self.members.get_mut(&id).and_then(|m| m.sync.as_mut()) else {
            // Live members acknowledge the blank canvas they started with.
            return Ok(());
        };
        match sync.chunk_acked() {
            Ok(true) => self.go_live(id),
            Ok(false) => {
                let provider = sync.provider();
                self.send_message(
                    provider,
                    &Message::ack(self.id, MessageKind::Raster),
                )?;
                Ok(())
            }
            Err(_) => {
                log::debug!("Session {}: stale raster ack from {id}", self.id);
                Ok(())
            }
        }
    }

    /// Snapshot applied: deliver the buffered operations and go live.
    fn go_live(&mut self, id: UserId) -> Result<(), SessionError> {
        let Some(sync) = self.members.get_mut(&id).and_then(|m| m.sync.take()) else {
            return Ok(());
        };
        let provider = sync.provider();
        let cut = sync.cut().unwrap_or_default();
        let frames = sync.finish();
        log::info!(
            "Session {}: user {id} is live from seq {cut} ({} buffered messages replayed)",
            self.id,
            frames.len()
        );
        for frame in frames {
            self.send_to(id, frame);
        }
        self.advance_provider_queue(provider)
    }

    pub fn info(&self, include_members: bool) -> SessionInfo {
        SessionInfo {
            id: self.id,
            alias: self.alias.clone(),
            title: self.title.clone(),
            state: self.state(),
            owner: self.owner,
            user_count: self.members.len(),
            max_users: self.max_members,
            locked: self.locked,
            persistent: self.persistent,
            has_password: self.has_password(),
            started_at: self.created_at,
            committed: self.log.len(),
            delivery: self.stats.snapshot(),
            recording: self
                .recording
                .as_ref()
                .map(|r| r.path().display().to_string()),
            users: include_members.then(|| {
                self.members
                    .values()
                    .map(|m| MemberInfo {
                        id: m.id,
                        name: m.name.clone(),
                        ip: m.address.clone(),
                        owner: self.owner == Some(m.id),
                        locked: m.locked,
                        phase: m.phase(),
                    })
                    .collect()
            }),
        }
    }
}
