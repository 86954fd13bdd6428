//! Administrative control plane.
//!
//! A request is a verb, a slash-delimited path and a JSON body:
//!
//! | Path                    | Get | Create | Update | Delete |
//! |-------------------------|-----|--------|--------|--------|
//! | `server`                |  ✓  |        |   ✓    |        |
//! | `sessions`              |  ✓  |        |        |        |
//! | `sessions/<id>`         |  ✓  |        |   ✓    |   ✓    |
//! | `sessions/<id>/<user>`  |     |        |   ✓    |   ✓    |
//! | `banlist`               |  ✓  |   ✓    |        |        |
//! | `banlist/<id>`          |     |        |        |   ✓    |
//!
//! Requests are validated completely before anything changes.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::ban::{parse_expiration, BanError};
use crate::config::SettingsError;
use crate::protocol::{ErrorCode, UserId};
use crate::registry::SessionRegistry;
use crate::session::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiMethod {
    Get,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApiStatus {
    Ok,
    BadRequest,
    NotFound,
    BadMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: ApiStatus,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status: ApiStatus::Ok,
            body,
        }
    }

    pub fn bad_request(message: impl std::fmt::Display) -> Self {
        Self::with_message(ApiStatus::BadRequest, message)
    }

    pub fn not_found() -> Self {
        Self::with_message(ApiStatus::NotFound, "not found")
    }

    pub fn bad_method() -> Self {
        Self::with_message(ApiStatus::BadMethod, "unsupported method")
    }

    fn with_message(status: ApiStatus, message: impl std::fmt::Display) -> Self {
        Self {
            status,
            body: json!({ "message": message.to_string() }),
        }
    }
}

/// A request as carried over the admin WebSocket.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiRequest {
    pub method: ApiMethod,
    pub path: String,
    #[serde(default)]
    pub body: Value,
}

impl From<SettingsError> for ApiResponse {
    fn from(e: SettingsError) -> Self {
        match e {
            SettingsError::Store(e) => {
                log::error!("Unable to persist settings: {e}");
                Self::with_message(ApiStatus::BadRequest, "settings could not be saved")
            }
            other => Self::bad_request(other),
        }
    }
}

impl From<BanError> for ApiResponse {
    fn from(e: BanError) -> Self {
        if let BanError::Store(e) = &e {
            log::error!("Unable to persist ban list: {e}");
        }
        Self::bad_request(e)
    }
}

impl From<SessionError> for ApiResponse {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NoSuchMember(_) => Self::not_found(),
            other => Self::bad_request(other),
        }
    }
}

/// Entry point for administrative requests.
#[derive(Clone)]
pub struct AdminApi {
    registry: Arc<SessionRegistry>,
}

impl AdminApi {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub async fn call(&self, method: ApiMethod, path: &str, body: &Value) -> ApiResponse {
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        log::debug!("Admin {method:?} {path}");
        match parts.as_slice() {
            ["server"] => self.server(method, body).await,
            ["sessions"] => match method {
                ApiMethod::Get => self.list_sessions().await,
                _ => ApiResponse::bad_method(),
            },
            ["sessions", id] => self.session(method, id, body).await,
            ["sessions", id, user] => self.session_user(method, id, user, body).await,
            ["banlist"] => self.banlist(method, body).await,
            ["banlist", id] => self.ban(method, id).await,
            _ => ApiResponse::not_found(),
        }
    }

    // ─── server ───────────────────────────────────────────────────────

    async fn server(&self, method: ApiMethod, body: &Value) -> ApiResponse {
        let settings = self.registry.settings();
        match method {
            ApiMethod::Get => ApiResponse::ok(settings.get().await.to_json()),
            ApiMethod::Update => match settings.update(body).await {
                Ok(updated) => ApiResponse::ok(updated.to_json()),
                Err(e) => e.into(),
            },
            _ => ApiResponse::bad_method(),
        }
    }

    // ─── sessions ─────────────────────────────────────────────────────

    async fn include_members(&self) -> bool {
        !self.registry.settings().get().await.private_user_list
    }

    async fn list_sessions(&self) -> ApiResponse {
        let sessions = self.registry.list(false).await;
        ApiResponse::ok(serde_json::to_value(sessions).unwrap_or(Value::Null))
    }

    async fn session(&self, method: ApiMethod, key: &str, body: &Value) -> ApiResponse {
        let Some(id) = self.registry.resolve(key).await else {
            return ApiResponse::not_found();
        };
        match method {
            ApiMethod::Get => {
                let include = self.include_members().await;
                match self.registry.with_session(id, |s| s.info(include)).await {
                    Some(info) => ApiResponse::ok(serde_json::to_value(info).unwrap_or(Value::Null)),
                    None => ApiResponse::not_found(),
                }
            }
            ApiMethod::Update => self.update_session(id, body).await,
            ApiMethod::Delete => {
                if self
                    .registry
                    .terminate(id, ErrorCode::Terminating, "session terminated by administrator")
                    .await
                {
                    ApiResponse::ok(json!({ "terminated": id }))
                } else {
                    ApiResponse::not_found()
                }
            }
            ApiMethod::Create => ApiResponse::bad_method(),
        }
    }

    async fn update_session(&self, id: Uuid, body: &Value) -> ApiResponse {
        let Some(patch) = body.as_object() else {
            return ApiResponse::bad_request("expected a JSON object");
        };
        let settings = self.registry.settings().get().await;

        let title = match patch.get("title") {
            None => None,
            Some(Value::String(t)) => Some(t.clone()),
            Some(_) => return ApiResponse::bad_request("title must be a string"),
        };
        let max_users = match patch.get("maxUsers") {
            None => None,
            Some(v) => match v.as_u64() {
                Some(n) if n >= 1 && n <= u64::from(settings.session_size_limit) => Some(n as usize),
                _ => {
                    return ApiResponse::bad_request(format!(
                        "maxUsers must be between 1 and {}",
                        settings.session_size_limit
                    ))
                }
            },
        };
        let locked = match patch.get("locked") {
            None => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(_) => return ApiResponse::bad_request("locked must be a boolean"),
        };
        let persistent = match patch.get("persistent") {
            None => None,
            Some(Value::Bool(true)) if !settings.persistence => {
                return ApiResponse::bad_request("persistence is not enabled on this server")
            }
            Some(Value::Bool(b)) => Some(*b),
            Some(_) => return ApiResponse::bad_request("persistent must be a boolean"),
        };
        let password = match patch.get("password") {
            None => None,
            Some(Value::String(p)) => Some(p.clone()),
            Some(_) => return ApiResponse::bad_request("password must be a string"),
        };

        let include = !settings.private_user_list;
        let result = self
            .registry
            .with_session(id, |session| -> Result<_, SessionError> {
                if let Some(title) = title {
                    session.set_title(title);
                }
                if let Some(max) = max_users {
                    session.set_max_members(max);
                }
                if let Some(persistent) = persistent {
                    session.set_persistent(persistent);
                }
                if let Some(password) = &password {
                    session.set_password(password);
                }
                if let Some(locked) = locked {
                    if locked != session.is_locked() {
                        session.set_lock(None, locked)?;
                    }
                }
                Ok(session.info(include))
            })
            .await;
        match result {
            Some(Ok(info)) => {
                log::info!("Session {id} updated by administrator");
                ApiResponse::ok(serde_json::to_value(info).unwrap_or(Value::Null))
            }
            Some(Err(e)) => e.into(),
            None => ApiResponse::not_found(),
        }
    }

    async fn session_user(
        &self,
        method: ApiMethod,
        key: &str,
        user: &str,
        body: &Value,
    ) -> ApiResponse {
        let Some(id) = self.registry.resolve(key).await else {
            return ApiResponse::not_found();
        };
        let Ok(user) = user.parse::<UserId>() else {
            return ApiResponse::not_found();
        };
        let result = match method {
            ApiMethod::Update => {
                let Some(locked) = body.get("locked").and_then(Value::as_bool) else {
                    return ApiResponse::bad_request("expected {\"locked\": bool}");
                };
                self.registry
                    .with_session(id, |session| session.set_lock(Some(user), locked))
                    .await
            }
            ApiMethod::Delete => {
                self.registry
                    .with_session(id, |session| session.kick(user))
                    .await
            }
            _ => return ApiResponse::bad_method(),
        };
        match result {
            Some(Ok(())) => ApiResponse::ok(json!({ "session": id, "user": user })),
            Some(Err(e)) => e.into(),
            None => ApiResponse::not_found(),
        }
    }

    // ─── banlist ──────────────────────────────────────────────────────

    async fn banlist(&self, method: ApiMethod, body: &Value) -> ApiResponse {
        let bans = self.registry.bans();
        match method {
            ApiMethod::Get => {
                ApiResponse::ok(serde_json::to_value(bans.list().await).unwrap_or(Value::Null))
            }
            ApiMethod::Create => {
                let address = match body.get("ip").and_then(Value::as_str) {
                    Some(raw) => match raw.trim().parse::<IpAddr>() {
                        Ok(addr) => addr,
                        Err(_) => return BanError::InvalidAddress(raw.to_string()).into(),
                    },
                    None => return ApiResponse::bad_request("ip is required"),
                };
                let subnet = match body.get("subnet") {
                    None => return ApiResponse::bad_request("subnet is required"),
                    Some(v) => match v.as_u64().and_then(|n| u8::try_from(n).ok()) {
                        Some(n) => n,
                        None => return ApiResponse::bad_request("subnet must be a prefix length"),
                    },
                };
                let expires = match body.get("expiration").and_then(Value::as_str) {
                    Some(raw) => match parse_expiration(raw) {
                        Ok(t) => t,
                        Err(e) => return e.into(),
                    },
                    None => return ApiResponse::bad_request("expiration is required"),
                };
                let comment = body
                    .get("comment")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match bans.add(address, subnet, expires, comment).await {
                    Ok(entry) => ApiResponse::ok(serde_json::to_value(entry).unwrap_or(Value::Null)),
                    Err(e) => e.into(),
                }
            }
            _ => ApiResponse::bad_method(),
        }
    }

    async fn ban(&self, method: ApiMethod, id: &str) -> ApiResponse {
        if method != ApiMethod::Delete {
            return ApiResponse::bad_method();
        }
        let Ok(id) = id.parse::<u64>() else {
            return ApiResponse::not_found();
        };
        match self.registry.bans().remove(id).await {
            Ok(true) => ApiResponse::ok(json!({ "deleted": id })),
            Ok(false) => ApiResponse::not_found(),
            Err(e) => e.into(),
        }
    }
}

/// Serve the control plane over WebSocket text frames until the listener fails.
pub async fn serve_admin(listener: TcpListener, api: AdminApi) -> std::io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        log::debug!("Admin connection from {addr}");
        let api = api.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_admin_connection(stream, api).await {
                log::warn!("Admin connection from {addr} failed: {e}");
            }
        });
    }
}

async fn handle_admin_connection(
    stream: TcpStream,
    api: AdminApi,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    while let Some(msg) = ws_receiver.next().await {
        let response = match msg? {
            WsMessage::Text(text) => match serde_json::from_str::<ApiRequest>(text.as_str()) {
                Ok(request) => api.call(request.method, &request.path, &request.body).await,
                Err(e) => ApiResponse::bad_request(format!("invalid request: {e}")),
            },
            WsMessage::Ping(data) => {
                ws_sender.send(WsMessage::Pong(data)).await?;
                continue;
            }
            WsMessage::Close(_) => break,
            _ => ApiResponse::bad_request("expected a JSON text frame"),
        };
        let reply = serde_json::to_string(&response).unwrap_or_default();
        ws_sender.send(WsMessage::text(reply)).await?;
    }
    Ok(())
}
