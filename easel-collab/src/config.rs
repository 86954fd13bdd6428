//! Startup configuration (TOML) and runtime settings (JSON, admin-editable).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::storage::{ServerStore, StoreError};
use crate::sync::SyncBufferLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings update must be a JSON object")]
    NotAnObject,

    #[error("invalid setting value: {0}")]
    InvalidValue(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Settings changeable at runtime through the admin plane.
///
/// Durations are in seconds; 0 disables the limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Disconnect a client silent for this long
    pub client_timeout: u64,
    /// Maximum members per session
    pub session_size_limit: u32,
    /// Maximum number of concurrent sessions
    pub session_count_limit: u32,
    /// Allow sessions to outlive their last member
    pub persistence: bool,
    /// Close sessions with no activity for this long
    pub idle_time_limit: u64,
    pub server_title: String,
    pub welcome_message: String,
    /// Listing servers this server may announce to
    pub announce_whitelist: Vec<String>,
    /// Address advertised in announcements
    pub local_address: String,
    /// Hide member lists from the sessions API
    pub private_user_list: bool,
    pub allow_guests: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_timeout: 60,
            session_size_limit: 25,
            session_count_limit: 25,
            persistence: false,
            idle_time_limit: 0,
            server_title: String::new(),
            welcome_message: String::new(),
            announce_whitelist: Vec::new(),
            local_address: String::new(),
            private_user_list: false,
            allow_guests: true,
        }
    }
}

impl Settings {
    /// Keys accepted by [`Settings::apply_patch`].
    pub const KEYS: [&'static str; 11] = [
        "clientTimeout",
        "sessionSizeLimit",
        "sessionCountLimit",
        "persistence",
        "idleTimeLimit",
        "serverTitle",
        "welcomeMessage",
        "announceWhitelist",
        "localAddress",
        "privateUserList",
        "allowGuests",
    ];

    pub fn client_timeout(&self) -> Option<Duration> {
        (self.client_timeout > 0).then(|| Duration::from_secs(self.client_timeout))
    }

    pub fn idle_time_limit(&self) -> Option<Duration> {
        (self.idle_time_limit > 0).then(|| Duration::from_secs(self.idle_time_limit))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Settings with the known keys of `patch` applied. Unknown keys are
    /// ignored; a single invalid value rejects the whole patch.
    pub fn patched(&self, patch: &serde_json::Value) -> Result<(Self, Vec<String>), SettingsError> {
        let patch = patch.as_object().ok_or(SettingsError::NotAnObject)?;
        let mut merged = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => return Err(SettingsError::InvalidValue("settings are not an object".into())),
        };

        let mut changed = Vec::new();
        for key in Self::KEYS {
            if let Some(value) = patch.get(key) {
                if merged.get(key) != Some(value) {
                    changed.push(key.to_string());
                }
                merged.insert(key.to_string(), value.clone());
            }
        }

        let updated: Self = serde_json::from_value(serde_json::Value::Object(merged))
            .map_err(|e| SettingsError::InvalidValue(e.to_string()))?;
        Ok((updated, changed))
    }
}

/// Process-wide startup configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Client listener address
    pub bind_addr: String,
    /// Admin listener address (disabled if unset)
    pub admin_bind_addr: Option<String>,
    /// RocksDB directory for settings and bans (in-memory if unset)
    pub storage_path: Option<PathBuf>,
    /// Recording file pattern (no recordings if unset)
    pub recording_path: Option<String>,
    /// Stop once the last session has ended
    pub auto_stop: bool,
    pub sync_buffer: SyncBufferLimits,
    /// Server-initiated ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Idle-session sweep interval in seconds
    pub reap_interval_secs: u64,
    /// Initial runtime settings; persisted settings take precedence
    pub settings: Settings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:27750".to_string(),
            admin_bind_addr: None,
            storage_path: None,
            recording_path: None,
            auto_stop: false,
            sync_buffer: SyncBufferLimits::default(),
            heartbeat_interval_secs: 15,
            reap_interval_secs: 30,
            settings: Settings::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Config for testing: ephemeral port, fast timers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            heartbeat_interval_secs: 1,
            reap_interval_secs: 1,
            ..Self::default()
        }
    }
}

/// Shared, optionally persisted runtime settings.
pub struct SettingsHandle {
    current: RwLock<Settings>,
    store: Option<Arc<ServerStore>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            current: RwLock::new(settings),
            store: None,
        }
    }

    /// Use the persisted settings if there are any, else `initial`.
    pub fn with_store(initial: Settings, store: Arc<ServerStore>) -> Result<Self, SettingsError> {
        let settings = match store.load_settings()? {
            Some(saved) => {
                log::info!("Using persisted server settings");
                saved
            }
            None => initial,
        };
        Ok(Self {
            current: RwLock::new(settings),
            store: Some(store),
        })
    }

    pub async fn get(&self) -> Settings {
        self.current.read().await.clone()
    }

    /// Apply a JSON patch; persisted before it takes effect.
    pub async fn update(&self, patch: &serde_json::Value) -> Result<Settings, SettingsError> {
        let mut current = self.current.write().await;
        let (updated, changed) = current.patched(patch)?;
        if changed.is_empty() {
            return Ok(updated);
        }
        if let Some(store) = &self.store {
            store.save_settings(&updated)?;
        }
        log::info!("Server settings changed: {}", changed.join(", "));
        *current = updated.clone();
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use serde_json::json;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:27750");
        assert!(config.admin_bind_addr.is_none());
        assert!(config.storage_path.is_none());
        assert!(!config.auto_stop);
    }

    #[test]
    fn test_toml_partial_config() {
        let config: ServerConfig = toml::from_str(
            r#"
            bind_addr = "0.0.0.0:9000"
            auto_stop = true

            [sync_buffer]
            max_entries = 50

            [settings]
            serverTitle = "Studio"
            sessionCountLimit = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert!(config.auto_stop);
        assert_eq!(config.sync_buffer.max_entries, 50);
        assert_eq!(
            config.sync_buffer.max_bytes,
            SyncBufferLimits::default().max_bytes
        );
        assert_eq!(config.settings.server_title, "Studio");
        assert_eq!(config.settings.session_count_limit, 2);
        assert_eq!(config.settings.client_timeout, 60);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ServerConfig::load("/nonexistent/easel.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "bind_addr = [").unwrap();
        assert!(matches!(
            ServerConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_settings_json_keys() {
        let json = Settings::default().to_json();
        let obj = json.as_object().unwrap();
        for key in Settings::KEYS {
            assert!(obj.contains_key(key), "missing {key}");
        }
        assert_eq!(obj.len(), Settings::KEYS.len());
    }

    #[test]
    fn test_patch_changes_only_present_keys() {
        let settings = Settings::default();
        let (updated, changed) = settings
            .patched(&json!({"serverTitle": "Hi", "bogus": 1}))
            .unwrap();
        assert_eq!(updated.server_title, "Hi");
        assert_eq!(changed, vec!["serverTitle".to_string()]);
        assert_eq!(
            Settings {
                server_title: settings.server_title.clone(),
                ..updated
            },
            settings
        );
    }

    #[test]
    fn test_patch_is_all_or_nothing() {
        let settings = Settings::default();
        let err = settings
            .patched(&json!({"serverTitle": "Hi", "clientTimeout": "soon"}))
            .unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue(_)));
        assert!(matches!(
            settings.patched(&json!([1, 2])),
            Err(SettingsError::NotAnObject)
        ));
    }

    #[test]
    fn test_durations() {
        let mut s = Settings::default();
        assert_eq!(s.client_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(s.idle_time_limit(), None);
        s.client_timeout = 0;
        assert_eq!(s.client_timeout(), None);
    }

    #[tokio::test]
    async fn test_handle_persists_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ServerStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        let handle = SettingsHandle::with_store(Settings::default(), store.clone()).unwrap();
        handle
            .update(&json!({"welcomeMessage": "hello", "persistence": true}))
            .await
            .unwrap();
        drop(handle);

        let reopened = SettingsHandle::with_store(Settings::default(), store).unwrap();
        let settings = reopened.get().await;
        assert_eq!(settings.welcome_message, "hello");
        assert!(settings.persistence);
    }

    #[tokio::test]
    async fn test_handle_rejects_without_side_effects() {
        let handle = SettingsHandle::new(Settings::default());
        assert!(handle
            .update(&json!({"sessionSizeLimit": -1, "serverTitle": "x"}))
            .await
            .is_err());
        assert_eq!(handle.get().await, Settings::default());
    }
}
