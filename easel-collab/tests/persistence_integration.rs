//! Persistence integration tests.
//!
//! Verifies:
//! - Bans and runtime settings survive a server restart
//! - Settings saved through the admin plane override the config file
//! - Recordings replay in commit order and detect corruption

use easel_collab::admin::{ApiMethod, ApiStatus};
use easel_collab::config::ServerConfig;
use easel_collab::server::SyncServer;
use easel_collab::storage::{RecordingError, RecordingReader, RecordingSink};
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn config_with_storage(dir: &std::path::Path) -> ServerConfig {
    let mut config = ServerConfig::for_testing();
    config.storage_path = Some(dir.join("store"));
    config
}

// ─── Server state ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_bans_and_settings_survive_restart() {
    let dir = tempdir().unwrap();
    {
        let server = SyncServer::new(config_with_storage(dir.path())).unwrap();
        let admin = server.admin();
        let ban = admin
            .call(
                ApiMethod::Create,
                "banlist",
                &json!({"ip": "192.0.2.0", "subnet": 24, "expiration": "2099-12-31 23:59:59"}),
            )
            .await;
        assert_eq!(ban.status, ApiStatus::Ok);
        let update = admin
            .call(
                ApiMethod::Update,
                "server",
                &json!({"serverTitle": "Persisted", "sessionCountLimit": 3}),
            )
            .await;
        assert_eq!(update.status, ApiStatus::Ok);
    }

    let mut config = config_with_storage(dir.path());
    config.settings.server_title = "From config".into();
    let server = SyncServer::new(config).unwrap();
    let registry = server.registry();
    assert!(registry.bans().is_banned("192.0.2.77".parse().unwrap()).await);
    assert!(!registry.bans().is_banned("192.0.3.1".parse().unwrap()).await);

    let settings = registry.settings().get().await;
    assert_eq!(settings.server_title, "Persisted");
    assert_eq!(settings.session_count_limit, 3);
}

#[tokio::test]
async fn test_deleted_ban_stays_deleted() {
    let dir = tempdir().unwrap();
    {
        let server = SyncServer::new(config_with_storage(dir.path())).unwrap();
        let admin = server.admin();
        admin
            .call(
                ApiMethod::Create,
                "banlist",
                &json!({"ip": "198.51.100.1", "subnet": 0, "expiration": "2099-01-01 00:00:00"}),
            )
            .await;
        let del = admin.call(ApiMethod::Delete, "banlist/1", &json!(null)).await;
        assert_eq!(del.status, ApiStatus::Ok);
    }
    let server = SyncServer::new(config_with_storage(dir.path())).unwrap();
    assert!(server.registry().bans().list().await.is_empty());

    let created = server
        .admin()
        .call(
            ApiMethod::Create,
            "banlist",
            &json!({"ip": "198.51.100.2", "subnet": 0, "expiration": "2099-01-01 00:00:00"}),
        )
        .await;
    assert_eq!(created.status, ApiStatus::Ok);
    assert_eq!(created.body["id"], 2);
}

// ─── Recordings ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_recording_replays_in_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.easelrec");
    let sink = RecordingSink::create(&path).unwrap();
    for seq in 0..200u64 {
        sink.record(seq, Arc::new(vec![seq as u8; 32])).unwrap();
    }
    sink.flush().await.unwrap();

    let entries = RecordingReader::open(&path).unwrap().read_all().unwrap();
    assert_eq!(entries.len(), 200);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.sequence, i as u64);
        assert_eq!(entry.payload, vec![i as u8; 32]);
    }
}

#[tokio::test]
async fn test_recording_detects_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.easelrec");
    let sink = RecordingSink::create(&path).unwrap();
    sink.record(0, Arc::new(b"first".to_vec())).unwrap();
    sink.flush().await.unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();

    let result = RecordingReader::open(&path).unwrap().read_all();
    assert!(matches!(
        result,
        Err(RecordingError::ChecksumMismatch { .. }) | Err(RecordingError::Corrupt(_))
    ));
}

#[tokio::test]
async fn test_recording_refuses_to_overwrite() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("taken.easelrec");
    std::fs::write(&path, b"existing").unwrap();
    assert!(matches!(
        RecordingSink::create(&path),
        Err(RecordingError::Io(_))
    ));
    assert_eq!(std::fs::read(&path).unwrap(), b"existing");
}
