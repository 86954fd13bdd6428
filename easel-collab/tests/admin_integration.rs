//! Admin control plane over its WebSocket listener.

use easel_collab::admin::serve_admin;
use easel_collab::client::{SyncClient, SyncEvent};
use easel_collab::config::ServerConfig;
use easel_collab::protocol::{ErrorCode, JoinRequest};
use easel_collab::server::SyncServer;
use easel_collab::sync::ReplayCanvas;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;

type AdminSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start() -> (Arc<SyncServer>, String, String) {
    let server = Arc::new(SyncServer::new(ServerConfig::for_testing()).unwrap());
    let listener = server.bind().await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let admin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_url = format!("ws://{}", admin_listener.local_addr().unwrap());

    tokio::spawn(serve_admin(admin_listener, server.admin()));
    let srv = server.clone();
    tokio::spawn(async move { srv.serve(listener).await });
    (server, url, admin_url)
}

async fn request(ws: &mut AdminSocket, method: &str, path: &str, body: Value) -> Value {
    let req = json!({"method": method, "path": path, "body": body});
    ws.send(WsMessage::text(req.to_string())).await.unwrap();
    let reply = timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match reply {
        WsMessage::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn test_admin_session_listing_and_termination() {
    let (_server, url, admin_url) = start().await;

    let mut client = SyncClient::new(&url, ReplayCanvas::new());
    let mut events = client.take_event_rx().unwrap();
    client.connect(JoinRequest::host("gallery", "alice")).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if matches!(event, SyncEvent::Live { .. }) {
                break;
            }
        }
    })
    .await
    .unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(admin_url.as_str()).await.unwrap();

    let list = request(&mut ws, "get", "sessions", Value::Null).await;
    assert_eq!(list["status"], "ok");
    assert_eq!(list["body"][0]["alias"], "gallery");
    assert_eq!(list["body"][0]["userCount"], 1);

    let detail = request(&mut ws, "get", "sessions/gallery", Value::Null).await;
    assert_eq!(detail["body"]["users"][0]["name"], "alice");

    let bad = request(&mut ws, "create", "sessions", json!({})).await;
    assert_eq!(bad["status"], "badMethod");

    let end = request(&mut ws, "delete", "sessions/gallery", Value::Null).await;
    assert_eq!(end["status"], "ok");

    let code = timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if let SyncEvent::Error(notice) = event {
                return notice.code;
            }
        }
        panic!("no error notice");
    })
    .await
    .unwrap();
    assert_eq!(code, ErrorCode::Terminating);

    let after = request(&mut ws, "get", "sessions", Value::Null).await;
    assert_eq!(after["body"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_admin_rejects_garbage() {
    let (_server, _url, admin_url) = start().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(admin_url.as_str()).await.unwrap();

    ws.send(WsMessage::text("not json")).await.unwrap();
    let reply = timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let value: Value = match reply {
        WsMessage::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("unexpected frame {other:?}"),
    };
    assert_eq!(value["status"], "badRequest");

    let missing = request(&mut ws, "get", "widgets", Value::Null).await;
    assert_eq!(missing["status"], "notFound");

    let ban = request(
        &mut ws,
        "create",
        "banlist",
        json!({"ip": "203.0.113.5", "subnet": 32, "expiration": "soonish"}),
    )
    .await;
    assert_eq!(ban["status"], "badRequest");
    let list = request(&mut ws, "get", "banlist", Value::Null).await;
    assert_eq!(list["body"].as_array().unwrap().len(), 0);
}
