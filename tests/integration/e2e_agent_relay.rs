//! End-to-end relay over real WebSockets.
//!
//! A mock cloud bridge and a mock local realtime service (both
//! `MockWsServer`), an axum stand-in for the local HTTP API, and the agent
//! started exactly as the binary starts it:
//! - api requests are answered on their ack callback or as `api-response`
//! - watched register values flow local -> cloud; unwatched ones do not
//! - a local service restart re-subscribes without the cloud asking again
//! - a cloud bridge restart is followed by a fresh `identify`

use axum::Router;
use axum::http::header;
use axum::routing::get;
use bridge_agent::agent::Agent;
use bridge_agent::config::AgentConfig;
use bridge_protocol::{BridgeMessage, Frame, RegisterWatchDescriptor, events};
use bridge_test_utils::{MockPeer, MockWsServer};
use serde_json::json;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

struct Rig {
    agent: Agent,
    cloud: MockWsServer,
    local: MockWsServer,
    _settings_dir: tempfile::TempDir,
}

async fn start_local_api() -> String {
    let router = Router::new()
        .route("/status", get(|| async { axum::Json(json!({"ok": true})) }))
        .route(
            "/page",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<p>hi</p>") }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("local api error");
    });
    format!("http://{}", addr)
}

async fn start_rig() -> Rig {
    let cloud = MockWsServer::start().await.unwrap();
    let local = MockWsServer::start().await.unwrap();
    let settings_dir = tempfile::tempdir().unwrap();

    let mut cfg = AgentConfig::defaults();
    cfg.cloud.fallback_host = "127.0.0.1".to_owned();
    cfg.cloud.fallback_http_port = cloud.local_addr().port();
    cfg.cloud.connect_timeout_ms = 2000;
    cfg.local_api.base_url = start_local_api().await;
    cfg.realtime.url = local.url("/ws/realtime");
    cfg.realtime.connect_timeout_ms = 2000;
    cfg.settings.path = settings_dir.path().join("cloud_settings.json");
    cfg.status_http.enabled = false;

    let agent = Agent::start(&cfg).await.unwrap();
    Rig {
        agent,
        cloud,
        local,
        _settings_dir: settings_dir,
    }
}

async fn accept(server: &mut MockWsServer) -> MockPeer {
    tokio::time::timeout(Duration::from_secs(10), server.accept())
        .await
        .expect("timed out waiting for agent to connect")
        .expect("server stopped")
}

async fn expect_event(peer: &mut MockPeer, event: &str) -> Frame {
    tokio::time::timeout(Duration::from_secs(10), peer.recv_event(event))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", event))
        .unwrap_or_else(|| panic!("connection closed waiting for {}", event))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn api_requests_are_relayed_to_local_api() {
    let mut rig = start_rig().await;
    let mut cloud = accept(&mut rig.cloud).await;
    let identify = expect_event(&mut cloud, events::IDENTIFY).await;
    assert_eq!(identify.data["version"], env!("CARGO_PKG_VERSION"));
    assert!(identify.data["platform"].is_string());

    cloud
        .send_frame(
            &Frame::new(
                events::API_REQUEST,
                json!({"requestId": "r1", "method": "GET", "path": "/status"}),
            )
            .with_ack(1),
        )
        .await
        .unwrap();
    let reply = expect_event(&mut cloud, events::ACK).await;
    assert_eq!(reply.ack, Some(1));
    assert_eq!(reply.data, json!({"status": 200, "data": {"ok": true}}));

    cloud
        .send_frame(&Frame::new(
            events::API_REQUEST,
            json!({"requestId": "r2", "method": "GET", "path": "/page"}),
        ))
        .await
        .unwrap();
    let reply = expect_event(&mut cloud, events::API_RESPONSE).await;
    assert_eq!(
        reply.data,
        json!({
            "requestId": "r2",
            "status": 200,
            "data": {"content": "<p>hi</p>", "contentType": "text/html", "isNonJsonResponse": true}
        })
    );

    rig.agent.shutdown().await;
}

#[tokio::test]
async fn garbage_from_cloud_does_not_end_session() {
    let mut rig = start_rig().await;
    let mut cloud = accept(&mut rig.cloud).await;
    expect_event(&mut cloud, events::IDENTIFY).await;

    cloud.send_text("this is not json").await.unwrap();
    cloud.send_text(r#"{"event":"api-request","data":42}"#).await.unwrap();
    cloud
        .send_frame(&Frame::new(
            events::API_REQUEST,
            json!({"requestId": 9, "method": "GET", "path": "/status"}),
        ))
        .await
        .unwrap();

    let reply = expect_event(&mut cloud, events::API_RESPONSE).await;
    assert_eq!(reply.data["requestId"], 9);
    assert_eq!(reply.data["status"], 200);

    rig.agent.shutdown().await;
}

/// Watched values flow upstream, and a restarted local service gets the
/// watch list replayed.
#[tokio::test]
async fn register_values_relay_and_survive_local_restart() {
    let mut rig = start_rig().await;
    let mut cloud = accept(&mut rig.cloud).await;
    expect_event(&mut cloud, events::IDENTIFY).await;
    let mut local = accept(&mut rig.local).await;

    cloud
        .send_message(BridgeMessage::WatchRegister(RegisterWatchDescriptor::new("A1", 10)))
        .await
        .unwrap();
    let sub = expect_event(&mut local, events::WATCH_REGISTER).await;
    assert_eq!(sub.data, json!({"analyzerId": "A1", "address": 10}));

    local
        .send_frame(&Frame::new(
            events::REGISTER_VALUE,
            json!({"analyzerId": "A1", "address": 11, "value": 7}),
        ))
        .await
        .unwrap();
    local
        .send_frame(&Frame::new(
            events::REGISTER_VALUE,
            json!({"analyzerId": "A1", "address": 10, "value": 42}),
        ))
        .await
        .unwrap();
    let fwd = expect_event(&mut cloud, events::FORWARD_REGISTER_VALUE).await;
    assert_eq!(fwd.data, json!({"analyzerId": "A1", "address": 10, "value": 42}));

    // Local realtime service restarts.
    local.close().await;
    let mut local = accept(&mut rig.local).await;
    let replay = expect_event(&mut local, events::WATCH_REGISTER).await;
    assert_eq!(replay.data["analyzerId"], "A1");
    assert_eq!(replay.data["address"], 10);
    assert_eq!(rig.agent.registry().len(), 1);

    rig.agent.shutdown().await;
}

#[tokio::test]
async fn cloud_restart_reconnects_and_identifies_again() {
    let mut rig = start_rig().await;
    let mut cloud = accept(&mut rig.cloud).await;
    expect_event(&mut cloud, events::IDENTIFY).await;

    cloud.close().await;
    let mut cloud = accept(&mut rig.cloud).await;
    expect_event(&mut cloud, events::IDENTIFY).await;

    let mut status = rig.agent.cloud().status_changes();
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.is_connected()))
        .await
        .unwrap()
        .unwrap();

    rig.agent.shutdown().await;
    assert!(cloud.recv_frame().await.is_none());
}
