//! Degraded-mode status validation.
//!
//! The saved cloud settings point at a host that answers HTTP but does not
//! accept agent WebSocket sessions, and no local realtime service is running:
//! - the agent keeps retrying and stays up
//! - `/readyz` reports 503 and `/api/v1/status` shows both links down
//! - `/api/v1/cloud/test` still probes the bridge's `/health` route

use axum::Router;
use axum::routing::get;
use bridge_agent::agent::Agent;
use bridge_agent::config::AgentConfig;
use serde_json::{Value, json};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

async fn start_http_only_bridge() -> u16 {
    let router = Router::new().route(
        "/health",
        get(|| async { axum::Json(json!({"status": "healthy"})) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("bridge error");
    });
    port
}

async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn get_json(url: &str) -> (u16, Value) {
    let resp = reqwest::get(url).await.unwrap();
    let status = resp.status().as_u16();
    let body = resp.json().await.unwrap_or(Value::Null);
    (status, body)
}

// ---------------------------------------------------------------------------
// Test
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_surface_reports_degraded_links() {
    let bridge_port = start_http_only_bridge().await;
    let settings_dir = tempfile::tempdir().unwrap();
    let settings_path = settings_dir.path().join("cloud_settings.json");
    std::fs::write(
        &settings_path,
        json!({"serverIp": "127.0.0.1", "httpPort": bridge_port}).to_string(),
    )
    .unwrap();

    let mut cfg = AgentConfig::defaults();
    cfg.cloud.connect_timeout_ms = 2000;
    cfg.realtime.url = format!("ws://127.0.0.1:{}/ws/realtime", closed_port().await);
    cfg.realtime.connect_timeout_ms = 2000;
    cfg.settings.path = settings_path;
    cfg.status_http.bind = "127.0.0.1:0".to_owned();

    let agent = Agent::start(&cfg).await.unwrap();
    let base = format!("http://{}", agent.status_addr().expect("status server"));

    // Let both links fail at least once.
    let mut cloud = agent.cloud().status_changes();
    tokio::time::timeout(
        Duration::from_secs(10),
        cloud.wait_for(|s| s.retry_count >= 1),
    )
    .await
    .unwrap()
    .unwrap();
    let mut local = agent.realtime().status_changes();
    tokio::time::timeout(
        Duration::from_secs(10),
        local.wait_for(|s| s.retry_count >= 1),
    )
    .await
    .unwrap()
    .unwrap();

    let resp = reqwest::get(format!("{}/healthz", base)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = reqwest::get(format!("{}/readyz", base)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 503);

    let (status, body) = get_json(&format!("{}/api/v1/status", base)).await;
    assert_eq!(status, 200);
    assert_eq!(body["endpoint"]["httpPort"], bridge_port);
    assert_ne!(body["cloud"]["state"], "connected");
    assert!(body["cloud"]["lastError"].is_string());
    assert!(body["local"]["retryCount"].as_u64().unwrap() >= 1);

    let (status, body) = get_json(&format!("{}/api/v1/cloud/test", base)).await;
    assert_eq!(status, 200);
    assert_eq!(
        body,
        json!({"success": true, "message": "Successful connection to Cloud Bridge server (healthy)"})
    );

    agent.shutdown().await;
}
