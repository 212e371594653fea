//! Local status HTTP server.
//!
//! Provides:
//! - `GET /healthz`           : always 200 OK (process is running)
//! - `GET /readyz`            : 200 when the cloud session is connected, 503 otherwise
//! - `GET /api/v1/status`     : endpoint, both session states, watched register count
//! - `GET /api/v1/cloud/test` : probe the current cloud bridge endpoint
//!
//! # Security
//! No authentication. Binds to loopback by default; everything is read-only.

use crate::probe::{self, ProbeResult};
use crate::registry::SubscriptionRegistry;
use crate::session::{SessionState, SessionStatus, shutdown_requested};
use crate::settings::EndpointConfig;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Read-only views the status routes report from.
#[derive(Clone)]
pub struct StatusState {
    pub endpoint: watch::Receiver<EndpointConfig>,
    pub cloud: watch::Receiver<SessionStatus>,
    pub local: watch::Receiver<SessionStatus>,
    pub registry: SubscriptionRegistry,
    pub use_tls: bool,
    pub http: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub version: &'static str,
    pub endpoint: EndpointConfig,
    pub cloud: SessionStatus,
    pub local: SessionStatus,
    pub watched_registers: usize,
}

impl StatusState {
    pub fn snapshot(&self) -> AgentStatus {
        AgentStatus {
            version: env!("CARGO_PKG_VERSION"),
            endpoint: self.endpoint.borrow().clone(),
            cloud: self.cloud.borrow().clone(),
            local: self.local.borrow().clone(),
            watched_registers: self.registry.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: StatusState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/v1/status", get(status))
        .route("/api/v1/cloud/test", get(cloud_test))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn readyz(State(state): State<StatusState>) -> impl IntoResponse {
    let cloud = state.cloud.borrow().state;
    if cloud == SessionState::Connected {
        (StatusCode::OK, "ok".to_owned())
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("cloud {}", cloud.as_str()),
        )
    }
}

async fn status(State(state): State<StatusState>) -> Json<AgentStatus> {
    Json(state.snapshot())
}

async fn cloud_test(State(state): State<StatusState>) -> Json<ProbeResult> {
    let endpoint = state.endpoint.borrow().clone();
    Json(probe::test_connection(&state.http, &endpoint, state.use_tls).await)
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StatusHttpError {
    #[error("binding status HTTP server to '{bind}': {source}")]
    Bind {
        bind: String,
        source: std::io::Error,
    },
}

/// Handle to the running status HTTP server.
pub struct StatusServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl StatusServer {
    /// Bind and serve until shutdown is signalled.
    pub async fn start(
        bind: &str,
        state: StatusState,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, StatusHttpError> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| StatusHttpError::Bind {
                bind: bind.to_owned(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StatusHttpError::Bind {
                bind: bind.to_owned(),
                source,
            })?;

        let router = build_router(state);
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown_rx).await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "status HTTP server stopped with error");
            }
        });

        Ok(StatusServer { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn into_task(self) -> JoinHandle<()> {
        self.task
    }
}
