//! Settings provider: resolves the cloud bridge endpoint.
//!
//! The main application persists the bridge address in a small JSON document
//! (`{"serverIp", "httpPort", "wsPort"}`); the agent only reads it. The
//! current endpoint lives in a `watch` channel: the cloud link copies it at
//! connect time and reconnects when a resolve publishes a different value.
//!
//! Resolution never fails. A missing document keeps the current endpoint; an
//! unreadable or malformed one is logged and the last-known endpoint is kept.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Address of the cloud bridge server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub host: String,
    pub http_port: u16,
    pub ws_port: u16,
}

impl EndpointConfig {
    /// WebSocket URL of the bridge, served on the HTTP port.
    pub fn ws_url(&self, path: &str, tls: bool) -> String {
        let scheme = if tls { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.host, self.http_port, path)
    }

    pub fn http_base(&self, tls: bool) -> String {
        let scheme = if tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.http_port)
    }
}

// ---------------------------------------------------------------------------
// Settings document
// ---------------------------------------------------------------------------

/// The persisted cloud settings document.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudSettings {
    #[serde(alias = "serverHost")]
    pub server_ip: Option<String>,
    pub http_port: Option<u16>,
    pub ws_port: Option<u16>,
}

impl CloudSettings {
    /// The endpoint these settings describe, or `None` when no host is set.
    /// Missing ports are taken from `fallback`.
    pub fn endpoint(&self, fallback: &EndpointConfig) -> Option<EndpointConfig> {
        let host = self.server_ip.as_deref().map(str::trim)?;
        if host.is_empty() {
            return None;
        }
        Some(EndpointConfig {
            host: host.to_owned(),
            http_port: self.http_port.unwrap_or(fallback.http_port),
            ws_port: self.ws_port.unwrap_or(fallback.ws_port),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("reading settings '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing settings '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Where cloud settings are read from.
pub trait SettingsStore: Send + Sync + 'static {
    /// `Ok(None)` when no settings have been saved yet.
    fn load(&self) -> impl Future<Output = Result<Option<CloudSettings>, SettingsError>> + Send;
}

/// Settings document on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSettingsStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for FileSettingsStore {
    async fn load(&self) -> Result<Option<CloudSettings>, SettingsError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SettingsError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| SettingsError::Parse {
                path: self.path.clone(),
                source,
            })
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct SettingsProvider<S> {
    store: S,
    fallback: EndpointConfig,
    tx: watch::Sender<EndpointConfig>,
}

impl<S: SettingsStore> SettingsProvider<S> {
    /// Starts out on `fallback` until a resolve finds saved settings.
    pub fn new(store: S, fallback: EndpointConfig) -> Self {
        let (tx, _) = watch::channel(fallback.clone());
        SettingsProvider {
            store,
            fallback,
            tx,
        }
    }

    pub fn current(&self) -> EndpointConfig {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EndpointConfig> {
        self.tx.subscribe()
    }

    /// Reload settings and publish the endpoint if it changed.
    pub async fn resolve(&self) -> EndpointConfig {
        match self.store.load().await {
            Ok(Some(settings)) => match settings.endpoint(&self.fallback) {
                Some(endpoint) => self.publish(endpoint),
                None => debug!("cloud settings have no server host; keeping current endpoint"),
            },
            Ok(None) => debug!("no cloud settings found; keeping current endpoint"),
            Err(e) => warn!(error = %e, "failed to load cloud settings; keeping last-known endpoint"),
        }
        self.current()
    }

    fn publish(&self, endpoint: EndpointConfig) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == endpoint {
                return false;
            }
            *current = endpoint.clone();
            true
        });
        if changed {
            info!(
                host = %endpoint.host,
                http_port = endpoint.http_port,
                ws_port = endpoint.ws_port,
                "cloud bridge endpoint updated"
            );
        }
    }
}
