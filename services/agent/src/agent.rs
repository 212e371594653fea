//! Agent orchestrator: wires the links, the settings provider and the status
//! server together and owns their lifecycle.
//!
//! Startup order:
//! 1. Realtime link (independent of everything else)
//! 2. One settings resolve, then the cloud link on the resolved endpoint
//! 3. Settings re-check loop
//! 4. Status HTTP server, when enabled
//!
//! [`Agent::shutdown`] signals every task, then waits for each to finish
//! closing its session.

use crate::cloud::{self, CloudDeps, CloudHandle, CloudLinkConfig};
use crate::config::AgentConfig;
use crate::local_api::LocalApiClient;
use crate::realtime::{self, RealtimeHandle, RealtimeLinkConfig};
use crate::registry::SubscriptionRegistry;
use crate::session::{ConnectGuard, shutdown_requested};
use crate::settings::{EndpointConfig, FileSettingsStore, SettingsProvider, SettingsStore};
use crate::status_http::{StatusHttpError, StatusServer, StatusState};
use crate::transport::WsConnector;
use bridge_protocol::Connector;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How long [`Agent::shutdown`] waits for each task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    StatusHttp(#[from] StatusHttpError),
}

/// A running agent.
pub struct Agent {
    registry: SubscriptionRegistry,
    endpoint: watch::Receiver<EndpointConfig>,
    cloud: CloudHandle,
    realtime: RealtimeHandle,
    status_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Agent {
    /// Start on WebSocket transports and the settings file named in `cfg`.
    pub async fn start(cfg: &AgentConfig) -> Result<Agent, AgentError> {
        Agent::start_with(
            cfg,
            WsConnector::new(cfg.cloud.connect_timeout()),
            WsConnector::new(cfg.realtime.connect_timeout()),
            FileSettingsStore::new(&cfg.settings.path),
        )
        .await
    }

    pub async fn start_with<CC, RC, S>(
        cfg: &AgentConfig,
        cloud_connector: CC,
        realtime_connector: RC,
        store: S,
    ) -> Result<Agent, AgentError>
    where
        CC: Connector,
        RC: Connector,
        S: SettingsStore,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = SubscriptionRegistry::new();
        let mut tasks = Vec::new();

        let (realtime, realtime_task) = realtime::spawn(
            realtime_connector,
            RealtimeLinkConfig {
                url: cfg.realtime.url.clone(),
                policy: cfg.realtime.retry_policy(),
            },
            registry.clone(),
            shutdown_rx.clone(),
        );
        tasks.push(("realtime", realtime_task));

        let provider = Arc::new(SettingsProvider::new(store, cfg.cloud.fallback_endpoint()));
        let endpoint = provider.resolve().await;
        info!(
            host = %endpoint.host,
            http_port = endpoint.http_port,
            ws_port = endpoint.ws_port,
            "cloud bridge endpoint resolved"
        );

        let guard = ConnectGuard::new();
        let local_api = LocalApiClient::new(
            cfg.local_api.base_url.clone(),
            Duration::from_millis(cfg.local_api.timeout_ms),
        );
        let (cloud, cloud_task) = cloud::spawn(
            cloud_connector,
            CloudLinkConfig {
                ws_path: cfg.cloud.ws_path.clone(),
                use_tls: cfg.cloud.use_tls,
                heartbeat: cfg.cloud.heartbeat_interval(),
                backoff: cfg.cloud.backoff(),
                clear_subscriptions_on_disconnect: cfg.cloud.clear_subscriptions_on_disconnect,
                identify: cloud::local_identify(cfg.agent_name.clone()),
            },
            provider.subscribe(),
            CloudDeps {
                registry: registry.clone(),
                realtime: realtime.clone(),
                local_api,
                guard: guard.clone(),
            },
            shutdown_rx.clone(),
        );
        tasks.push(("cloud", cloud_task));

        tasks.push((
            "settings",
            tokio::spawn(run_settings_recheck(
                Arc::clone(&provider),
                guard,
                Duration::from_secs(cfg.settings.poll_secs),
                shutdown_rx.clone(),
            )),
        ));

        let mut agent = Agent {
            registry,
            endpoint: provider.subscribe(),
            cloud,
            realtime,
            status_addr: None,
            shutdown_tx,
            tasks,
        };

        if cfg.status_http.enabled {
            let state = StatusState {
                endpoint: agent.endpoint.clone(),
                cloud: agent.cloud.status_changes(),
                local: agent.realtime.status_changes(),
                registry: agent.registry.clone(),
                use_tls: cfg.cloud.use_tls,
                http: reqwest::Client::new(),
            };
            match StatusServer::start(&cfg.status_http.bind, state, shutdown_rx).await {
                Ok(server) => {
                    info!(addr = %server.local_addr(), "status HTTP server listening");
                    agent.status_addr = Some(server.local_addr());
                    agent.tasks.push(("status_http", server.into_task()));
                }
                Err(e) => {
                    agent.shutdown().await;
                    return Err(e.into());
                }
            }
        }

        Ok(agent)
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn endpoint(&self) -> EndpointConfig {
        self.endpoint.borrow().clone()
    }

    pub fn cloud(&self) -> &CloudHandle {
        &self.cloud
    }

    pub fn realtime(&self) -> &RealtimeHandle {
        &self.realtime
    }

    pub fn status_addr(&self) -> Option<SocketAddr> {
        self.status_addr
    }

    /// Stop every task and wait for sessions to close. Close-time errors
    /// are logged, never returned.
    pub async fn shutdown(self) {
        info!("agent shutting down");
        self.shutdown_tx.send(true).ok();
        for (name, task) in self.tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(())) => debug!(task = name, "task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "task failed during shutdown"),
                Err(_) => warn!(task = name, "task did not stop in time"),
            }
        }
        info!("agent shutdown complete");
    }
}

// ---------------------------------------------------------------------------
// Settings re-check
// ---------------------------------------------------------------------------

/// Re-resolve settings every `every`. A tick that lands while the cloud link
/// is mid-connect is skipped; the guard is held for the whole resolve
/// otherwise.
pub(crate) async fn run_settings_recheck<S: SettingsStore>(
    provider: Arc<SettingsProvider<S>>,
    guard: ConnectGuard,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(_token) = guard.try_begin() else {
                    debug!("cloud reconnect in progress; skipping settings re-check");
                    continue;
                };
                provider.resolve().await;
            }
            _ = shutdown_requested(&mut shutdown_rx) => {
                info!("settings re-check stopping (shutdown)");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{CloudSettings, SettingsError};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingStore {
        loads: AtomicUsize,
        next: Mutex<Option<CloudSettings>>,
    }

    impl SettingsStore for Arc<CountingStore> {
        async fn load(&self) -> Result<Option<CloudSettings>, SettingsError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self.next.lock().unwrap().clone())
        }
    }

    fn fallback() -> EndpointConfig {
        EndpointConfig {
            host: "localhost".to_owned(),
            http_port: 4000,
            ws_port: 4001,
        }
    }

    /// Test: ticks are skipped while the guard is held.
    #[tokio::test(start_paused = true)]
    async fn recheck_skips_while_connecting() {
        let store = Arc::new(CountingStore::default());
        let provider = Arc::new(SettingsProvider::new(store.clone(), fallback()));
        let guard = ConnectGuard::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_settings_recheck(
            provider,
            guard.clone(),
            Duration::from_secs(60),
            shutdown_rx,
        ));

        let held = guard.try_begin().unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.loads.load(Ordering::SeqCst), 0);

        drop(held);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    /// Test: a re-check that finds new settings publishes the new endpoint.
    #[tokio::test(start_paused = true)]
    async fn recheck_publishes_changed_endpoint() {
        let store = Arc::new(CountingStore::default());
        let provider = Arc::new(SettingsProvider::new(store.clone(), fallback()));
        let mut rx = provider.subscribe();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_settings_recheck(
            Arc::clone(&provider),
            ConnectGuard::new(),
            Duration::from_secs(60),
            shutdown_rx,
        ));

        *store.next.lock().unwrap() = Some(CloudSettings {
            server_ip: Some("10.0.0.9".to_owned()),
            http_port: Some(4100),
            ws_port: None,
        });
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().host, "10.0.0.9");
        assert_eq!(rx.borrow().http_port, 4100);
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    }
}
