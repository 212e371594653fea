//! Cloud relay link: the reconnecting session to the cloud bridge server.
//!
//! # Protocol
//! 1. Connect to `ws(s)://{host}:{httpPort}{ws_path}` for the current endpoint
//! 2. Send `identify` with version, hostname and platform
//! 3. Send `ping` every heartbeat interval
//! 4. Answer each `api-request` through the local API client, on the
//!    request's ack callback when present, else as `api-response`
//! 5. Apply `watch-register` / `unwatch-register` (and the `-mobile` aliases)
//!    to the registry and the realtime link
//! 6. Forward `register-value` events for watched registers as
//!    `forward-register-value`
//!
//! Retry never stops. Connect attempts are serialized with the settings
//! re-check through the shared [`ConnectGuard`].

use crate::local_api::LocalApiClient;
use crate::realtime::RealtimeHandle;
use crate::registry::SubscriptionRegistry;
use crate::reply::ReplyChannel;
use crate::retry::CloudBackoff;
use crate::session::{ConnectGuard, SessionStatus, StatusPublisher, shutdown_requested};
use crate::settings::EndpointConfig;
use crate::transport::{send_frame, send_message};
use bridge_protocol::{
    BridgeMessage, Connection, Connector, ForwardedResponse, Frame, Identify, RegisterValue,
    RegisterWatchDescriptor, RequestId, events,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, sleep};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CloudLinkConfig {
    /// Path of the agent WebSocket endpoint on the bridge, e.g. `/ws/agent`.
    pub ws_path: String,
    pub use_tls: bool,
    pub heartbeat: Duration,
    pub backoff: CloudBackoff,
    pub clear_subscriptions_on_disconnect: bool,
    /// Sent as-is at the start of every session.
    pub identify: Identify,
}

/// Identify payload for this process.
pub fn local_identify(agent_name: Option<String>) -> Identify {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_owned());
    Identify {
        version: env!("CARGO_PKG_VERSION").to_owned(),
        hostname,
        platform: std::env::consts::OS.to_owned(),
        agent_name,
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CloudHandle {
    status: watch::Receiver<SessionStatus>,
}

impl CloudHandle {
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn status_changes(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }
}

/// Collaborators the cloud link drives.
#[derive(Debug, Clone)]
pub struct CloudDeps {
    pub registry: SubscriptionRegistry,
    pub realtime: RealtimeHandle,
    pub local_api: LocalApiClient,
    pub guard: ConnectGuard,
}

/// Start the cloud link task.
pub fn spawn<C: Connector>(
    connector: C,
    cfg: CloudLinkConfig,
    endpoint_rx: watch::Receiver<EndpointConfig>,
    deps: CloudDeps,
    shutdown_rx: watch::Receiver<bool>,
) -> (CloudHandle, JoinHandle<()>) {
    let publisher = StatusPublisher::new();
    let handle = CloudHandle {
        status: publisher.subscribe(),
    };
    let link = CloudLink {
        connector,
        cfg,
        endpoint_rx,
        deps,
        publisher,
        shutdown_rx,
    };
    (handle, tokio::spawn(link.run()))
}

// ---------------------------------------------------------------------------
// Link task
// ---------------------------------------------------------------------------

enum SessionEnd {
    Shutdown,
    EndpointChanged,
    Dropped(String),
}

struct CloudLink<C> {
    connector: C,
    cfg: CloudLinkConfig,
    endpoint_rx: watch::Receiver<EndpointConfig>,
    deps: CloudDeps,
    publisher: StatusPublisher,
    shutdown_rx: watch::Receiver<bool>,
}

impl<C: Connector> CloudLink<C> {
    async fn run(mut self) {
        loop {
            if *self.shutdown_rx.borrow() {
                info!("cloud link stopping (shutdown)");
                return;
            }

            let (endpoint, url, attempt) = {
                let _token = tokio::select! {
                    t = self.deps.guard.begin() => t,
                    _ = shutdown_requested(&mut self.shutdown_rx) => return,
                };
                // Read under the guard so a settings re-check cannot land mid-connect.
                let endpoint = self.endpoint_rx.borrow_and_update().clone();
                let url = endpoint.ws_url(&self.cfg.ws_path, self.cfg.use_tls);
                self.publisher.connecting();
                info!(url = %url, "connecting to cloud bridge");
                let attempt = tokio::select! {
                    r = self.connector.connect(&url) => r,
                    _ = shutdown_requested(&mut self.shutdown_rx) => return,
                };
                (endpoint, url, attempt)
            };

            let delay = match attempt {
                Ok(conn) => {
                    self.publisher.connected();
                    info!(url = %url, "connected to cloud bridge");

                    let end = self.run_session(conn, &endpoint).await;
                    match end {
                        SessionEnd::Shutdown => {
                            info!("cloud link stopping (shutdown)");
                            return;
                        }
                        SessionEnd::EndpointChanged => {
                            info!("cloud bridge endpoint changed; reconnecting");
                            self.session_ended("endpoint changed");
                            Duration::ZERO
                        }
                        SessionEnd::Dropped(reason) => {
                            warn!(reason = %reason, "cloud bridge session ended");
                            self.session_ended(reason);
                            self.cfg.backoff.initial
                        }
                    }
                }
                Err(e) => {
                    let failures = self.publisher.connect_failed(e.to_string());
                    let delay = self.cfg.backoff.delay(failures);
                    warn!(
                        error = %e,
                        attempt = failures,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "cloud bridge connect failed"
                    );
                    delay
                }
            };

            if delay.is_zero() {
                continue;
            }
            tokio::select! {
                _ = sleep(delay) => {}
                Ok(()) = self.endpoint_rx.changed() => {
                    debug!("endpoint changed during backoff; retrying now");
                }
                _ = shutdown_requested(&mut self.shutdown_rx) => {
                    info!("cloud link stopping (shutdown)");
                    return;
                }
            }
        }
    }

    fn session_ended(&self, reason: impl Into<String>) {
        self.publisher.dropped(reason);
        if self.cfg.clear_subscriptions_on_disconnect {
            let cleared = self.deps.registry.clear();
            if !cleared.is_empty() {
                info!(count = cleared.len(), "cleared watched registers after cloud disconnect");
            }
            for descriptor in cleared {
                self.deps.realtime.unsubscribe(descriptor);
            }
        }
    }

    async fn run_session(&mut self, conn: Connection, endpoint: &EndpointConfig) -> SessionEnd {
        let Connection {
            mut sink,
            mut stream,
        } = conn;

        if let Err(e) =
            send_message(&mut sink, BridgeMessage::Identify(self.cfg.identify.clone())).await
        {
            return SessionEnd::Dropped(e.to_string());
        }

        // Replies from in-flight api requests. Dropping the set with the
        // session aborts whatever is still waiting on the local API.
        let (replies_tx, mut replies_rx) = mpsc::unbounded_channel::<Frame>();
        let mut in_flight = JoinSet::new();

        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + self.cfg.heartbeat, self.cfg.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Subscribed per session: values produced while disconnected are dropped.
        let mut values = self.deps.realtime.register_values();
        let mut values_open = true;

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut self.shutdown_rx) => {
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
                Ok(()) = self.endpoint_rx.changed() => {
                    if *self.endpoint_rx.borrow_and_update() != *endpoint {
                        let _ = sink.close().await;
                        return SessionEnd::EndpointChanged;
                    }
                }
                _ = heartbeat.tick() => {
                    debug!("sending heartbeat ping");
                    if let Err(e) = send_message(&mut sink, BridgeMessage::Ping).await {
                        return SessionEnd::Dropped(e.to_string());
                    }
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                Some(frame) = replies_rx.recv() => {
                    if let Err(e) = send_frame(&mut sink, frame).await {
                        return SessionEnd::Dropped(e.to_string());
                    }
                }
                value = values.recv(), if values_open => match value {
                    Ok(value) => {
                        if let Err(e) = self.forward_value(&mut sink, value).await {
                            return SessionEnd::Dropped(e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "register value stream lagged; values dropped");
                    }
                    Err(RecvError::Closed) => values_open = false,
                },
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame, &replies_tx, &mut in_flight),
                    Some(Err(e)) if e.is_frame_local() => {
                        warn!(error = %e, "dropping undecodable frame from cloud bridge");
                    }
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    None => return SessionEnd::Dropped("connection closed".to_owned()),
                },
            }
        }
    }

    async fn forward_value(
        &self,
        sink: &mut bridge_protocol::FrameSink,
        value: RegisterValue,
    ) -> Result<(), String> {
        let key = value.key();
        if !self.deps.registry.has(&key) {
            debug!(key = %key, "dropping value for unwatched register");
            return Ok(());
        }
        send_message(sink, BridgeMessage::ForwardRegisterValue(value))
            .await
            .map_err(|e| e.to_string())
    }

    fn handle_frame(
        &self,
        frame: Frame,
        replies: &mpsc::UnboundedSender<Frame>,
        in_flight: &mut JoinSet<()>,
    ) {
        let channel = ReplyChannel::from_ack(frame.ack);
        // Kept so an undecodable request can still be answered.
        let raw_request_id = (frame.event == events::API_REQUEST).then(|| {
            RequestId(frame.data.get("requestId").cloned().unwrap_or(Value::Null))
        });
        match BridgeMessage::try_from(frame) {
            Ok(BridgeMessage::ApiRequest(req)) => {
                let local_api = self.deps.local_api.clone();
                let replies = replies.clone();
                in_flight.spawn(async move {
                    let request_id = req.request_id.clone();
                    let response = local_api.forward(req).await;
                    reply(channel, response, &replies, &request_id);
                });
            }
            Ok(BridgeMessage::WatchRegister(d) | BridgeMessage::WatchRegisterMobile(d)) => {
                self.watch(d);
            }
            Ok(BridgeMessage::UnwatchRegister(d) | BridgeMessage::UnwatchRegisterMobile(d)) => {
                self.unwatch(d);
            }
            Ok(BridgeMessage::System(msg)) => {
                info!(message = %msg.message, "system message from cloud bridge");
            }
            Ok(BridgeMessage::Pong(data)) => debug!(data = %data, "pong from cloud bridge"),
            Ok(other) => debug!(event = %other.event(), "ignoring cloud bridge event"),
            Err(e) => match raw_request_id {
                Some(request_id) => {
                    warn!(request_id = %request_id, error = %e, "rejecting invalid api request");
                    let response = ForwardedResponse::agent_error(request_id.clone(), e.to_string());
                    reply(channel, response, replies, &request_id);
                }
                None => warn!(error = %e, "dropping invalid frame from cloud bridge"),
            },
        }
    }

    fn watch(&self, descriptor: RegisterWatchDescriptor) {
        let key = descriptor.key();
        let added = self.deps.registry.put(descriptor.clone());
        info!(key = %key, added, "watch register");
        self.deps.realtime.subscribe(descriptor);
    }

    fn unwatch(&self, descriptor: RegisterWatchDescriptor) {
        let key = descriptor.key();
        let removed = self.deps.registry.remove(&key).is_some();
        info!(key = %key, removed, "unwatch register");
        self.deps.realtime.unsubscribe(descriptor);
    }
}

fn reply(
    channel: ReplyChannel,
    response: ForwardedResponse,
    replies: &mpsc::UnboundedSender<Frame>,
    request_id: &RequestId,
) {
    match channel.into_frame(response) {
        Ok(frame) => {
            // The ack callback died with the session.
            if replies.send(frame).is_err() {
                debug!(request_id = %request_id, "session closed before reply");
            }
        }
        Err(e) => warn!(request_id = %request_id, error = %e, "failed to encode reply"),
    }
}
