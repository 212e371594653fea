//! Local realtime link: the reconnecting session to the local device-data
//! service.
//!
//! # Protocol
//! 1. Connect to `realtime.url`
//! 2. Send `watch-register` for every registry entry (re-subscribe)
//! 3. Forward watch/unwatch commands from the cloud link while connected
//! 4. Publish inbound `register-value` events on a broadcast channel
//!
//! Retry is fast for the first few failures, then slow and steady. The link
//! runs independently of the cloud link; request forwarding never depends on
//! it being up.

use crate::registry::SubscriptionRegistry;
use crate::retry::LocalRetryPolicy;
use crate::session::{SessionStatus, StatusPublisher, shutdown_requested};
use crate::transport::send_message;
use bridge_protocol::{
    BridgeMessage, Connection, Connector, Frame, RegisterValue, RegisterWatchDescriptor,
};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const VALUE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct RealtimeLinkConfig {
    pub url: String,
    pub policy: LocalRetryPolicy,
}

#[derive(Debug)]
enum Command {
    Watch(RegisterWatchDescriptor),
    Unwatch(RegisterWatchDescriptor),
}

/// Cloneable handle to the running realtime link.
#[derive(Debug, Clone)]
pub struct RealtimeHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    values: broadcast::Sender<RegisterValue>,
}

impl RealtimeHandle {
    /// Ask the local service to start sending values for `descriptor`.
    /// Dropped while disconnected; the reconnect replay covers it.
    pub fn subscribe(&self, descriptor: RegisterWatchDescriptor) {
        self.command(Command::Watch(descriptor));
    }

    pub fn unsubscribe(&self, descriptor: RegisterWatchDescriptor) {
        self.command(Command::Unwatch(descriptor));
    }

    fn command(&self, cmd: Command) {
        if !self.is_connected() {
            debug!(?cmd, "realtime link not connected; command not sent");
            return;
        }
        let _ = self.commands.send(cmd);
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn status_changes(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// A fresh receiver of register value events. Only values that arrive
    /// after this call are delivered.
    pub fn register_values(&self) -> broadcast::Receiver<RegisterValue> {
        self.values.subscribe()
    }
}

/// Start the realtime link task.
pub fn spawn<C: Connector>(
    connector: C,
    cfg: RealtimeLinkConfig,
    registry: SubscriptionRegistry,
    shutdown_rx: watch::Receiver<bool>,
) -> (RealtimeHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (values_tx, _) = broadcast::channel(VALUE_CHANNEL_CAPACITY);
    let publisher = StatusPublisher::new();

    let handle = RealtimeHandle {
        commands: commands_tx,
        status: publisher.subscribe(),
        values: values_tx.clone(),
    };
    let link = RealtimeLink {
        connector,
        cfg,
        registry,
        publisher,
        commands: commands_rx,
        values: values_tx,
        shutdown_rx,
    };
    (handle, tokio::spawn(link.run()))
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

struct RealtimeLink<C> {
    connector: C,
    cfg: RealtimeLinkConfig,
    registry: SubscriptionRegistry,
    publisher: StatusPublisher,
    commands: mpsc::UnboundedReceiver<Command>,
    values: broadcast::Sender<RegisterValue>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<C: Connector> RealtimeLink<C> {
    async fn run(mut self) {
        loop {
            if *self.shutdown_rx.borrow() {
                info!("realtime link stopping (shutdown)");
                return;
            }

            self.publisher.connecting();
            info!(url = %self.cfg.url, "connecting to local realtime service");

            let attempt = tokio::select! {
                r = self.connector.connect(&self.cfg.url) => r,
                _ = shutdown_requested(&mut self.shutdown_rx) => return,
            };

            let delay = match attempt {
                Ok(conn) => {
                    // Commands queued before this session are stale; the
                    // registry replay below is authoritative.
                    while self.commands.try_recv().is_ok() {}
                    self.publisher.connected();
                    info!(url = %self.cfg.url, "connected to local realtime service");

                    match self.run_session(conn).await {
                        SessionEnd::Shutdown => {
                            info!("realtime link stopping (shutdown)");
                            return;
                        }
                        SessionEnd::Dropped(reason) => {
                            warn!(reason = %reason, "local realtime session ended");
                            self.publisher.dropped(reason);
                            self.cfg.policy.fast_delay
                        }
                    }
                }
                Err(e) => {
                    let failures = self.publisher.connect_failed(e.to_string());
                    let delay = self.cfg.policy.delay_after_failure(failures);
                    warn!(
                        error = %e,
                        attempt = failures,
                        retry_in_ms = delay_ms(delay),
                        "local realtime connect failed"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_requested(&mut self.shutdown_rx) => {
                    info!("realtime link stopping (shutdown)");
                    return;
                }
            }
        }
    }

    async fn run_session(&mut self, conn: Connection) -> SessionEnd {
        let Connection {
            mut sink,
            mut stream,
        } = conn;

        let watched = self.registry.values();
        if !watched.is_empty() {
            info!(count = watched.len(), "re-subscribing watched registers");
        }
        for descriptor in watched {
            if let Err(e) = send_message(&mut sink, BridgeMessage::WatchRegister(descriptor)).await
            {
                return SessionEnd::Dropped(e.to_string());
            }
        }

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut self.shutdown_rx) => {
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
                Some(cmd) = self.commands.recv() => {
                    let msg = match cmd {
                        Command::Watch(d) => {
                            debug!(key = %d.key(), "subscribing register");
                            BridgeMessage::WatchRegister(d)
                        }
                        Command::Unwatch(d) => {
                            debug!(key = %d.key(), "unsubscribing register");
                            BridgeMessage::UnwatchRegister(d)
                        }
                    };
                    if let Err(e) = send_message(&mut sink, msg).await {
                        return SessionEnd::Dropped(e.to_string());
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame),
                    Some(Err(e)) if e.is_frame_local() => {
                        warn!(error = %e, "dropping undecodable frame from realtime service");
                    }
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    None => return SessionEnd::Dropped("connection closed".to_owned()),
                },
            }
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match BridgeMessage::try_from(frame) {
            Ok(BridgeMessage::RegisterValue(value)) => {
                // No receivers just means no cloud session to forward to.
                let _ = self.values.send(value);
            }
            Ok(other) => debug!(event = %other.event(), "ignoring realtime event"),
            Err(e) => warn!(error = %e, "dropping invalid frame from realtime service"),
        }
    }
}

fn delay_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_protocol::events;
    use bridge_test_utils::{MemoryConnector, Step};

    fn cfg() -> RealtimeLinkConfig {
        RealtimeLinkConfig {
            url: "mem://realtime".to_owned(),
            policy: LocalRetryPolicy::default(),
        }
    }

    /// Test: inbound register values reach subscribers of the handle.
    #[tokio::test(start_paused = true)]
    async fn register_values_are_broadcast() {
        let connector = MemoryConnector::accepting();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) = spawn(connector.clone(), cfg(), SubscriptionRegistry::new(), shutdown_rx);
        let mut values = handle.register_values();

        let peer = connector.next_peer().await;
        let value = RegisterValue {
            register: RegisterWatchDescriptor::new("A1", 10),
            value: serde_json::json!(42),
        };
        peer.send(BridgeMessage::RegisterValue(value.clone()));

        assert_eq!(values.recv().await.unwrap(), value);
    }

    /// Test: commands issued while disconnected are not sent later.
    #[tokio::test(start_paused = true)]
    async fn commands_while_disconnected_are_not_replayed() {
        let connector = MemoryConnector::scripted(
            [Step::Fail("down".to_owned())],
            Step::Accept,
        );
        let registry = SubscriptionRegistry::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) = spawn(connector.clone(), cfg(), registry.clone(), shutdown_rx);

        tokio::task::yield_now().await;
        assert!(!handle.is_connected());
        handle.unsubscribe(RegisterWatchDescriptor::new("stale", 1));
        registry.put(RegisterWatchDescriptor::new("A1", 10));

        let mut peer = connector.next_peer().await;
        let first = peer.recv_frame().await.unwrap();
        assert_eq!(first.event, events::WATCH_REGISTER);
        assert_eq!(first.data["analyzerId"], "A1");
        assert!(peer.drain().is_empty());
    }
}
