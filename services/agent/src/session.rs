//! Connection session model shared by the cloud and realtime links.
//!
//! Each link owns a [`StatusPublisher`] and publishes its [`SessionStatus`]
//! through a `watch` channel; the orchestrator and the status HTTP surface
//! only ever read snapshots. [`ConnectGuard`] is the "is connecting" flag that
//! keeps the settings re-check and the cloud reconnect from overlapping.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, watch};

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
        }
    }
}

/// Snapshot of one link's session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    /// Consecutive failed connect attempts since the last successful one.
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// When `state` was entered.
    pub since: DateTime<Utc>,
}

impl SessionStatus {
    pub fn disconnected() -> Self {
        SessionStatus {
            state: SessionState::Disconnected,
            retry_count: 0,
            last_error: None,
            since: Utc::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
}

/// Write side of a link's status channel.
#[derive(Debug)]
pub struct StatusPublisher {
    tx: watch::Sender<SessionStatus>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionStatus::disconnected());
        StatusPublisher { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionStatus {
        self.tx.borrow().clone()
    }

    pub fn connecting(&self) {
        self.tx.send_modify(|s| {
            s.state = SessionState::Connecting;
            s.since = Utc::now();
        });
    }

    pub fn connected(&self) {
        self.tx.send_modify(|s| {
            s.state = SessionState::Connected;
            s.retry_count = 0;
            s.last_error = None;
            s.since = Utc::now();
        });
    }

    /// A connect attempt failed. Returns the new consecutive failure count.
    pub fn connect_failed(&self, error: impl Into<String>) -> u32 {
        let error = error.into();
        let mut count = 0;
        self.tx.send_modify(|s| {
            s.state = SessionState::Disconnected;
            s.retry_count = s.retry_count.saturating_add(1);
            s.last_error = Some(error);
            s.since = Utc::now();
            count = s.retry_count;
        });
        count
    }

    /// An established session ended.
    pub fn dropped(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_modify(|s| {
            s.state = SessionState::Disconnected;
            s.last_error = Some(reason);
            s.since = Utc::now();
        });
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Connect guard
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct GuardInner {
    busy: AtomicBool,
    released: Notify,
}

/// Mutual exclusion for reconnect work on the cloud link.
#[derive(Debug, Clone, Default)]
pub struct ConnectGuard {
    inner: Arc<GuardInner>,
}

/// Held while connecting; releases the guard on drop.
#[derive(Debug)]
pub struct ConnectingToken {
    inner: Arc<GuardInner>,
}

impl ConnectGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard if nobody holds it.
    pub fn try_begin(&self) -> Option<ConnectingToken> {
        self.inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ConnectingToken {
                inner: Arc::clone(&self.inner),
            })
    }

    /// Wait until the guard is free, then take it.
    pub async fn begin(&self) -> ConnectingToken {
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not lost.
            notified.as_mut().enable();
            if let Some(token) = self.try_begin() {
                return token;
            }
            notified.await;
        }
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }
}

impl Drop for ConnectingToken {
    fn drop(&mut self) {
        self.inner.busy.store(false, Ordering::Release);
        self.inner.released.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Resolves once shutdown is requested or the shutdown sender is gone.
/// Cancel-safe, for use in `select!` loops.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn try_begin_is_exclusive_until_token_dropped() {
        let guard = ConnectGuard::new();
        let token = guard.try_begin().expect("free guard");
        assert!(guard.is_connecting());
        assert!(guard.clone().try_begin().is_none());

        drop(token);
        assert!(!guard.is_connecting());
        assert!(guard.try_begin().is_some());
    }

    #[tokio::test]
    async fn begin_waits_for_release() {
        let guard = ConnectGuard::new();
        let held = guard.try_begin().unwrap();

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move {
                let _token = guard.begin().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "waiter must block while guard is held");

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
        assert!(!guard.is_connecting());
    }

    #[test]
    fn status_counts_failures_and_resets_on_connect() {
        let publisher = StatusPublisher::new();
        let rx = publisher.subscribe();

        publisher.connecting();
        assert_eq!(rx.borrow().state, SessionState::Connecting);
        assert_eq!(publisher.connect_failed("refused"), 1);
        assert_eq!(publisher.connect_failed("refused"), 2);
        assert_eq!(rx.borrow().last_error.as_deref(), Some("refused"));

        publisher.connected();
        let snap = publisher.snapshot();
        assert!(snap.is_connected());
        assert_eq!(snap.retry_count, 0);
        assert!(snap.last_error.is_none());

        publisher.dropped("closed");
        assert_eq!(publisher.snapshot().state, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_requested_ignores_false_updates() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(false).unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(20), shutdown_requested(&mut rx)).await;
        assert!(waiting.is_err(), "false must not count as shutdown");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), shutdown_requested(&mut rx))
            .await
            .expect("true signals shutdown");
    }

    #[test]
    fn status_serializes_camel_case() {
        let v = serde_json::to_value(SessionStatus::disconnected()).unwrap();
        assert_eq!(v["state"], "disconnected");
        assert_eq!(v["retryCount"], 0);
        assert!(v["lastError"].is_null());
        assert!(v["since"].is_string());
    }
}
