// memory: A scripted, in-process `Connector`.
//
// Every connect attempt is recorded with the (possibly paused) tokio clock,
// then either fails or yields a session backed by unbounded channels. The
// other end of an accepted session is handed to the test as a `MemoryPeer`.
// No sockets are involved, so tests using `start_paused = true` advance time
// deterministically.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bridge_protocol::{BridgeMessage, Connection, Connector, Frame, TransportError};
use futures::channel::mpsc as fmpsc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// What a single connect attempt does.
#[derive(Debug, Clone)]
pub enum Step {
    Fail(String),
    Accept,
}

/// One recorded connect attempt.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub url: String,
    pub at: Instant,
}

struct Inner {
    script: Mutex<VecDeque<Step>>,
    fallback: Mutex<Step>,
    attempts: Mutex<Vec<Attempt>>,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<Inner>,
}

impl MemoryConnector {
    /// Run `steps` in order, then repeat `then` forever.
    pub fn scripted(steps: impl IntoIterator<Item = Step>, then: Step) -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        MemoryConnector {
            inner: Arc::new(Inner {
                script: Mutex::new(steps.into_iter().collect()),
                fallback: Mutex::new(then),
                attempts: Mutex::new(Vec::new()),
                peers_tx,
                peers_rx: tokio::sync::Mutex::new(peers_rx),
            }),
        }
    }

    /// Every attempt fails with "connection refused".
    pub fn refusing() -> Self {
        Self::scripted([], Step::Fail("connection refused".to_owned()))
    }

    /// Every attempt succeeds.
    pub fn accepting() -> Self {
        Self::scripted([], Step::Accept)
    }

    /// Change what attempts do once the script is exhausted.
    pub fn set_fallback(&self, step: Step) {
        if let Ok(mut fallback) = self.inner.fallback.lock() {
            *fallback = step;
        }
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.inner
            .attempts
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    pub fn attempt_count(&self) -> usize {
        self.inner.attempts.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Wait for the next accepted session.
    pub async fn next_peer(&self) -> MemoryPeer {
        let mut rx = self.inner.peers_rx.lock().await;
        rx.recv()
            .await
            .expect("connector owns a sender; channel cannot close")
    }

    fn next_step(&self) -> Step {
        let scripted = self
            .inner
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front());
        match scripted {
            Some(step) => step,
            None => self
                .inner
                .fallback
                .lock()
                .map(|f| f.clone())
                .unwrap_or(Step::Accept),
        }
    }
}

impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        if let Ok(mut attempts) = self.inner.attempts.lock() {
            attempts.push(Attempt {
                url: url.to_owned(),
                at: Instant::now(),
            });
        }

        match self.next_step() {
            Step::Fail(reason) => Err(TransportError::Connect(reason)),
            Step::Accept => {
                let (to_agent_tx, to_agent_rx) = fmpsc::unbounded::<Result<Frame, TransportError>>();
                let (from_agent_tx, from_agent_rx) = fmpsc::unbounded::<Frame>();
                let sink = from_agent_tx.sink_map_err(|_| TransportError::Closed);
                let _ = self.inner.peers_tx.send(MemoryPeer {
                    url: url.to_owned(),
                    tx: to_agent_tx,
                    rx: from_agent_rx,
                });
                Ok(Connection::new(sink, to_agent_rx))
            }
        }
    }
}

/// The far end of an accepted in-memory session.
///
/// Dropping the peer ends the agent's inbound stream, which the agent sees as
/// the remote side going away.
pub struct MemoryPeer {
    pub url: String,
    tx: fmpsc::UnboundedSender<Result<Frame, TransportError>>,
    rx: fmpsc::UnboundedReceiver<Frame>,
}

impl MemoryPeer {
    pub fn send_frame(&self, frame: Frame) {
        let _ = self.tx.unbounded_send(Ok(frame));
    }

    pub fn send(&self, msg: BridgeMessage) {
        let frame = Frame::try_from(msg).expect("test message must encode");
        self.send_frame(frame);
    }

    /// Deliver a transport-level error to the agent's inbound stream.
    pub fn inject_error(&self, err: TransportError) {
        let _ = self.tx.unbounded_send(Err(err));
    }

    /// Next frame the agent sent. `None` once the agent dropped its sink.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.rx.next().await
    }

    /// Next frame with the given event, skipping others.
    pub async fn recv_event(&mut self, event: &str) -> Option<Frame> {
        loop {
            let frame = self.recv_frame().await?;
            if frame.event == event {
                return Some(frame);
            }
        }
    }

    /// Drain every frame already sent by the agent without waiting.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Ok(Some(frame)) = self.rx.try_next() {
            out.push(frame);
        }
        out
    }
}
