//! Transport seam between the link state machines and the wire.
//!
//! A [`Connector`] opens one session and hands back a [`Connection`]: a sink
//! of outbound frames and a stream of inbound frames. The agent only ever
//! talks to these two halves, so the same link code runs over a real
//! WebSocket or over in-memory channels in tests.

use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream};

use crate::Frame;

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// An open session. Dropping both halves closes it.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Connection {
    pub fn new(
        sink: impl Sink<Frame, Error = TransportError> + Send + 'static,
        stream: impl Stream<Item = Result<Frame, TransportError>> + Send + 'static,
    ) -> Self {
        Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens sessions to a URL.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str)
    -> impl Future<Output = Result<Connection, TransportError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connect(String),
    #[error("WebSocket error: {0}")]
    Ws(String),
    /// A single frame could not be encoded or decoded. The session is still usable.
    #[error("codec error: {0}")]
    Codec(String),
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// True when the error concerns one frame rather than the session.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, TransportError::Codec(_))
    }
}
