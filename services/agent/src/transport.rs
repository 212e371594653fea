//! WebSocket implementation of the [`Connector`] seam.
//!
//! Frames travel as JSON text messages. Control frames are handled by
//! tungstenite; a close frame surfaces as [`TransportError::Closed`] and a
//! text message that fails to decode as a per-frame [`TransportError::Codec`].

use bridge_protocol::{BridgeMessage, Connection, Connector, Frame, FrameSink, TransportError};
use futures_util::{SinkExt, StreamExt, future};
use std::time::Duration;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        WsConnector { connect_timeout }
    }
}

impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let (ws, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| {
                    TransportError::Connect(format!(
                        "timed out after {}ms",
                        self.connect_timeout.as_millis()
                    ))
                })?
                .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (write, read) = ws.split();
        let sink = write
            .sink_map_err(|e| TransportError::Ws(e.to_string()))
            .with(|frame: Frame| future::ready(encode(&frame)));
        let stream = read.filter_map(|msg| future::ready(decode(msg)));
        Ok(Connection::new(sink, stream))
    }
}

fn encode(frame: &Frame) -> Result<Message, TransportError> {
    frame
        .encode()
        .map(|text| Message::Text(text.into()))
        .map_err(|e| TransportError::Codec(e.to_string()))
}

fn decode(msg: Result<Message, tungstenite::Error>) -> Option<Result<Frame, TransportError>> {
    match msg {
        Ok(Message::Text(text)) => {
            Some(Frame::decode(&text).map_err(|e| TransportError::Codec(e.to_string())))
        }
        Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
        Ok(_) => None,
        Err(e) => Some(Err(TransportError::Ws(e.to_string()))),
    }
}

// ---------------------------------------------------------------------------
// Outbound helpers shared by both links
// ---------------------------------------------------------------------------

/// Send one message. Errors confined to this frame are logged and swallowed;
/// anything else means the session is gone.
pub(crate) async fn send_message(
    sink: &mut FrameSink,
    msg: BridgeMessage,
) -> Result<(), TransportError> {
    match Frame::try_from(msg) {
        Ok(frame) => send_frame(sink, frame).await,
        Err(e) => {
            warn!(error = %e, "failed to encode outbound message");
            Ok(())
        }
    }
}

pub(crate) async fn send_frame(sink: &mut FrameSink, frame: Frame) -> Result<(), TransportError> {
    match sink.send(frame).await {
        Err(e) if e.is_frame_local() => {
            warn!(error = %e, "dropping outbound frame");
            Ok(())
        }
        other => other,
    }
}
