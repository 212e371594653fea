// mock_ws_server: A WebSocket peer for exercising the agent's real transport.
//
// Accepts connections on ws://127.0.0.1:<port> and hands each accepted
// session to the test as a `MockPeer`. The test then plays either side: the
// cloud bridge (sending api-request / watch-register) or the local realtime
// service (sending register-value).

use std::net::SocketAddr;

use bridge_protocol::{BridgeMessage, Frame};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type ServerWs = WebSocketStream<TcpStream>;

/// A mock WebSocket server for integration testing.
///
/// Binds to port 0 (random). Each test can spin up its own isolated instance.
pub struct MockWsServer {
    addr: SocketAddr,
    peers: mpsc::UnboundedReceiver<MockPeer>,
    /// Handle to the background accept loop; aborted when the server is dropped.
    task: tokio::task::JoinHandle<()>,
}

impl MockWsServer {
    /// Start the mock server, binding to a random available port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, peers) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            Self::accept_loop(listener, tx).await;
        });

        Ok(Self { addr, peers, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL for `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Wait for the next client session.
    pub async fn accept(&mut self) -> Option<MockPeer> {
        self.peers.recv().await
    }

    async fn accept_loop(listener: TcpListener, tx: mpsc::UnboundedSender<MockPeer>) {
        while let Ok((stream, _peer)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                // Handshake failures are expected when a client gives up early.
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    let (write, read) = ws.split();
                    let _ = tx.send(MockPeer { write, read });
                }
            });
        }
    }
}

impl Drop for MockWsServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Server side of one accepted WebSocket session.
pub struct MockPeer {
    write: futures_util::stream::SplitSink<ServerWs, Message>,
    read: futures_util::stream::SplitStream<ServerWs>,
}

impl MockPeer {
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error>> {
        let json = frame.encode()?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    pub async fn send_message(
        &mut self,
        msg: BridgeMessage,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.send_frame(&Frame::try_from(msg)?).await
    }

    /// Send raw text, e.g. to check that garbage does not kill the session.
    pub async fn send_text(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Next frame from the client. `None` once the client has gone away.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Frame::decode(&text).ok(),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Next frame whose event is `event`, skipping everything else (heartbeats, identify...).
    pub async fn recv_event(&mut self, event: &str) -> Option<Frame> {
        loop {
            let frame = self.recv_frame().await?;
            if frame.event == event {
                return Some(frame);
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.write.send(Message::Close(None)).await;
    }
}
