// bridge-test-utils: Shared test utilities for the bridge agent.
//
// Provides a real mock WebSocket server (for exercising the agent's
// tokio-tungstenite transport end to end) and a scripted in-memory connector
// (for deterministic retry timing under a paused tokio clock).

pub mod memory;
pub mod mock_ws_server;

pub use memory::{Attempt, MemoryConnector, MemoryPeer, Step};
pub use mock_ws_server::{MockPeer, MockWsServer};
