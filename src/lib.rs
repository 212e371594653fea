// scada-bridge: umbrella crate for the cloud bridge agent workspace.
// Hosts the cross-crate end-to-end suites under tests/integration/.

pub use bridge_agent as agent;
pub use bridge_protocol as protocol;
