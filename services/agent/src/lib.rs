// bridge-agent: Library entry point.
// Exposes modules for integration testing.

pub mod agent;
pub mod cloud;
pub mod config;
pub mod local_api;
pub mod probe;
pub mod realtime;
pub mod registry;
pub mod reply;
pub mod retry;
pub mod session;
pub mod settings;
pub mod status_http;
pub mod transport;
