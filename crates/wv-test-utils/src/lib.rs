//! Shared test scaffolding for the Webverse suite: canned wire fixtures
//! and a minimal WebSocket test client speaking the v1 protocol.

pub mod fixtures;
pub mod ws_client;

pub use ws_client::WsTestClient;
