//! Gatehouse Server - Axum-based WebSocket handshake server
//!
//! This crate hosts the connect handshake: the WebSocket endpoint every
//! client must authenticate through, the handshake controller that drives
//! the auth components, and the HTTP API used to approve pairing requests.

pub mod handshake;
pub mod http;
pub mod presence;
pub mod state;
pub mod websocket;

pub use handshake::{
    Challenge, ConnectionContext, HandshakeController, HandshakeSuccess, Rejection,
};
pub use http::create_router;
pub use presence::PresenceTable;
pub use state::AppState;
pub use websocket::{gateway_ws_handler, handle_gateway_socket, resolve_client_ip};
