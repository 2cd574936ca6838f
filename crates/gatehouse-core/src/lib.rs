//! Gatehouse Core - Shared types and protocol definitions
//!
//! This crate provides the foundational types used across all Gatehouse
//! components: the handshake wire protocol, gateway configuration, and the
//! common error type.

pub mod config;
pub mod error;
pub mod protocol;

pub use config::{ControlUiConfig, GatewayConfig, PolicyConfig, RateLimitConfig};
pub use error::{Error, Result};
pub use protocol::{
    ClientInfo, ClientMode, ConnectRequest, DeviceAuth, ErrorBody, ErrorCode, Frame,
    HelloPayload, PresenceEntry, Role, SharedAuth, PROTOCOL_VERSION,
};
