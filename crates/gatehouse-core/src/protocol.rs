//! Wire protocol for the gateway handshake
//!
//! Frames are a small tagged union: out-of-band events, client requests,
//! and server responses. The only method a connection may call before it is
//! authorized is `connect`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// The single protocol version this gateway speaks.
pub const PROTOCOL_VERSION: u32 = 3;

/// Event emitted when a connection opens, carrying the challenge nonce.
pub const EVENT_CHALLENGE: &str = "connect.challenge";

/// WebSocket close code for policy/auth failures.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// WebSocket close code for protocol-level failures (version mismatch, bad frames).
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Close reasons must fit a WebSocket close frame (125 bytes minus the code).
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Truncate a close reason to the wire limit without splitting a codepoint.
pub fn truncate_close_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// A single frame on the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Out-of-band server event
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Client request
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Option<Value>,
    },
    /// Server response to a request
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
}

impl Frame {
    /// Build an event frame
    pub fn event(event: impl Into<String>, payload: Value) -> Self {
        Frame::Event {
            event: event.into(),
            payload: Some(payload),
        }
    }

    /// Build a success response
    pub fn ok_res(id: impl Into<String>, payload: Value) -> Self {
        Frame::Res {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    /// Build a failure response
    pub fn err_res(id: impl Into<String>, error: ErrorBody) -> Self {
        Frame::Res {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Closed set of wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    AuthFailed,
    NotPaired,
    RateLimited,
    Unavailable,
}

/// Error body attached to a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Role a client connects as.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Human operator tooling
    Operator,
    /// Remote execution node
    Node,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operator" => Ok(Role::Operator),
            "node" => Ok(Role::Node),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Operator => write!(f, "operator"),
            Role::Node => write!(f, "node"),
        }
    }
}

/// How a client presents itself to the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMode {
    /// Privileged browser/desktop control surface
    Ui,
    /// Command-line client
    Cli,
    /// Headless execution node
    Node,
    /// Anything else
    #[default]
    Unknown,
}

impl std::str::FromStr for ClientMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ui" | "webui" | "control-ui" => Ok(Self::Ui),
            "cli" => Ok(Self::Cli),
            "node" => Ok(Self::Node),
            _ => Ok(Self::Unknown),
        }
    }
}

impl std::fmt::Display for ClientMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientMode::Ui => write!(f, "ui"),
            ClientMode::Cli => write!(f, "cli"),
            ClientMode::Node => write!(f, "node"),
            ClientMode::Unknown => write!(f, "unknown"),
        }
    }
}

/// Client self-description inside a connect request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
}

impl ClientInfo {
    /// Parsed mode; unrecognized strings fold to [`ClientMode::Unknown`].
    pub fn mode(&self) -> ClientMode {
        self.mode.parse().unwrap_or_default()
    }
}

/// Shared-secret credentials. A `token` may also be a device token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Per-device signature block presented at connect time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuth {
    /// Claimed device id; must match the recomputation from `public_key`
    pub id: String,
    /// Base64-encoded ed25519 public key
    pub public_key: String,
    /// Base64-encoded signature over the canonical payload
    pub signature: String,
    pub signed_at_ms: i64,
    /// Challenge echo; required for non-local connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// The first (and only pre-authorization) request on a connection.
///
/// `role` stays a raw string here so an unknown role can be rejected as a
/// policy error instead of a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<SharedAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceAuth>,
}

/// Presence row shared with authorized clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub key: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    pub mode: ClientMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<Role>,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub last_seen_at_ms: i64,
}

/// Server identity advertised in the hello payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerIdent {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub host: String,
    pub connection_id: String,
}

/// Methods and events this gateway serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

/// State snapshot handed to a freshly authorized connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub presence: Vec<PresenceEntry>,
    pub presence_version: u64,
}

/// Token grant included on successful device handshakes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthGrant {
    pub device_token: String,
    pub role: Role,
    pub scopes: Vec<String>,
    pub issued_at_ms: i64,
}

/// Connection policy limits advertised to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyInfo {
    pub max_payload_bytes: usize,
    pub max_buffered_bytes: usize,
    pub tick_interval_ms: u64,
}

/// Success payload of the connect response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub protocol: u32,
    pub server: ServerIdent,
    pub features: Features,
    pub snapshot: Snapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthGrant>,
    pub policy: PolicyInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::Req {
            id: "1".into(),
            method: "connect".into(),
            params: Some(serde_json::json!({"minProtocol": 3})),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"req\""));
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Frame::Req { ref method, .. } if method == "connect"));
    }

    #[test]
    fn test_error_code_wire_names() {
        let body = ErrorBody::new(ErrorCode::NotPaired, "pairing required");
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("NOT_PAIRED"));
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("operator".parse::<Role>().unwrap(), Role::Operator);
        assert_eq!("node".parse::<Role>().unwrap(), Role::Node);
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn test_client_mode_folds_unknown() {
        assert_eq!("ui".parse::<ClientMode>().unwrap(), ClientMode::Ui);
        assert_eq!("weird".parse::<ClientMode>().unwrap(), ClientMode::Unknown);
    }

    #[test]
    fn test_connect_request_optional_fields() {
        let json = r#"{
            "minProtocol": 3,
            "maxProtocol": 3,
            "client": {"id": "cli-1", "version": "1.0.0", "platform": "linux", "mode": "cli"},
            "role": "operator"
        }"#;
        let req: ConnectRequest = serde_json::from_str(json).unwrap();
        assert!(req.scopes.is_empty());
        assert!(req.auth.is_none());
        assert!(req.device.is_none());
        assert_eq!(req.client.mode(), ClientMode::Cli);
    }

    #[test]
    fn test_close_reason_truncation() {
        let long = "x".repeat(500);
        let truncated = truncate_close_reason(&long);
        assert_eq!(truncated.len(), MAX_CLOSE_REASON_BYTES);

        let multibyte = "é".repeat(100);
        let truncated = truncate_close_reason(&multibyte);
        assert!(truncated.len() <= MAX_CLOSE_REASON_BYTES);
        assert!(truncated.chars().all(|c| c == 'é'));
    }
}
