//! Configuration types for Gatehouse

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Control-UI policy: origin allow-list and the explicit escape hatches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlUiConfig {
    /// Origins allowed to connect as `ui` mode clients
    pub allowed_origins: Vec<String>,
    /// Skip the secure-context channel check for UI clients.
    /// Does NOT bypass device-identity requirements.
    pub allow_insecure_auth: bool,
    /// Waive device-identity requirements entirely. Clearly named on purpose.
    pub dangerously_disable_device_auth: bool,
}

/// Brute-force rate limit tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    /// Failures tolerated inside one window before lockout
    pub max_attempts: u32,
    /// Rolling window length
    pub window_ms: i64,
    /// Lockout duration once the window is exhausted
    pub lockout_ms: i64,
    /// Loopback clients bypass the limiter
    pub exempt_loopback: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            window_ms: 60_000,
            lockout_ms: 300_000,
            exempt_loopback: true,
        }
    }
}

/// Connection policy limits advertised in the hello payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyConfig {
    pub max_payload_bytes: usize,
    pub max_buffered_bytes: usize,
    pub tick_interval_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
            max_buffered_bytes: 4 * 1024 * 1024,
            tick_interval_ms: 30_000,
        }
    }
}

/// Main configuration for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Bind address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Shared secret for token/password auth; None runs the gateway open
    pub shared_secret: Option<String>,
    /// Budget for the first handshake frame before the connection is dropped
    pub handshake_timeout_ms: u64,
    /// Proxies whose forwarding headers are trusted for client-IP resolution
    pub trusted_proxies: Vec<String>,
    /// Fall back to `X-Real-IP` when the peer is a trusted proxy
    pub allow_real_ip_fallback: bool,
    pub control_ui: ControlUiConfig,
    pub rate_limit: RateLimitConfig,
    pub policy: PolicyConfig,
    /// Directory holding paired-device and token state; defaults to the
    /// platform config dir
    pub state_dir: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8790,
            shared_secret: None,
            handshake_timeout_ms: 10_000,
            trusted_proxies: Vec::new(),
            allow_real_ip_fallback: false,
            control_ui: ControlUiConfig::default(),
            rate_limit: RateLimitConfig::default(),
            policy: PolicyConfig::default(),
            state_dir: None,
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Builder pattern: set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder pattern: set shared secret
    pub fn with_shared_secret(mut self, secret: impl Into<String>) -> Self {
        self.shared_secret = Some(secret.into());
        self
    }

    /// Builder pattern: set state directory
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults; a malformed one is an error so a
    /// typo cannot silently open the gateway.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 8790);
        assert!(config.shared_secret.is_none());
        assert!(config.rate_limit.exempt_loopback);
        assert!(!config.control_ui.dangerously_disable_device_auth);
    }

    #[test]
    fn test_partial_config_parses() {
        let json = r#"{"port": 9000, "controlUi": {"allowedOrigins": ["https://ui.example"]}}"#;
        let config: GatewayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.control_ui.allowed_origins.len(), 1);
        assert_eq!(config.rate_limit.max_attempts, 10);
    }

    #[test]
    fn test_builder() {
        let config = GatewayConfig::new()
            .with_port(9100)
            .with_shared_secret("hunter2");
        assert_eq!(config.port, 9100);
        assert_eq!(config.shared_secret.as_deref(), Some("hunter2"));
    }
}
