//! Shared application state across connection handlers

use crate::presence::PresenceTable;
use gatehouse_auth::{
    AuditLog, AuthRateLimiter, AuthResolver, DeviceSignatureVerifier, DeviceTokenStore,
    PairingCoordinator, PairingStore,
};
use gatehouse_core::GatewayConfig;
use std::sync::Arc;

/// Everything a connection handler needs, shared behind one `Arc`.
///
/// The stores are passed in by the binary so tests can stand the whole
/// gateway up against temp directories.
pub struct AppState {
    /// Configuration
    pub config: GatewayConfig,
    /// Brute-force rate limiting, shared across connections
    pub limiter: Arc<AuthRateLimiter>,
    /// Per-(device, role) bearer tokens
    pub tokens: Arc<DeviceTokenStore>,
    /// Paired devices and pending requests
    pub pairing: Arc<PairingStore>,
    /// Pairing workflow driver
    pub coordinator: PairingCoordinator,
    /// Credential resolution
    pub resolver: AuthResolver,
    /// Connect-time signature validation
    pub signatures: DeviceSignatureVerifier,
    /// Privilege-change and rejection trail
    pub audit: Arc<AuditLog>,
    /// Connected-client table
    pub presence: PresenceTable,
    /// Hostname advertised in the hello payload
    pub host: String,
}

impl AppState {
    /// Create a new application state
    pub fn new(
        config: GatewayConfig,
        limiter: Arc<AuthRateLimiter>,
        tokens: Arc<DeviceTokenStore>,
        pairing: Arc<PairingStore>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let coordinator = PairingCoordinator::new(pairing.clone(), audit.clone());
        let resolver = AuthResolver::new(
            config.shared_secret.clone(),
            limiter.clone(),
            tokens.clone(),
        );
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            config,
            limiter,
            tokens,
            pairing,
            coordinator,
            resolver,
            signatures: DeviceSignatureVerifier::new(),
            audit,
            presence: PresenceTable::new(),
            host,
        }
    }
}
