//! Per-connection handshake orchestration
//!
//! The controller owns the connect state machine:
//! `AwaitingFirstFrame → {Rejected | AuthPending} → {Rejected |
//! PairingPending | Connected}`. Each decision step is a method returning
//! either "carry on" or a [`Rejection`], and [`HandshakeController::process_connect`]
//! threads them in order, so the state machine is visible in the code
//! structure instead of scattered across callbacks.

use crate::state::AppState;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use gatehouse_auth::{
    derive_device_id, AuditEntry, AuthAttempt, AuthMethod, ClientMeta, ReconcileOutcome,
    SignatureContext,
};
use gatehouse_core::protocol::{
    AuthGrant, ClientMode, ConnectRequest, DeviceAuth, ErrorBody, ErrorCode, Features,
    HelloPayload, PolicyInfo, PresenceEntry, Role, ServerIdent, Snapshot,
    CLOSE_POLICY_VIOLATION, CLOSE_PROTOCOL_ERROR, PROTOCOL_VERSION,
};
use rand::Rng;
use serde_json::json;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-connection challenge, issued on open and consumed by the handshake.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub connection_id: Uuid,
    pub nonce: String,
    pub issued_at_ms: i64,
}

impl Challenge {
    pub fn issue() -> Self {
        let mut rng = rand::thread_rng();
        let bytes: [u8; 32] = rng.gen();
        Self {
            connection_id: Uuid::new_v4(),
            nonce: BASE64.encode(bytes),
            issued_at_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Connection facts the handshake decisions depend on.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub challenge: Challenge,
    pub remote_ip: IpAddr,
    /// Declared origin (browser clients), from the upgrade request
    pub origin: Option<String>,
}

impl ConnectionContext {
    pub fn new(remote_ip: IpAddr, origin: Option<String>) -> Self {
        Self {
            challenge: Challenge::issue(),
            remote_ip,
            origin,
        }
    }

    pub fn is_local(&self) -> bool {
        self.remote_ip.is_loopback()
    }
}

/// A terminal handshake failure: wire error plus close behavior.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub close_code: u16,
}

impl Rejection {
    /// Protocol-level failure; closes with the protocol error code.
    fn protocol(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidRequest,
            message: message.into(),
            details: None,
            close_code: CLOSE_PROTOCOL_ERROR,
        }
    }

    /// Malformed or disallowed request content; policy close.
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidRequest,
            message: message.into(),
            details: None,
            close_code: CLOSE_POLICY_VIOLATION,
        }
    }

    fn auth(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::AuthFailed,
            message: message.into(),
            details: None,
            close_code: CLOSE_POLICY_VIOLATION,
        }
    }

    fn rate_limited(retry_after_ms: i64) -> Self {
        Self {
            code: ErrorCode::RateLimited,
            message: format!("rate limited; retry in {retry_after_ms}ms"),
            details: Some(json!({ "retryAfterMs": retry_after_ms })),
            close_code: CLOSE_POLICY_VIOLATION,
        }
    }

    fn not_paired(request_id: &str) -> Self {
        Self {
            code: ErrorCode::NotPaired,
            message: "pairing approval required".into(),
            details: Some(json!({ "requestId": request_id })),
            close_code: CLOSE_POLICY_VIOLATION,
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Unavailable,
            message: message.into(),
            details: None,
            close_code: CLOSE_POLICY_VIOLATION,
        }
    }

    pub fn error_body(&self) -> ErrorBody {
        let mut body = ErrorBody::new(self.code, self.message.clone());
        if let Some(details) = &self.details {
            body = body.with_details(details.clone());
        }
        body
    }
}

/// The authorized connection handle a successful handshake produces.
#[derive(Debug, Clone)]
pub struct HandshakeSuccess {
    pub hello: HelloPayload,
    pub role: Role,
    pub mode: ClientMode,
    pub device_id: Option<String>,
    /// Key of this connection's presence row
    pub presence_key: String,
}

/// Drives the connect handshake for one connection at a time.
pub struct HandshakeController {
    state: Arc<AppState>,
}

impl HandshakeController {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Validate a connect request end to end and promote the connection.
    pub async fn process_connect(
        &self,
        ctx: &ConnectionContext,
        req: &ConnectRequest,
    ) -> Result<HandshakeSuccess, Rejection> {
        let protocol = self.negotiate_protocol(req)?;
        let role = self.parse_role(req)?;
        let mode = req.client.mode();
        self.check_origin(ctx, mode)?;

        let device_auth_disabled = self.state.config.control_ui.dangerously_disable_device_auth;
        let device = if device_auth_disabled {
            if req.device.is_some() {
                warn!("Device auth disabled by configuration; ignoring device block");
            }
            None
        } else {
            req.device.as_ref()
        };

        // Scopes only mean anything against a device's trust record.
        let scopes: BTreeSet<String> = if device.is_some() {
            req.scopes.iter().cloned().collect()
        } else {
            BTreeSet::new()
        };

        let verified_device_id = device.and_then(|d| {
            derive_device_id(&d.public_key).filter(|derived| *derived == d.id)
        });

        let verdict = self
            .state
            .resolver
            .resolve(&AuthAttempt {
                shared: req.auth.as_ref(),
                verified_device_id: verified_device_id.as_deref(),
                role,
                scopes: &scopes,
                ip: ctx.remote_ip,
            })
            .await;
        if !verdict.ok {
            if verdict.rate_limited {
                return Err(Rejection::rate_limited(verdict.retry_after_ms.unwrap_or(0)));
            }
            return Err(Rejection::auth(describe_auth_failure(req, &verdict.reason)));
        }

        if let Some(device) = device {
            self.verify_device_signature(ctx, req, role, device, &verdict.method)?;
        } else {
            self.check_deviceless_admission(role, mode, &verdict.method, device_auth_disabled)?;
        }

        let meta = client_meta(req, mode);
        let auth_method = verdict.method.map(|m| m.as_str());
        if let Some(device) = device {
            let outcome = self
                .state
                .coordinator
                .reconcile(
                    &device.id,
                    &device.public_key,
                    role,
                    &scopes,
                    &ctx.remote_ip.to_string(),
                    &meta,
                    ctx.is_local(),
                    auth_method,
                )
                .await
                .map_err(|e| {
                    warn!("Pairing store failure: {}", e);
                    Rejection::unavailable("pairing store unavailable")
                })?;
            if let ReconcileOutcome::PairingRequired { request_id } = outcome {
                info!(
                    "Connection {} pairing-gated (device {}, request {})",
                    ctx.challenge.connection_id, device.id, request_id
                );
                return Err(Rejection::not_paired(&request_id));
            }
        }

        let auth_grant = match device {
            Some(device) => Some(self.issue_grant(&device.id, role, &scopes).await?),
            None => None,
        };

        let presence_key = req
            .client
            .instance_id
            .clone()
            .unwrap_or_else(|| ctx.challenge.connection_id.to_string());
        let entry = PresenceEntry {
            key: presence_key.clone(),
            display_name: req
                .client
                .display_name
                .clone()
                .unwrap_or_else(|| req.client.id.clone()),
            ip: Some(ctx.remote_ip.to_string()),
            platform: Some(req.client.platform.clone()),
            mode,
            device_id: device.map(|d| d.id.clone()),
            roles: [role].into(),
            scopes: scopes.clone(),
            instance_id: req.client.instance_id.clone(),
            last_seen_at_ms: Utc::now().timestamp_millis(),
        };
        self.state.presence.upsert(entry).await;

        let (presence, presence_version) = self.state.presence.snapshot().await;
        let hello = HelloPayload {
            protocol,
            server: ServerIdent {
                version: env!("CARGO_PKG_VERSION").to_string(),
                commit: option_env!("GATEHOUSE_BUILD_COMMIT").map(str::to_string),
                host: self.state.host.clone(),
                connection_id: ctx.challenge.connection_id.to_string(),
            },
            features: Features {
                methods: vec!["connect".into(), "ping".into()],
                events: vec!["connect.challenge".into()],
            },
            snapshot: Snapshot {
                presence,
                presence_version,
            },
            auth: auth_grant,
            policy: PolicyInfo {
                max_payload_bytes: self.state.config.policy.max_payload_bytes,
                max_buffered_bytes: self.state.config.policy.max_buffered_bytes,
                tick_interval_ms: self.state.config.policy.tick_interval_ms,
            },
        };

        info!(
            "Connection {} authorized as {} ({} mode{})",
            ctx.challenge.connection_id,
            role,
            mode,
            device
                .map(|d| format!(", device {}", d.id))
                .unwrap_or_default()
        );

        Ok(HandshakeSuccess {
            hello,
            role,
            mode,
            device_id: device.map(|d| d.id.clone()),
            presence_key,
        })
    }

    /// Record a rejection with enough context to reconstruct it later.
    pub async fn record_rejection(
        &self,
        ctx: &ConnectionContext,
        client_id: Option<&str>,
        rejection: &Rejection,
    ) {
        self.state
            .audit
            .record(AuditEntry {
                remote_ip: Some(ctx.remote_ip.to_string()),
                client_id: client_id.map(str::to_string),
                detail: Some(format!("{:?}: {}", rejection.code, rejection.message)),
                ..AuditEntry::new("handshake-rejected")
            })
            .await;
    }

    fn negotiate_protocol(&self, req: &ConnectRequest) -> Result<u32, Rejection> {
        if req.min_protocol > req.max_protocol {
            return Err(Rejection::protocol("invalid protocol range"));
        }
        if req.min_protocol > PROTOCOL_VERSION || req.max_protocol < PROTOCOL_VERSION {
            return Err(Rejection::protocol(format!(
                "protocol mismatch: server speaks {PROTOCOL_VERSION}, client offered {}..{}",
                req.min_protocol, req.max_protocol
            )));
        }
        Ok(PROTOCOL_VERSION)
    }

    fn parse_role(&self, req: &ConnectRequest) -> Result<Role, Rejection> {
        req.role
            .parse()
            .map_err(|e: String| Rejection::invalid(e))
    }

    /// Privileged UI clients must come from an allow-listed origin over a
    /// secure (loopback) channel. Failing here never falls through to
    /// weaker auth paths.
    fn check_origin(&self, ctx: &ConnectionContext, mode: ClientMode) -> Result<(), Rejection> {
        if mode != ClientMode::Ui {
            return Ok(());
        }
        let control_ui = &self.state.config.control_ui;
        if !ctx.is_local() && !control_ui.allow_insecure_auth {
            return Err(Rejection::auth("insecure channel for control UI"));
        }
        let allowed = ctx
            .origin
            .as_deref()
            .is_some_and(|origin| control_ui.allowed_origins.iter().any(|a| a == origin));
        if !allowed {
            debug!("Origin {:?} not in the control UI allow-list", ctx.origin);
            return Err(Rejection::auth("origin not allowed"));
        }
        Ok(())
    }

    fn verify_device_signature(
        &self,
        ctx: &ConnectionContext,
        req: &ConnectRequest,
        role: Role,
        device: &DeviceAuth,
        method: &Option<AuthMethod>,
    ) -> Result<(), Rejection> {
        let role_str = role.to_string();
        let mode_str = req.client.mode().to_string();
        let sig_ctx = SignatureContext {
            challenge_nonce: &ctx.challenge.nonce,
            is_local: ctx.is_local(),
            client_id: &req.client.id,
            client_mode: &mode_str,
            role: &role_str,
            scopes: &req.scopes,
            token: req.auth.as_ref().and_then(|a| a.token.as_deref()),
        };
        self.state
            .signatures
            .verify(device, &sig_ctx)
            .map_err(|failure| {
                warn!(
                    "Device signature check failed for {} via {:?}: {}",
                    device.id, method, failure
                );
                Rejection::auth(failure.as_reason())
            })
    }

    /// Only a narrow set of clients may connect without a device identity:
    /// CLI-style clients, and shared-secret nodes.
    fn check_deviceless_admission(
        &self,
        role: Role,
        mode: ClientMode,
        method: &Option<AuthMethod>,
        device_auth_disabled: bool,
    ) -> Result<(), Rejection> {
        if device_auth_disabled || mode == ClientMode::Cli {
            return Ok(());
        }
        let shared_secret_node = role == Role::Node
            && matches!(method, Some(AuthMethod::Token) | Some(AuthMethod::Password));
        if shared_secret_node {
            return Ok(());
        }
        Err(Rejection::auth("device identity required"))
    }

    async fn issue_grant(
        &self,
        device_id: &str,
        role: Role,
        scopes: &BTreeSet<String>,
    ) -> Result<AuthGrant, Rejection> {
        let token = self
            .state
            .tokens
            .ensure_token(device_id, role, scopes)
            .await
            .map_err(|e| {
                warn!("Token store failure: {}", e);
                Rejection::unavailable("token store unavailable")
            })?;
        Ok(AuthGrant {
            device_token: token.token,
            role,
            scopes: scopes.iter().cloned().collect(),
            issued_at_ms: token.rotated_at_ms.unwrap_or(token.created_at_ms),
        })
    }
}

fn client_meta(req: &ConnectRequest, mode: ClientMode) -> ClientMeta {
    ClientMeta {
        display_name: req.client.display_name.clone().unwrap_or_default(),
        platform: req.client.platform.clone(),
        client_id: req.client.id.clone(),
        client_mode: mode.to_string(),
    }
}

/// Operator-facing failure description: auth mode, what was supplied, and
/// the specific reason.
fn describe_auth_failure(req: &ConnectRequest, reason: &Option<String>) -> String {
    let supplied = match req.auth.as_ref() {
        Some(auth) => {
            let mut parts = Vec::new();
            if auth.token.is_some() {
                parts.push("token");
            }
            if auth.password.is_some() {
                parts.push("password");
            }
            if parts.is_empty() {
                "nothing".to_string()
            } else {
                parts.join("+")
            }
        }
        None => "nothing".to_string(),
    };
    let device = if req.device.is_some() {
        ", device signature"
    } else {
        ""
    };
    format!(
        "authentication failed (supplied: {supplied}{device}): {}",
        reason.as_deref().unwrap_or("unauthorized")
    )
}
