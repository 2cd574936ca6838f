//! Credential resolution: one verdict from two independent auth factors
//!
//! Shared-secret auth (token or password against the configured value) is
//! evaluated first, then the same token is re-tried as a device token when a
//! verified device identity accompanies it. Both factors are gated by the
//! rate limiter under separate scopes; a success on either factor wins, and
//! a lockout on either relevant scope is surfaced over plain credential
//! failures so clients know to back off.

use crate::ratelimit::{AuthRateLimiter, AuthScope};
use crate::token::DeviceTokenStore;
use gatehouse_core::protocol::{Role, SharedAuth};
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Which credential authenticated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    Token,
    Password,
    DeviceToken,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Token => "token",
            AuthMethod::Password => "password",
            AuthMethod::DeviceToken => "device-token",
        }
    }
}

/// The single verdict produced per connect attempt. Never persisted.
#[derive(Debug, Clone)]
pub struct AuthVerdict {
    pub ok: bool,
    pub method: Option<AuthMethod>,
    pub reason: Option<String>,
    pub rate_limited: bool,
    pub retry_after_ms: Option<i64>,
}

impl AuthVerdict {
    fn passed(method: Option<AuthMethod>) -> Self {
        Self {
            ok: true,
            method,
            reason: None,
            rate_limited: false,
            retry_after_ms: None,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            method: None,
            reason: Some(reason.into()),
            rate_limited: false,
            retry_after_ms: None,
        }
    }

    fn locked_out(retry_after_ms: i64) -> Self {
        Self {
            ok: false,
            method: None,
            reason: Some("rate-limited".into()),
            rate_limited: true,
            retry_after_ms: Some(retry_after_ms),
        }
    }
}

/// One factor's intermediate outcome.
enum FactorOutcome {
    NotAttempted,
    Passed(AuthMethod),
    Failed(String),
    Locked(i64),
}

/// Inputs to one resolution.
pub struct AuthAttempt<'a> {
    pub shared: Option<&'a SharedAuth>,
    /// Device id whose recomputation from the presented public key matched;
    /// required for the device-token factor.
    pub verified_device_id: Option<&'a str>,
    pub role: Role,
    pub scopes: &'a BTreeSet<String>,
    pub ip: IpAddr,
}

/// Orchestrates shared-secret and device-token checks into one verdict.
pub struct AuthResolver {
    shared_secret: Option<String>,
    limiter: Arc<AuthRateLimiter>,
    tokens: Arc<DeviceTokenStore>,
}

impl AuthResolver {
    pub fn new(
        shared_secret: Option<String>,
        limiter: Arc<AuthRateLimiter>,
        tokens: Arc<DeviceTokenStore>,
    ) -> Self {
        Self {
            shared_secret,
            limiter,
            tokens,
        }
    }

    pub async fn resolve(&self, attempt: &AuthAttempt<'_>) -> AuthVerdict {
        let shared = self.resolve_shared_secret(attempt).await;
        if let FactorOutcome::Passed(method) = shared {
            return AuthVerdict::passed(Some(method));
        }

        let device = self.resolve_device_token(attempt).await;
        if let FactorOutcome::Passed(method) = device {
            return AuthVerdict::passed(Some(method));
        }

        // Neither factor succeeded. A lockout on any relevant scope takes
        // priority over credential failures so the client backs off instead
        // of burning more attempts.
        let mut retry_after = None;
        for outcome in [&shared, &device] {
            if let FactorOutcome::Locked(ms) = outcome {
                retry_after = Some(retry_after.map_or(*ms, |cur: i64| cur.max(*ms)));
            }
        }
        if let Some(ms) = retry_after {
            return AuthVerdict::locked_out(ms);
        }

        match (shared, device) {
            // Device-token failures are more specific than a secret mismatch.
            (_, FactorOutcome::Failed(reason)) => AuthVerdict::failed(reason),
            (FactorOutcome::Failed(reason), _) => AuthVerdict::failed(reason),
            _ => {
                if self.shared_secret.is_some() {
                    AuthVerdict::failed("credentials-required")
                } else {
                    // No secret configured: the gateway runs open. Device
                    // identity requirements still apply downstream.
                    debug!("No shared secret configured; open-auth verdict");
                    AuthVerdict::passed(None)
                }
            }
        }
    }

    async fn resolve_shared_secret(&self, attempt: &AuthAttempt<'_>) -> FactorOutcome {
        let Some(secret) = self.shared_secret.as_deref() else {
            return FactorOutcome::NotAttempted;
        };
        let Some(shared) = attempt.shared else {
            return FactorOutcome::NotAttempted;
        };
        let (supplied, method) = match (&shared.token, &shared.password) {
            (Some(token), _) => (token.as_str(), AuthMethod::Token),
            (None, Some(password)) => (password.as_str(), AuthMethod::Password),
            (None, None) => return FactorOutcome::NotAttempted,
        };

        let decision = self.limiter.check(attempt.ip, AuthScope::SharedSecret).await;
        if !decision.allowed {
            return FactorOutcome::Locked(decision.retry_after_ms.unwrap_or(0));
        }

        if supplied == secret {
            self.limiter.reset(attempt.ip, AuthScope::SharedSecret).await;
            FactorOutcome::Passed(method)
        } else {
            self.limiter
                .record_failure(attempt.ip, AuthScope::SharedSecret)
                .await;
            FactorOutcome::Failed("shared-secret-mismatch".into())
        }
    }

    async fn resolve_device_token(&self, attempt: &AuthAttempt<'_>) -> FactorOutcome {
        let Some(device_id) = attempt.verified_device_id else {
            return FactorOutcome::NotAttempted;
        };
        let Some(token) = attempt.shared.and_then(|s| s.token.as_deref()) else {
            return FactorOutcome::NotAttempted;
        };

        let decision = self.limiter.check(attempt.ip, AuthScope::DeviceToken).await;
        if !decision.allowed {
            return FactorOutcome::Locked(decision.retry_after_ms.unwrap_or(0));
        }

        match self
            .tokens
            .verify(device_id, token, attempt.role, attempt.scopes)
            .await
        {
            Ok(_) => {
                self.limiter.reset(attempt.ip, AuthScope::DeviceToken).await;
                FactorOutcome::Passed(AuthMethod::DeviceToken)
            }
            Err(rejection) => {
                self.limiter
                    .record_failure(attempt.ip, AuthScope::DeviceToken)
                    .await;
                FactorOutcome::Failed(rejection.as_reason().into())
            }
        }
    }
}
