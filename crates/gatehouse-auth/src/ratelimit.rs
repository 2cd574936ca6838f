//! Brute-force rate limiting for handshake credentials
//!
//! Buckets count failed attempts per `(client IP, auth-factor scope)` inside
//! a rolling window; exhausting the window locks that scope out for a
//! configured duration. The two factor scopes live in separate maps, so
//! hammering the shared secret can never lock out a client holding a valid
//! device token, and vice versa.

use chrono::Utc;
use gatehouse_core::config::RateLimitConfig;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::RwLock;
use tracing::warn;

/// Which auth factor an attempt counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthScope {
    SharedSecret,
    DeviceToken,
}

impl std::fmt::Display for AuthScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthScope::SharedSecret => write!(f, "shared-secret"),
            AuthScope::DeviceToken => write!(f, "device-token"),
        }
    }
}

/// Outcome of a rate-limit probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_ms: Option<i64>,
}

impl RateDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_ms: None,
        }
    }

    fn locked(retry_after_ms: i64) -> Self {
        Self {
            allowed: false,
            retry_after_ms: Some(retry_after_ms.max(1)),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Bucket {
    attempts: u32,
    window_start_ms: i64,
    locked_until_ms: Option<i64>,
}

/// Sliding-window attempt counter with lockout.
pub struct AuthRateLimiter {
    config: RateLimitConfig,
    // Independent maps per scope: lockout isolation is structural.
    shared_secret: RwLock<HashMap<IpAddr, Bucket>>,
    device_token: RwLock<HashMap<IpAddr, Bucket>>,
}

impl AuthRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            shared_secret: RwLock::new(HashMap::new()),
            device_token: RwLock::new(HashMap::new()),
        }
    }

    fn map(&self, scope: AuthScope) -> &RwLock<HashMap<IpAddr, Bucket>> {
        match scope {
            AuthScope::SharedSecret => &self.shared_secret,
            AuthScope::DeviceToken => &self.device_token,
        }
    }

    fn exempt(&self, ip: IpAddr) -> bool {
        self.config.exempt_loopback && ip.is_loopback()
    }

    /// Read-only probe: does not consume an attempt.
    pub async fn check(&self, ip: IpAddr, scope: AuthScope) -> RateDecision {
        self.check_at(ip, scope, Utc::now().timestamp_millis()).await
    }

    pub async fn check_at(&self, ip: IpAddr, scope: AuthScope, now_ms: i64) -> RateDecision {
        if self.exempt(ip) {
            return RateDecision::allowed();
        }
        let mut buckets = self.map(scope).write().await;
        let Some(bucket) = buckets.get_mut(&ip) else {
            return RateDecision::allowed();
        };
        if let Some(until) = bucket.locked_until_ms {
            if now_ms < until {
                return RateDecision::locked(until - now_ms);
            }
            // Lockout elapsed, the bucket resets.
            buckets.remove(&ip);
        }
        RateDecision::allowed()
    }

    /// Count one failed attempt; locks the scope out once the window budget
    /// is exceeded.
    pub async fn record_failure(&self, ip: IpAddr, scope: AuthScope) {
        self.record_failure_at(ip, scope, Utc::now().timestamp_millis())
            .await;
    }

    pub async fn record_failure_at(&self, ip: IpAddr, scope: AuthScope, now_ms: i64) {
        if self.exempt(ip) {
            return;
        }
        let mut buckets = self.map(scope).write().await;
        let bucket = buckets.entry(ip).or_insert_with(|| Bucket {
            attempts: 0,
            window_start_ms: now_ms,
            locked_until_ms: None,
        });
        if now_ms - bucket.window_start_ms > self.config.window_ms {
            bucket.attempts = 0;
            bucket.window_start_ms = now_ms;
        }
        bucket.attempts += 1;
        if bucket.attempts > self.config.max_attempts && bucket.locked_until_ms.is_none() {
            bucket.locked_until_ms = Some(now_ms + self.config.lockout_ms);
            warn!("Locked out {} for scope {} after {} failures", ip, scope, bucket.attempts);
        }
    }

    /// Clear the bucket after a legitimate success; the window does not have
    /// to expire first.
    pub async fn reset(&self, ip: IpAddr, scope: AuthScope) {
        let mut buckets = self.map(scope).write().await;
        buckets.remove(&ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RateLimitConfig {
        RateLimitConfig {
            max_attempts: 3,
            window_ms: 1_000,
            lockout_ms: 5_000,
            exempt_loopback: false,
        }
    }

    fn remote_ip() -> IpAddr {
        "203.0.113.9".parse().unwrap()
    }

    #[tokio::test]
    async fn test_allows_until_budget_exceeded() {
        let limiter = AuthRateLimiter::new(test_config());
        let ip = remote_ip();
        for _ in 0..3 {
            limiter.record_failure_at(ip, AuthScope::SharedSecret, 100).await;
            assert!(limiter.check_at(ip, AuthScope::SharedSecret, 100).await.allowed);
        }
        // One failure beyond max_attempts trips the lockout.
        limiter.record_failure_at(ip, AuthScope::SharedSecret, 100).await;
        let decision = limiter.check_at(ip, AuthScope::SharedSecret, 100).await;
        assert!(!decision.allowed);
        assert!(decision.retry_after_ms.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_lockout_expires_and_bucket_resets() {
        let limiter = AuthRateLimiter::new(test_config());
        let ip = remote_ip();
        for _ in 0..4 {
            limiter.record_failure_at(ip, AuthScope::SharedSecret, 100).await;
        }
        assert!(!limiter.check_at(ip, AuthScope::SharedSecret, 4_000).await.allowed);
        assert!(limiter.check_at(ip, AuthScope::SharedSecret, 5_200).await.allowed);
        // A single new failure does not re-trip immediately after reset.
        limiter.record_failure_at(ip, AuthScope::SharedSecret, 5_300).await;
        assert!(limiter.check_at(ip, AuthScope::SharedSecret, 5_300).await.allowed);
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let limiter = AuthRateLimiter::new(test_config());
        let ip = remote_ip();
        for _ in 0..10 {
            limiter.record_failure_at(ip, AuthScope::SharedSecret, 100).await;
        }
        assert!(!limiter.check_at(ip, AuthScope::SharedSecret, 100).await.allowed);
        assert!(limiter.check_at(ip, AuthScope::DeviceToken, 100).await.allowed);
    }

    #[tokio::test]
    async fn test_reset_clears_immediately() {
        let limiter = AuthRateLimiter::new(test_config());
        let ip = remote_ip();
        for _ in 0..4 {
            limiter.record_failure_at(ip, AuthScope::DeviceToken, 100).await;
        }
        assert!(!limiter.check_at(ip, AuthScope::DeviceToken, 100).await.allowed);
        limiter.reset(ip, AuthScope::DeviceToken).await;
        assert!(limiter.check_at(ip, AuthScope::DeviceToken, 100).await.allowed);
    }

    #[tokio::test]
    async fn test_window_rolls_over() {
        let limiter = AuthRateLimiter::new(test_config());
        let ip = remote_ip();
        for _ in 0..3 {
            limiter.record_failure_at(ip, AuthScope::SharedSecret, 100).await;
        }
        // Window expired: the next failure starts a fresh count.
        limiter.record_failure_at(ip, AuthScope::SharedSecret, 2_000).await;
        assert!(limiter.check_at(ip, AuthScope::SharedSecret, 2_000).await.allowed);
    }

    #[tokio::test]
    async fn test_loopback_exemption() {
        let mut config = test_config();
        config.exempt_loopback = true;
        let limiter = AuthRateLimiter::new(config);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..20 {
            limiter.record_failure_at(ip, AuthScope::SharedSecret, 100).await;
        }
        assert!(limiter.check_at(ip, AuthScope::SharedSecret, 100).await.allowed);
    }
}
