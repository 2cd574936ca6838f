//! Audit trail for privilege changes and handshake decisions
//!
//! Every pairing approval, denial, upgrade request, and handshake rejection
//! lands here with enough context to reconstruct the decision later. Entries
//! are mirrored to `tracing` on a dedicated target and kept in a bounded
//! in-memory ring for inspection over the admin API.

use chrono::Utc;
use gatehouse_core::protocol::Role;
use serde::Serialize;
use std::collections::BTreeSet;
use tokio::sync::RwLock;
use tracing::info;

const MAX_ENTRIES: usize = 1024;

/// One structured audit record.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub at_ms: i64,
    /// e.g. "scope-upgrade", "approved", "auto-approved-local", "handshake-rejected"
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles_from: Option<BTreeSet<Role>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles_to: Option<BTreeSet<Role>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes_from: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes_to: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            at_ms: Utc::now().timestamp_millis(),
            kind: kind.into(),
            ..Self::default()
        }
    }
}

/// Bounded in-memory audit log.
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub async fn record(&self, entry: AuditEntry) {
        info!(
            target: "gatehouse::audit",
            kind = %entry.kind,
            device_id = entry.device_id.as_deref().unwrap_or("-"),
            remote_ip = entry.remote_ip.as_deref().unwrap_or("-"),
            auth_method = entry.auth_method.as_deref().unwrap_or("-"),
            client_id = entry.client_id.as_deref().unwrap_or("-"),
            detail = entry.detail.as_deref().unwrap_or(""),
            "audit"
        );
        let mut entries = self.entries.write().await;
        entries.push(entry);
        let len = entries.len();
        if len > MAX_ENTRIES {
            entries.drain(..len - MAX_ENTRIES);
        }
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    /// Entries of a given kind, oldest first
    pub async fn of_kind(&self, kind: &str) -> Vec<AuditEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_filter() {
        let log = AuditLog::new();
        log.record(AuditEntry {
            device_id: Some("d1".into()),
            ..AuditEntry::new("scope-upgrade")
        })
        .await;
        log.record(AuditEntry::new("approved")).await;

        assert_eq!(log.entries().await.len(), 2);
        let upgrades = log.of_kind("scope-upgrade").await;
        assert_eq!(upgrades.len(), 1);
        assert_eq!(upgrades[0].device_id.as_deref(), Some("d1"));
    }

    #[tokio::test]
    async fn test_ring_is_bounded() {
        let log = AuditLog::new();
        for i in 0..(MAX_ENTRIES + 10) {
            log.record(AuditEntry::new(format!("k{i}"))).await;
        }
        assert_eq!(log.entries().await.len(), MAX_ENTRIES);
    }
}
