//! Device pairing: durable trust records and the approval workflow
//!
//! A paired record binds a device identity (public key) to the roles and
//! scopes a human has approved for it. Anything a device requests beyond its
//! current grant becomes a pending pairing request that must be approved
//! out-of-band; the one exception is first contact over loopback, which is
//! approved silently so local onboarding is frictionless.

use crate::audit::{AuditEntry, AuditLog};
use chrono::Utc;
use gatehouse_core::protocol::Role;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pairing errors
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Pairing request not found: {0}")]
    RequestNotFound(String),
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Configuration directory not found")]
    NoConfigDir,
}

pub type PairingResult<T> = Result<T, PairingError>;

/// Durable record of an approved device.
///
/// `roles` and `scopes` only ever grow here; shrinking a grant is an
/// explicit administrative action (record removal + re-pairing).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDeviceRecord {
    pub device_id: String,
    pub public_key: String,
    #[serde(default)]
    pub roles: BTreeSet<Role>,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_mode: String,
    #[serde(default)]
    pub remote_ip: String,
    #[serde(default)]
    pub paired_at_ms: i64,
    #[serde(default)]
    pub last_connected_at_ms: i64,
}

/// A request awaiting human approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPairingRequest {
    pub request_id: String,
    pub device_id: String,
    pub public_key: String,
    pub requested_roles: BTreeSet<Role>,
    pub requested_scopes: BTreeSet<String>,
    pub remote_ip: String,
    pub created_at_ms: i64,
    /// Local first-contact requests are approved without surfacing a prompt
    pub silent: bool,
}

/// Mutable client metadata refreshed on every successful handshake.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub display_name: String,
    pub platform: String,
    pub client_id: String,
    pub client_mode: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredPairings {
    /// Paired devices indexed by device id
    devices: HashMap<String, PairedDeviceRecord>,
}

/// Trust store: paired devices (persisted) and pending requests (in-memory).
///
/// Pending requests die with the process; an unapproved device simply
/// re-creates its request on the next connect.
pub struct PairingStore {
    path: PathBuf,
    data: Arc<RwLock<StoredPairings>>,
    pending: RwLock<HashMap<String, PendingPairingRequest>>,
    /// request ids already approved/denied, for idempotent re-approval
    resolved: RwLock<HashMap<String, String>>,
}

impl PairingStore {
    /// Open the store at its default location
    /// (`<config dir>/gatehouse/paired_devices.json`).
    pub async fn new() -> PairingResult<Self> {
        let config_dir = dirs::config_dir().ok_or(PairingError::NoConfigDir)?;
        Self::with_path(config_dir.join("gatehouse").join("paired_devices.json")).await
    }

    /// Open the store at a specific path, loading existing records.
    pub async fn with_path(path: PathBuf) -> PairingResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str(&contents) {
                Ok(data) => {
                    info!("Loaded paired devices from {:?}", path);
                    data
                }
                Err(e) => {
                    warn!("Failed to parse pairing store, starting fresh: {}", e);
                    StoredPairings::default()
                }
            }
        } else {
            debug!("No existing pairing store, creating new");
            StoredPairings::default()
        };

        Ok(Self {
            path,
            data: Arc::new(RwLock::new(data)),
            pending: RwLock::new(HashMap::new()),
            resolved: RwLock::new(HashMap::new()),
        })
    }

    async fn save(&self) -> PairingResult<()> {
        let data = self.data.read().await;
        let json = serde_json::to_string_pretty(&*data)?;
        std::fs::write(&self.path, json)?;
        debug!("Saved paired devices to {:?}", self.path);
        Ok(())
    }

    /// Get a paired record by device id
    pub async fn get(&self, device_id: &str) -> Option<PairedDeviceRecord> {
        let data = self.data.read().await;
        data.devices.get(device_id).cloned()
    }

    /// List all paired devices
    pub async fn list(&self) -> Vec<PairedDeviceRecord> {
        let data = self.data.read().await;
        data.devices.values().cloned().collect()
    }

    /// Remove a paired device (administrative unpair)
    pub async fn remove(&self, device_id: &str) -> PairingResult<PairedDeviceRecord> {
        let removed = {
            let mut data = self.data.write().await;
            data.devices
                .remove(device_id)
                .ok_or_else(|| PairingError::DeviceNotFound(device_id.to_string()))?
        };
        self.save().await?;
        info!("Removed paired device {}", device_id);
        Ok(removed)
    }

    /// Refresh mutable metadata on a successful reconnect.
    pub async fn touch(
        &self,
        device_id: &str,
        meta: &ClientMeta,
        remote_ip: &str,
    ) -> PairingResult<()> {
        {
            let mut data = self.data.write().await;
            let record = data
                .devices
                .get_mut(device_id)
                .ok_or_else(|| PairingError::DeviceNotFound(device_id.to_string()))?;
            if !meta.display_name.is_empty() {
                record.display_name = meta.display_name.clone();
            }
            if !meta.platform.is_empty() {
                record.platform = meta.platform.clone();
            }
            record.client_id = meta.client_id.clone();
            record.client_mode = meta.client_mode.clone();
            record.remote_ip = remote_ip.to_string();
            record.last_connected_at_ms = Utc::now().timestamp_millis();
        }
        self.save().await
    }

    /// List pending requests
    pub async fn pending(&self) -> Vec<PendingPairingRequest> {
        self.pending.read().await.values().cloned().collect()
    }

    /// Get one pending request
    pub async fn pending_by_id(&self, request_id: &str) -> Option<PendingPairingRequest> {
        self.pending.read().await.get(request_id).cloned()
    }

    /// Create a pending request, or merge into the existing one for the same
    /// device. Two concurrent handshakes for one unpaired device converge on
    /// a single request because the union happens under the write lock.
    pub async fn merge_pending(
        &self,
        device_id: &str,
        public_key: &str,
        roles: &BTreeSet<Role>,
        scopes: &BTreeSet<String>,
        remote_ip: &str,
        silent: bool,
    ) -> PendingPairingRequest {
        let mut pending = self.pending.write().await;
        if let Some(existing) = pending.values_mut().find(|p| p.device_id == device_id) {
            existing.requested_roles.extend(roles.iter().copied());
            existing
                .requested_scopes
                .extend(scopes.iter().cloned());
            existing.remote_ip = remote_ip.to_string();
            // A pending request only turns silent if it was born silent.
            existing.silent = existing.silent && silent;
            return existing.clone();
        }
        let request = PendingPairingRequest {
            request_id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            public_key: public_key.to_string(),
            requested_roles: roles.clone(),
            requested_scopes: scopes.clone(),
            remote_ip: remote_ip.to_string(),
            created_at_ms: Utc::now().timestamp_millis(),
            silent,
        };
        pending.insert(request.request_id.clone(), request.clone());
        request
    }

    /// Remove a request and all sibling requests for the same device.
    /// Returns the matched request plus the siblings, or None if the id is
    /// unknown (possibly already resolved).
    async fn take_request_group(
        &self,
        request_id: &str,
    ) -> Option<Vec<PendingPairingRequest>> {
        let mut pending = self.pending.write().await;
        let head = pending.remove(request_id)?;
        let sibling_ids: Vec<String> = pending
            .values()
            .filter(|p| p.device_id == head.device_id)
            .map(|p| p.request_id.clone())
            .collect();
        let mut group = vec![head];
        for id in sibling_ids {
            if let Some(sibling) = pending.remove(&id) {
                group.push(sibling);
            }
        }
        Some(group)
    }

    async fn mark_resolved(&self, group: &[PendingPairingRequest]) {
        let mut resolved = self.resolved.write().await;
        for request in group {
            resolved.insert(request.request_id.clone(), request.device_id.clone());
        }
    }

    async fn resolved_device(&self, request_id: &str) -> Option<String> {
        self.resolved.read().await.get(request_id).cloned()
    }
}

/// Outcome of reconciling an authenticated device against the trust store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Device holds everything it asked for
    Authorized,
    /// A pending request gates the connection
    PairingRequired { request_id: String },
}

/// Drives the pairing workflow: detects missing or insufficient pairing,
/// collapses concurrent requests, applies approvals, and audits every
/// privilege change.
pub struct PairingCoordinator {
    store: Arc<PairingStore>,
    audit: Arc<AuditLog>,
}

impl PairingCoordinator {
    pub fn new(store: Arc<PairingStore>, audit: Arc<AuditLog>) -> Self {
        Self { store, audit }
    }

    pub fn store(&self) -> &Arc<PairingStore> {
        &self.store
    }

    /// Reconcile an authenticated device against its paired record.
    #[allow(clippy::too_many_arguments)]
    pub async fn reconcile(
        &self,
        device_id: &str,
        public_key: &str,
        role: Role,
        scopes: &BTreeSet<String>,
        remote_ip: &str,
        meta: &ClientMeta,
        is_local: bool,
        auth_method: Option<&str>,
    ) -> PairingResult<ReconcileOutcome> {
        let requested_roles: BTreeSet<Role> = [role].into();

        let Some(record) = self.store.get(device_id).await else {
            // First contact.
            let request = self
                .store
                .merge_pending(device_id, public_key, &requested_roles, scopes, remote_ip, is_local)
                .await;
            if is_local && request.silent {
                // Frictionless local onboarding: approve on the spot.
                let record = self.apply_approval(&request.request_id, meta).await?;
                debug!("Silently approved local first contact for {}", record.device_id);
                return Ok(ReconcileOutcome::Authorized);
            }
            self.audit
                .record(AuditEntry {
                    device_id: Some(device_id.to_string()),
                    remote_ip: Some(remote_ip.to_string()),
                    auth_method: auth_method.map(str::to_string),
                    client_id: Some(meta.client_id.clone()),
                    roles_to: Some(request.requested_roles.clone()),
                    scopes_to: Some(request.requested_scopes.clone()),
                    ..AuditEntry::new("pairing-requested")
                })
                .await;
            return Ok(ReconcileOutcome::PairingRequired {
                request_id: request.request_id,
            });
        };

        let needs_role = !record.roles.contains(&role);
        let needs_scopes = !scopes.is_subset(&record.scopes);
        if needs_role || needs_scopes {
            // Privilege upgrade: audited, never silently approved, even locally.
            let kind = if needs_role { "role-upgrade" } else { "scope-upgrade" };
            let mut roles_to = record.roles.clone();
            roles_to.insert(role);
            let mut scopes_to = record.scopes.clone();
            scopes_to.extend(scopes.iter().cloned());
            self.audit
                .record(AuditEntry {
                    device_id: Some(device_id.to_string()),
                    remote_ip: Some(remote_ip.to_string()),
                    auth_method: auth_method.map(str::to_string),
                    client_id: Some(meta.client_id.clone()),
                    roles_from: Some(record.roles.clone()),
                    roles_to: Some(roles_to),
                    scopes_from: Some(record.scopes.clone()),
                    scopes_to: Some(scopes_to),
                    ..AuditEntry::new(kind)
                })
                .await;
            let request = self
                .store
                .merge_pending(device_id, public_key, &requested_roles, scopes, remote_ip, false)
                .await;
            return Ok(ReconcileOutcome::PairingRequired {
                request_id: request.request_id,
            });
        }

        self.store.touch(device_id, meta, remote_ip).await?;
        Ok(ReconcileOutcome::Authorized)
    }

    /// Approve a pending request: merges its roles/scopes into the paired
    /// record and resolves every other pending request for the same device.
    ///
    /// Idempotent: approving an already-resolved request returns the current
    /// record without duplicating anything.
    pub async fn approve(&self, request_id: &str) -> PairingResult<PairedDeviceRecord> {
        self.apply_approval(request_id, &ClientMeta::default()).await
    }

    async fn apply_approval(
        &self,
        request_id: &str,
        meta: &ClientMeta,
    ) -> PairingResult<PairedDeviceRecord> {
        let Some(group) = self.store.take_request_group(request_id).await else {
            // Possibly a duplicate approval; treat as a no-op if we resolved
            // this id before.
            if let Some(device_id) = self.store.resolved_device(request_id).await {
                if let Some(record) = self.store.get(&device_id).await {
                    return Ok(record);
                }
            }
            return Err(PairingError::RequestNotFound(request_id.to_string()));
        };

        let head = &group[0];
        let silent = head.silent;
        let now_ms = Utc::now().timestamp_millis();

        let (record, roles_from, scopes_from) = {
            let mut data = self.store.data.write().await;
            let record = data
                .devices
                .entry(head.device_id.clone())
                .or_insert_with(|| PairedDeviceRecord {
                    device_id: head.device_id.clone(),
                    public_key: head.public_key.clone(),
                    roles: BTreeSet::new(),
                    scopes: BTreeSet::new(),
                    display_name: meta.display_name.clone(),
                    platform: meta.platform.clone(),
                    client_id: meta.client_id.clone(),
                    client_mode: meta.client_mode.clone(),
                    remote_ip: head.remote_ip.clone(),
                    paired_at_ms: now_ms,
                    last_connected_at_ms: now_ms,
                });
            let roles_from = record.roles.clone();
            let scopes_from = record.scopes.clone();
            for request in &group {
                record.roles.extend(request.requested_roles.iter().copied());
                record
                    .scopes
                    .extend(request.requested_scopes.iter().cloned());
            }
            record.public_key = head.public_key.clone();
            record.last_connected_at_ms = now_ms;
            (record.clone(), roles_from, scopes_from)
        };
        self.store.save().await?;
        self.store.mark_resolved(&group).await;

        self.audit
            .record(AuditEntry {
                device_id: Some(record.device_id.clone()),
                remote_ip: Some(head.remote_ip.clone()),
                client_id: Some(record.client_id.clone()),
                roles_from: Some(roles_from),
                roles_to: Some(record.roles.clone()),
                scopes_from: Some(scopes_from),
                scopes_to: Some(record.scopes.clone()),
                ..AuditEntry::new(if silent { "auto-approved-local" } else { "approved" })
            })
            .await;
        info!(
            "Approved pairing for {} (roles: {:?})",
            record.device_id, record.roles
        );
        Ok(record)
    }

    /// Deny a pending request; drops the whole request group for the device.
    pub async fn deny(&self, request_id: &str) -> PairingResult<()> {
        let Some(group) = self.store.take_request_group(request_id).await else {
            if self.store.resolved_device(request_id).await.is_some() {
                return Ok(());
            }
            return Err(PairingError::RequestNotFound(request_id.to_string()));
        };
        self.store.mark_resolved(&group).await;
        let head = &group[0];
        self.audit
            .record(AuditEntry {
                device_id: Some(head.device_id.clone()),
                remote_ip: Some(head.remote_ip.clone()),
                roles_to: Some(head.requested_roles.clone()),
                scopes_to: Some(head.requested_scopes.clone()),
                ..AuditEntry::new("denied")
            })
            .await;
        info!("Denied pairing request {} for {}", request_id, head.device_id);
        Ok(())
    }
}
