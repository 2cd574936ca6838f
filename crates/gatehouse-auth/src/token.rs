//! Per-device bearer tokens
//!
//! A token is bound to a `(device, role)` pair and lets a previously paired
//! device reconnect without re-presenting the shared secret. Tokens are
//! persisted as issued so `ensure_token` can hand the same bearer value back
//! on every successful handshake. Storage follows devices.json:
//! JSON file under the state directory, loaded on open, written on mutation.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use gatehouse_core::protocol::Role;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Token store errors
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No token issued for {0}")]
    NotFound(String),
    #[error("Configuration directory not found")]
    NoConfigDir,
}

pub type TokenResult<T> = Result<T, TokenError>;

/// Why a presented token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenRejection {
    #[error("no token issued for this device and role")]
    NotFound,
    #[error("token has been revoked")]
    Revoked,
    #[error("token does not match")]
    TokenMismatch,
    #[error("role does not match the issued token")]
    RoleMismatch,
    #[error("requested scopes exceed the granted scopes")]
    ScopeNotGranted,
}

impl TokenRejection {
    /// Stable wire/reason slug
    pub fn as_reason(&self) -> &'static str {
        match self {
            TokenRejection::NotFound => "device-token-not-found",
            TokenRejection::Revoked => "device-token-revoked",
            TokenRejection::TokenMismatch => "device-token-mismatch",
            TokenRejection::RoleMismatch => "device-token-role-mismatch",
            TokenRejection::ScopeNotGranted => "device-token-scope-not-granted",
        }
    }
}

/// A minted bearer token for one `(device, role)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceToken {
    pub device_id: String,
    pub role: Role,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    pub token: String,
    pub created_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_at_ms: Option<i64>,
    #[serde(default)]
    pub revoked: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredTokens {
    /// Tokens indexed by `"{device_id}:{role}"`
    tokens: HashMap<String, DeviceToken>,
}

fn token_key(device_id: &str, role: Role) -> String {
    format!("{device_id}:{role}")
}

/// Generate a secure random bearer token
fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    BASE64.encode(bytes)
}

/// Token store with file persistence.
pub struct DeviceTokenStore {
    path: PathBuf,
    data: Arc<RwLock<StoredTokens>>,
}

impl DeviceTokenStore {
    /// Open the store at its default location
    /// (`<config dir>/gatehouse/device_tokens.json`).
    pub async fn new() -> TokenResult<Self> {
        let config_dir = dirs::config_dir().ok_or(TokenError::NoConfigDir)?;
        Self::with_path(config_dir.join("gatehouse").join("device_tokens.json")).await
    }

    /// Open the store at a specific path, loading existing data if present.
    pub async fn with_path(path: PathBuf) -> TokenResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str(&contents) {
                Ok(data) => {
                    info!("Loaded device tokens from {:?}", path);
                    data
                }
                Err(e) => {
                    warn!("Failed to parse token store, starting fresh: {}", e);
                    StoredTokens::default()
                }
            }
        } else {
            debug!("No existing token store, creating new");
            StoredTokens::default()
        };

        Ok(Self {
            path,
            data: Arc::new(RwLock::new(data)),
        })
    }

    async fn save(&self) -> TokenResult<()> {
        let data = self.data.read().await;
        let json = serde_json::to_string_pretty(&*data)?;
        std::fs::write(&self.path, json)?;
        debug!("Saved device tokens to {:?}", self.path);
        Ok(())
    }

    /// Return the existing token for `(device_id, role)` or mint one.
    ///
    /// Idempotent: reconnecting devices get the same bearer value back. The
    /// granted scope set is overwritten with `scopes` each time; a revoked
    /// record is replaced by a freshly minted token (re-issuing after an
    /// explicit revoke requires going back through pairing, which is the
    /// only caller of this path).
    pub async fn ensure_token(
        &self,
        device_id: &str,
        role: Role,
        scopes: &BTreeSet<String>,
    ) -> TokenResult<DeviceToken> {
        let key = token_key(device_id, role);
        let token = {
            let mut data = self.data.write().await;
            match data.tokens.entry(key) {
                Entry::Occupied(mut occupied) if !occupied.get().revoked => {
                    occupied.get_mut().scopes = scopes.clone();
                    occupied.get().clone()
                }
                entry => {
                    let minted = DeviceToken {
                        device_id: device_id.to_string(),
                        role,
                        scopes: scopes.clone(),
                        token: generate_token(),
                        created_at_ms: Utc::now().timestamp_millis(),
                        rotated_at_ms: None,
                        revoked: false,
                    };
                    match entry {
                        Entry::Occupied(mut occupied) => {
                            occupied.insert(minted.clone());
                        }
                        Entry::Vacant(vacant) => {
                            vacant.insert(minted.clone());
                        }
                    }
                    info!("Minted device token for {} as {}", device_id, role);
                    minted
                }
            }
        };
        self.save().await?;
        Ok(token)
    }

    /// Verify a presented bearer token.
    ///
    /// Fails if revoked, if the role does not match an issued token, or if
    /// the requested scopes are not a subset of the granted scopes.
    pub async fn verify(
        &self,
        device_id: &str,
        token: &str,
        role: Role,
        scopes: &BTreeSet<String>,
    ) -> Result<DeviceToken, TokenRejection> {
        let data = self.data.read().await;
        let Some(record) = data.tokens.get(&token_key(device_id, role)) else {
            // Distinguish "wrong role" from "never issued" for operator feedback.
            let other_role = data
                .tokens
                .values()
                .any(|t| t.device_id == device_id && t.token == token);
            return Err(if other_role {
                TokenRejection::RoleMismatch
            } else {
                TokenRejection::NotFound
            });
        };
        if record.revoked {
            return Err(TokenRejection::Revoked);
        }
        if record.token != token {
            return Err(TokenRejection::TokenMismatch);
        }
        if !scopes.is_subset(&record.scopes) {
            return Err(TokenRejection::ScopeNotGranted);
        }
        Ok(record.clone())
    }

    /// Replace the bearer value for `(device_id, role)`.
    pub async fn rotate(&self, device_id: &str, role: Role) -> TokenResult<DeviceToken> {
        let key = token_key(device_id, role);
        let rotated = {
            let mut data = self.data.write().await;
            let record = data
                .tokens
                .get_mut(&key)
                .ok_or_else(|| TokenError::NotFound(key.clone()))?;
            record.token = generate_token();
            record.rotated_at_ms = Some(Utc::now().timestamp_millis());
            record.clone()
        };
        self.save().await?;
        info!("Rotated device token for {} as {}", device_id, role);
        Ok(rotated)
    }

    /// Revoke immediately; subsequent `verify` calls fail with a reason
    /// distinct from not-found.
    pub async fn revoke(&self, device_id: &str, role: Role) -> TokenResult<()> {
        let key = token_key(device_id, role);
        {
            let mut data = self.data.write().await;
            let record = data
                .tokens
                .get_mut(&key)
                .ok_or_else(|| TokenError::NotFound(key.clone()))?;
            record.revoked = true;
        }
        self.save().await?;
        info!("Revoked device token for {} as {}", device_id, role);
        Ok(())
    }

    /// Revoke every role's token for a device (device unpairing).
    pub async fn revoke_all(&self, device_id: &str) -> TokenResult<usize> {
        let revoked = {
            let mut data = self.data.write().await;
            let mut count = 0;
            for record in data.tokens.values_mut() {
                if record.device_id == device_id && !record.revoked {
                    record.revoked = true;
                    count += 1;
                }
            }
            count
        };
        if revoked > 0 {
            self.save().await?;
            info!("Revoked {} token(s) for device {}", revoked, device_id);
        }
        Ok(revoked)
    }

    /// List all issued tokens
    pub async fn list(&self) -> Vec<DeviceToken> {
        let data = self.data.read().await;
        data.tokens.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_store() -> (DeviceTokenStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = DeviceTokenStore::with_path(dir.path().join("tokens.json"))
            .await
            .unwrap();
        (store, dir)
    }

    fn scopes(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let (store, _dir) = test_store().await;
        let first = store
            .ensure_token("d1", Role::Operator, &scopes(&["admin"]))
            .await
            .unwrap();
        let second = store
            .ensure_token("d1", Role::Operator, &scopes(&["admin", "write"]))
            .await
            .unwrap();
        assert_eq!(first.token, second.token);
        // Scope update is an overwrite, not a new token.
        assert_eq!(second.scopes, scopes(&["admin", "write"]));
    }

    #[tokio::test]
    async fn test_roles_get_distinct_tokens() {
        let (store, _dir) = test_store().await;
        let op = store.ensure_token("d1", Role::Operator, &scopes(&[])).await.unwrap();
        let node = store.ensure_token("d1", Role::Node, &scopes(&[])).await.unwrap();
        assert_ne!(op.token, node.token);
    }

    #[tokio::test]
    async fn test_verify_checks_scopes_and_role() {
        let (store, _dir) = test_store().await;
        let minted = store
            .ensure_token("d1", Role::Operator, &scopes(&["admin"]))
            .await
            .unwrap();

        assert!(store
            .verify("d1", &minted.token, Role::Operator, &scopes(&["admin"]))
            .await
            .is_ok());
        assert!(store
            .verify("d1", &minted.token, Role::Operator, &scopes(&[]))
            .await
            .is_ok());
        assert_eq!(
            store
                .verify("d1", &minted.token, Role::Operator, &scopes(&["admin", "extra"]))
                .await
                .unwrap_err(),
            TokenRejection::ScopeNotGranted
        );
        assert_eq!(
            store
                .verify("d1", &minted.token, Role::Node, &scopes(&[]))
                .await
                .unwrap_err(),
            TokenRejection::RoleMismatch
        );
        assert_eq!(
            store
                .verify("d1", "wrong", Role::Operator, &scopes(&[]))
                .await
                .unwrap_err(),
            TokenRejection::TokenMismatch
        );
        assert_eq!(
            store
                .verify("other", "wrong", Role::Operator, &scopes(&[]))
                .await
                .unwrap_err(),
            TokenRejection::NotFound
        );
    }

    #[tokio::test]
    async fn test_revoked_is_distinct_from_not_found() {
        let (store, _dir) = test_store().await;
        let minted = store
            .ensure_token("d1", Role::Operator, &scopes(&[]))
            .await
            .unwrap();
        store.revoke("d1", Role::Operator).await.unwrap();
        assert_eq!(
            store
                .verify("d1", &minted.token, Role::Operator, &scopes(&[]))
                .await
                .unwrap_err(),
            TokenRejection::Revoked
        );
    }

    #[tokio::test]
    async fn test_rotate_replaces_bearer_value() {
        let (store, _dir) = test_store().await;
        let minted = store
            .ensure_token("d1", Role::Operator, &scopes(&[]))
            .await
            .unwrap();
        let rotated = store.rotate("d1", Role::Operator).await.unwrap();
        assert_ne!(minted.token, rotated.token);
        assert!(rotated.rotated_at_ms.is_some());
        assert!(store
            .verify("d1", &minted.token, Role::Operator, &scopes(&[]))
            .await
            .is_err());
        assert!(store
            .verify("d1", &rotated.token, Role::Operator, &scopes(&[]))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let token;
        {
            let store = DeviceTokenStore::with_path(path.clone()).await.unwrap();
            token = store
                .ensure_token("d1", Role::Node, &scopes(&["exec"]))
                .await
                .unwrap()
                .token;
        }
        let store = DeviceTokenStore::with_path(path).await.unwrap();
        assert!(store
            .verify("d1", &token, Role::Node, &scopes(&["exec"]))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_legacy_record_without_scopes_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(
            &path,
            r#"{"tokens": {"d1:operator": {"deviceId": "d1", "role": "operator", "token": "t", "createdAtMs": 1}}}"#,
        )
        .unwrap();
        let store = DeviceTokenStore::with_path(path).await.unwrap();
        let record = store.verify("d1", "t", Role::Operator, &scopes(&[])).await.unwrap();
        assert!(record.scopes.is_empty());
    }
}
