//! Presence table for authorized connections
//!
//! One row per connected client, keyed by instance id (falling back to the
//! connection id). A monotonically increasing version is bumped on every
//! change so subscribers can detect staleness with a single compare.

use gatehouse_core::protocol::PresenceEntry;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct PresenceInner {
    entries: HashMap<String, PresenceEntry>,
    version: u64,
}

/// Shared presence registry.
#[derive(Default)]
pub struct PresenceTable {
    inner: RwLock<PresenceInner>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update an entry; returns the bumped version.
    pub async fn upsert(&self, entry: PresenceEntry) -> u64 {
        let mut inner = self.inner.write().await;
        inner.entries.insert(entry.key.clone(), entry);
        inner.version += 1;
        inner.version
    }

    /// Remove an entry when its connection closes; bumps the version if the
    /// key was present.
    pub async fn remove(&self, key: &str) -> u64 {
        let mut inner = self.inner.write().await;
        if inner.entries.remove(key).is_some() {
            inner.version += 1;
        }
        inner.version
    }

    /// Stable snapshot of all entries plus the current version.
    pub async fn snapshot(&self) -> (Vec<PresenceEntry>, u64) {
        let inner = self.inner.read().await;
        let mut entries: Vec<PresenceEntry> = inner.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        (entries, inner.version)
    }

    pub async fn version(&self) -> u64 {
        self.inner.read().await.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::protocol::ClientMode;
    use std::collections::BTreeSet;

    fn entry(key: &str) -> PresenceEntry {
        PresenceEntry {
            key: key.to_string(),
            display_name: key.to_string(),
            ip: None,
            platform: None,
            mode: ClientMode::Cli,
            device_id: None,
            roles: BTreeSet::new(),
            scopes: BTreeSet::new(),
            instance_id: None,
            last_seen_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_version_is_monotonic() {
        let table = PresenceTable::new();
        let v1 = table.upsert(entry("a")).await;
        let v2 = table.upsert(entry("b")).await;
        let v3 = table.upsert(entry("a")).await; // update, not insert
        assert!(v1 < v2 && v2 < v3);

        let (entries, version) = table.snapshot().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(version, v3);
    }

    #[tokio::test]
    async fn test_remove_bumps_only_when_present() {
        let table = PresenceTable::new();
        let v1 = table.upsert(entry("a")).await;
        let v2 = table.remove("a").await;
        assert!(v2 > v1);
        let v3 = table.remove("a").await;
        assert_eq!(v2, v3);
    }
}
