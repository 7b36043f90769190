//! Instance store abstractions and in-memory backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_types::{
    CommandEntry, FacadeInstance, InstanceId, InstanceStatus, MasterStatusSnapshot,
    UnknownVariantError,
};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;

pub use sqlite::SqliteInstanceStore;

/// Result type for instance store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("instance '{0}' not found")]
    InstanceNotFound(InstanceId),
    #[error("instance '{0}' already exists")]
    InstanceAlreadyExists(InstanceId),
    #[error("quota exhausted for instance '{instance_id}' ({used}/{limit})")]
    QuotaExceeded {
        instance_id: InstanceId,
        used: u32,
        limit: u32,
    },
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    UnknownVariant(#[from] UnknownVariantError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True for backend I/O or consistency failures, as opposed to domain
    /// outcomes such as not-found or quota exhaustion. Callers decide whether
    /// to retry these.
    pub fn is_storage_failure(&self) -> bool {
        !matches!(
            self,
            Self::InstanceNotFound(_) | Self::InstanceAlreadyExists(_) | Self::QuotaExceeded { .. }
        )
    }
}

/// Async store contract shared by the relay, sync and lifecycle components.
///
/// Instances are returned exactly as persisted; status is re-evaluated by the
/// caller at read time.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn insert_instance(&self, instance: FacadeInstance) -> StoreResult<()>;
    async fn find_by_id(&self, instance_id: &InstanceId) -> StoreResult<Option<FacadeInstance>>;
    async fn find_by_owner(&self, owner_id: &str) -> StoreResult<Vec<FacadeInstance>>;
    async fn list_instances(&self) -> StoreResult<Vec<FacadeInstance>>;
    async fn update_instance_state(
        &self,
        instance_id: &InstanceId,
        active: bool,
        status: InstanceStatus,
    ) -> StoreResult<()>;

    /// Atomically increments `quota_used`, returning the new value.
    ///
    /// Fails with [`StoreError::QuotaExceeded`] when the counter already sits
    /// at the limit; the counter is left untouched in that case.
    async fn increment_quota(&self, instance_id: &InstanceId) -> StoreResult<u32>;

    /// Replaces the full catalog of an instance in one transaction.
    ///
    /// Existing entries are deleted before `entries` are inserted, the status
    /// snapshot is replaced when given, and `last_sync` is set to `synced_at`.
    async fn replace_catalog(
        &self,
        instance_id: &InstanceId,
        entries: Vec<CommandEntry>,
        status: Option<MasterStatusSnapshot>,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn list_commands(&self, instance_id: &InstanceId) -> StoreResult<Vec<CommandEntry>>;
    async fn get_status_snapshot(
        &self,
        instance_id: &InstanceId,
    ) -> StoreResult<Option<MasterStatusSnapshot>>;
}

/// In-memory implementation for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    instances: HashMap<InstanceId, FacadeInstance>,
    commands: HashMap<InstanceId, Vec<CommandEntry>>,
    snapshots: HashMap<InstanceId, MasterStatusSnapshot>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_creation(mut instances: Vec<FacadeInstance>) -> Vec<FacadeInstance> {
    instances.sort_by(|left, right| {
        left.created_at
            .cmp(&right.created_at)
            .then_with(|| left.instance_id.cmp(&right.instance_id))
    });
    instances
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn insert_instance(&self, instance: FacadeInstance) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.instances.contains_key(&instance.instance_id) {
            return Err(StoreError::InstanceAlreadyExists(instance.instance_id));
        }
        inner
            .instances
            .insert(instance.instance_id.clone(), instance);
        Ok(())
    }

    async fn find_by_id(&self, instance_id: &InstanceId) -> StoreResult<Option<FacadeInstance>> {
        Ok(self.inner.read().await.instances.get(instance_id).cloned())
    }

    async fn find_by_owner(&self, owner_id: &str) -> StoreResult<Vec<FacadeInstance>> {
        let inner = self.inner.read().await;
        Ok(sorted_by_creation(
            inner
                .instances
                .values()
                .filter(|instance| instance.owner_id == owner_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_instances(&self) -> StoreResult<Vec<FacadeInstance>> {
        let inner = self.inner.read().await;
        Ok(sorted_by_creation(
            inner.instances.values().cloned().collect(),
        ))
    }

    async fn update_instance_state(
        &self,
        instance_id: &InstanceId,
        active: bool,
        status: InstanceStatus,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let instance = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.clone()))?;
        instance.active = active;
        instance.status = status;
        Ok(())
    }

    async fn increment_quota(&self, instance_id: &InstanceId) -> StoreResult<u32> {
        let mut inner = self.inner.write().await;
        let instance = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.clone()))?;
        if !instance.has_quota() {
            return Err(StoreError::QuotaExceeded {
                instance_id: instance_id.clone(),
                used: instance.quota_used,
                limit: instance.quota_limit,
            });
        }
        instance.quota_used += 1;
        Ok(instance.quota_used)
    }

    async fn replace_catalog(
        &self,
        instance_id: &InstanceId,
        entries: Vec<CommandEntry>,
        status: Option<MasterStatusSnapshot>,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let instance = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.clone()))?;
        instance.last_sync = Some(synced_at);
        inner.commands.insert(instance_id.clone(), entries);
        if let Some(snapshot) = status {
            inner.snapshots.insert(instance_id.clone(), snapshot);
        }
        Ok(())
    }

    async fn list_commands(&self, instance_id: &InstanceId) -> StoreResult<Vec<CommandEntry>> {
        Ok(self
            .inner
            .read()
            .await
            .commands
            .get(instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_status_snapshot(
        &self,
        instance_id: &InstanceId,
    ) -> StoreResult<Option<MasterStatusSnapshot>> {
        Ok(self.inner.read().await.snapshots.get(instance_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use relay_types::{CommandCategory, FacadeInstance};
    use std::sync::Arc;

    pub(crate) fn sample_instance(id: &str, owner: &str, quota_limit: u32) -> FacadeInstance {
        FacadeInstance::new(
            InstanceId::new(id),
            format!("{id}-name"),
            format!("{id}-facade"),
            "master-session",
            "MasterBot",
            owner,
            quota_limit,
            24,
            Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap(),
        )
    }

    pub(crate) fn sample_entry(id: &str, token: &str, category: CommandCategory) -> CommandEntry {
        CommandEntry {
            instance_id: InstanceId::new(id),
            token: token.to_string(),
            description: format!("{token} description"),
            usage_template: None,
            category,
            premium: false,
            last_seen: Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn concurrent_increments_stop_at_limit() {
        let store = Arc::new(InMemoryInstanceStore::new());
        store
            .insert_instance(sample_instance("i-1", "owner", 5))
            .await
            .expect("insert");

        let mut handles = Vec::new();
        for _ in 0..12 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.increment_quota(&InstanceId::new("i-1")).await
            }));
        }
        let mut succeeded = 0;
        let mut refused = 0;
        for handle in handles {
            match handle.await.expect("join") {
                Ok(_) => succeeded += 1,
                Err(StoreError::QuotaExceeded { .. }) => refused += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((succeeded, refused), (5, 7));
        let stored = store
            .find_by_id(&InstanceId::new("i-1"))
            .await
            .expect("find")
            .expect("instance");
        assert_eq!(stored.quota_used, 5);
    }

    #[tokio::test]
    async fn replace_catalog_is_idempotent() {
        let store = InMemoryInstanceStore::new();
        store
            .insert_instance(sample_instance("i-1", "owner", 5))
            .await
            .expect("insert");
        let entries = vec![
            sample_entry("i-1", "/help", CommandCategory::General),
            sample_entry("i-1", "/location", CommandCategory::Parametric),
        ];
        let synced_at = Utc.with_ymd_and_hms(2026, 5, 2, 0, 0, 0).unwrap();
        for _ in 0..2 {
            store
                .replace_catalog(&InstanceId::new("i-1"), entries.clone(), None, synced_at)
                .await
                .expect("replace");
        }
        let stored = store
            .list_commands(&InstanceId::new("i-1"))
            .await
            .expect("list");
        assert_eq!(stored, entries);
        let instance = store
            .find_by_id(&InstanceId::new("i-1"))
            .await
            .expect("find")
            .expect("instance");
        assert_eq!(instance.last_sync, Some(synced_at));
    }

    #[tokio::test]
    async fn missing_instance_is_reported_not_fatal() {
        let store = InMemoryInstanceStore::new();
        let error = store
            .increment_quota(&InstanceId::new("ghost"))
            .await
            .expect_err("missing instance");
        assert!(matches!(error, StoreError::InstanceNotFound(_)));
        assert!(!error.is_storage_failure());
        assert!(store
            .find_by_id(&InstanceId::new("ghost"))
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn find_by_owner_filters_and_orders() {
        let store = InMemoryInstanceStore::new();
        for (id, owner) in [("b", "alice"), ("a", "alice"), ("c", "bob")] {
            store
                .insert_instance(sample_instance(id, owner, 3))
                .await
                .expect("insert");
        }
        let owned = store.find_by_owner("alice").await.expect("by owner");
        let ids: Vec<_> = owned.iter().map(|i| i.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(matches!(
            store.insert_instance(sample_instance("a", "alice", 3)).await,
            Err(StoreError::InstanceAlreadyExists(_))
        ));
    }
}
