//! Façade instance creation, status evaluation and administrative state changes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_core::Clock;
use relay_store::{InstanceStore, StoreError};
use relay_types::{
    FacadeInstance, InstanceId, InstanceStatus, DEFAULT_DURATION_HOURS, DEFAULT_QUOTA_LIMIT,
};
use thiserror::Error;

/// Longest lifetime accepted for a new instance (100 years).
pub const MAX_DURATION_HOURS: u32 = 24 * 365 * 100;

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid instance request: {0}")]
    InvalidRequest(String),
    #[error("instance '{0}' was not found")]
    InstanceNotFound(InstanceId),
    #[error("instance '{0}' has expired")]
    Expired(InstanceId),
    #[error(transparent)]
    Storage(StoreError),
}

impl From<StoreError> for LifecycleError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::InstanceNotFound(instance_id) => Self::InstanceNotFound(instance_id),
            other => Self::Storage(other),
        }
    }
}

/// Parameters for a new façade instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateInstanceRequest {
    pub owner_id: String,
    pub name: String,
    pub facade_cred: String,
    pub master_cred: String,
    pub master_peer: String,
    pub quota_limit: u32,
    pub duration_hours: u32,
}

impl CreateInstanceRequest {
    /// Builds a request with the default quota and lifetime.
    pub fn new(
        owner_id: impl Into<String>,
        name: impl Into<String>,
        facade_cred: impl Into<String>,
        master_cred: impl Into<String>,
        master_peer: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            name: name.into(),
            facade_cred: facade_cred.into(),
            master_cred: master_cred.into(),
            master_peer: master_peer.into(),
            quota_limit: DEFAULT_QUOTA_LIMIT,
            duration_hours: DEFAULT_DURATION_HOURS,
        }
    }

    pub fn with_quota(mut self, quota_limit: u32) -> Self {
        self.quota_limit = quota_limit;
        self
    }

    pub fn with_duration_hours(mut self, duration_hours: u32) -> Self {
        self.duration_hours = duration_hours;
        self
    }

    fn validate(&self) -> LifecycleResult<()> {
        let required = [
            ("owner_id", &self.owner_id),
            ("name", &self.name),
            ("facade_cred", &self.facade_cred),
            ("master_cred", &self.master_cred),
            ("master_peer", &self.master_peer),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(LifecycleError::InvalidRequest(format!(
                "{field} must not be empty"
            )));
        }
        if self.quota_limit == 0 {
            return Err(LifecycleError::InvalidRequest(
                "quota_limit must be greater than 0".to_string(),
            ));
        }
        if self.duration_hours > MAX_DURATION_HOURS {
            return Err(LifecycleError::InvalidRequest(format!(
                "duration_hours must not exceed {MAX_DURATION_HOURS}"
            )));
        }
        Ok(())
    }
}

/// Status of `instance` at `now`: expired once `now` reaches `expires_at`,
/// otherwise suspended when inactive, otherwise active.
pub fn evaluate_status(instance: &FacadeInstance, now: DateTime<Utc>) -> InstanceStatus {
    instance.status_at(now)
}

/// Creates instances and applies administrative state changes.
///
/// Every instance returned by this manager carries a status evaluated against
/// the manager's clock at read time.
pub struct InstanceLifecycleManager {
    store: Arc<dyn InstanceStore>,
    clock: Arc<dyn Clock>,
}

impl InstanceLifecycleManager {
    pub fn new(store: Arc<dyn InstanceStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    #[tracing::instrument(name = "relay.lifecycle.create", skip_all, fields(owner_id = %request.owner_id))]
    pub async fn create(&self, request: CreateInstanceRequest) -> LifecycleResult<FacadeInstance> {
        request.validate()?;
        let now = self.clock.now();
        let instance = FacadeInstance::new(
            InstanceId::generate(),
            request.name,
            request.facade_cred,
            request.master_cred,
            request.master_peer,
            request.owner_id,
            request.quota_limit,
            request.duration_hours,
            now,
        )
        .evaluated_at(now);
        self.store.insert_instance(instance.clone()).await?;
        tracing::debug!(
            instance_id = %instance.instance_id,
            expires_at = %instance.expires_at,
            "instance created"
        );
        Ok(instance)
    }

    pub async fn get(&self, instance_id: &InstanceId) -> LifecycleResult<FacadeInstance> {
        let instance = self
            .store
            .find_by_id(instance_id)
            .await?
            .ok_or_else(|| LifecycleError::InstanceNotFound(instance_id.clone()))?;
        Ok(instance.evaluated_at(self.clock.now()))
    }

    pub async fn list_for_owner(&self, owner_id: &str) -> LifecycleResult<Vec<FacadeInstance>> {
        let now = self.clock.now();
        Ok(self
            .store
            .find_by_owner(owner_id)
            .await?
            .into_iter()
            .map(|instance| instance.evaluated_at(now))
            .collect())
    }

    pub async fn list_all(&self) -> LifecycleResult<Vec<FacadeInstance>> {
        let now = self.clock.now();
        Ok(self
            .store
            .list_instances()
            .await?
            .into_iter()
            .map(|instance| instance.evaluated_at(now))
            .collect())
    }

    /// Stops relaying for an instance until it is resumed.
    #[tracing::instrument(name = "relay.lifecycle.suspend", skip_all, fields(instance_id = %instance_id))]
    pub async fn suspend(&self, instance_id: &InstanceId) -> LifecycleResult<FacadeInstance> {
        self.set_active(instance_id, false).await
    }

    /// Re-activates a suspended instance. Expired instances stay expired.
    #[tracing::instrument(name = "relay.lifecycle.resume", skip_all, fields(instance_id = %instance_id))]
    pub async fn resume(&self, instance_id: &InstanceId) -> LifecycleResult<FacadeInstance> {
        self.set_active(instance_id, true).await
    }

    async fn set_active(
        &self,
        instance_id: &InstanceId,
        active: bool,
    ) -> LifecycleResult<FacadeInstance> {
        let mut instance = self.get(instance_id).await?;
        if instance.status == InstanceStatus::Expired {
            return Err(LifecycleError::Expired(instance_id.clone()));
        }
        let status = if active {
            InstanceStatus::Active
        } else {
            InstanceStatus::Suspended
        };
        self.store
            .update_instance_state(instance_id, active, status)
            .await?;
        tracing::debug!(status = %status, "instance state changed");
        instance.active = active;
        instance.status = status;
        Ok(instance)
    }

    /// Persists the expired status of every instance whose stored state is
    /// stale at `now`, returning the ids that changed.
    #[tracing::instrument(name = "relay.lifecycle.sweep", skip_all)]
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> LifecycleResult<Vec<InstanceId>> {
        let mut swept = Vec::new();
        for instance in self.store.list_instances().await? {
            let stale = instance.status != InstanceStatus::Expired || instance.active;
            if stale && evaluate_status(&instance, now) == InstanceStatus::Expired {
                self.store
                    .update_instance_state(&instance.instance_id, false, InstanceStatus::Expired)
                    .await?;
                swept.push(instance.instance_id);
            }
        }
        if !swept.is_empty() {
            tracing::debug!(count = swept.len(), "expired instances swept");
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use relay_core::ManualClock;
    use relay_store::InMemoryInstanceStore;

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T08:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn manager() -> (
        InstanceLifecycleManager,
        Arc<InMemoryInstanceStore>,
        Arc<ManualClock>,
    ) {
        let store = Arc::new(InMemoryInstanceStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        (
            InstanceLifecycleManager::new(store.clone(), clock.clone()),
            store,
            clock,
        )
    }

    fn request() -> CreateInstanceRequest {
        CreateInstanceRequest::new("owner-1", "demo", "facade-token", "master-cred", "MasterBot")
    }

    #[tokio::test]
    async fn create_applies_defaults_and_persists() {
        let (manager, store, _clock) = manager();
        let instance = manager.create(request()).await.expect("create");

        assert_eq!(instance.quota_limit, DEFAULT_QUOTA_LIMIT);
        assert_eq!(instance.quota_used, 0);
        assert_eq!(instance.duration_hours, DEFAULT_DURATION_HOURS);
        assert_eq!(instance.expires_at, start() + Duration::hours(24));
        assert_eq!(instance.status, InstanceStatus::Active);
        let stored = store
            .find_by_id(&instance.instance_id)
            .await
            .expect("find")
            .expect("stored");
        assert_eq!(stored, instance);
    }

    #[tokio::test]
    async fn zero_duration_is_expired_immediately() {
        let (manager, _store, _clock) = manager();
        let instance = manager
            .create(request().with_duration_hours(0))
            .await
            .expect("create");
        assert_eq!(instance.status, InstanceStatus::Expired);
        assert!(!instance.active);
        assert_eq!(evaluate_status(&instance, start()), InstanceStatus::Expired);
    }

    #[tokio::test]
    async fn create_rejects_empty_fields_and_zero_quota() {
        let (manager, _store, _clock) = manager();
        let mut blank_peer = request();
        blank_peer.master_peer = "  ".to_string();
        let error = manager.create(blank_peer).await.expect_err("blank peer");
        assert!(matches!(error, LifecycleError::InvalidRequest(message) if message.contains("master_peer")));

        let error = manager
            .create(request().with_quota(0))
            .await
            .expect_err("zero quota");
        assert!(matches!(error, LifecycleError::InvalidRequest(_)));
        let error = manager
            .create(request().with_duration_hours(MAX_DURATION_HOURS + 1))
            .await
            .expect_err("duration too long");
        assert!(matches!(error, LifecycleError::InvalidRequest(_)));
        assert!(manager.list_all().await.expect("list").is_empty());
    }

    #[test]
    fn evaluate_status_prefers_expired_over_suspended() {
        let mut instance = FacadeInstance::new(
            InstanceId::new("inst-1"),
            "demo",
            "facade-token",
            "master-cred",
            "MasterBot",
            "owner-1",
            10,
            2,
            start(),
        );
        assert_eq!(evaluate_status(&instance, start()), InstanceStatus::Active);
        instance.active = false;
        assert_eq!(evaluate_status(&instance, start()), InstanceStatus::Suspended);
        assert_eq!(
            evaluate_status(&instance, start() + Duration::hours(2)),
            InstanceStatus::Expired
        );
    }

    #[tokio::test]
    async fn reads_reevaluate_status_against_clock() {
        let (manager, _store, clock) = manager();
        let instance = manager
            .create(request().with_duration_hours(1))
            .await
            .expect("create");
        assert_eq!(
            manager.get(&instance.instance_id).await.expect("get").status,
            InstanceStatus::Active
        );

        clock.advance(Duration::hours(1));
        let listed = manager.list_for_owner("owner-1").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, InstanceStatus::Expired);
        assert!(!listed[0].active);
        assert!(manager
            .list_for_owner("someone-else")
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn suspend_and_resume_toggle_active_flag() {
        let (manager, store, _clock) = manager();
        let instance = manager.create(request()).await.expect("create");

        let suspended = manager.suspend(&instance.instance_id).await.expect("suspend");
        assert_eq!(suspended.status, InstanceStatus::Suspended);
        let stored = store
            .find_by_id(&instance.instance_id)
            .await
            .expect("find")
            .expect("stored");
        assert!(!stored.active);

        let resumed = manager.resume(&instance.instance_id).await.expect("resume");
        assert_eq!(resumed.status, InstanceStatus::Active);
        assert!(resumed.active);
    }

    #[tokio::test]
    async fn resume_refuses_expired_and_missing_instances() {
        let (manager, _store, clock) = manager();
        let instance = manager
            .create(request().with_duration_hours(1))
            .await
            .expect("create");
        clock.advance(Duration::hours(3));

        let error = manager
            .resume(&instance.instance_id)
            .await
            .expect_err("expired");
        assert!(matches!(error, LifecycleError::Expired(_)));
        let error = manager
            .suspend(&InstanceId::new("missing"))
            .await
            .expect_err("missing");
        assert!(matches!(error, LifecycleError::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn sweep_marks_stale_instances_expired_once() {
        let (manager, store, _clock) = manager();
        let short = manager
            .create(request().with_duration_hours(1))
            .await
            .expect("create short");
        let long = manager
            .create(request().with_duration_hours(48))
            .await
            .expect("create long");

        let later = start() + Duration::hours(2);
        let swept = manager.sweep_expired(later).await.expect("sweep");
        assert_eq!(swept, vec![short.instance_id.clone()]);
        let stored = store
            .find_by_id(&short.instance_id)
            .await
            .expect("find")
            .expect("stored");
        assert_eq!(stored.status, InstanceStatus::Expired);
        assert!(!stored.active);
        let untouched = store
            .find_by_id(&long.instance_id)
            .await
            .expect("find")
            .expect("stored");
        assert_eq!(untouched.status, InstanceStatus::Active);

        assert!(manager.sweep_expired(later).await.expect("sweep").is_empty());
    }
}
