use std::sync::Arc;
use std::time::Duration;

use relay_core::SystemClock;
use relay_runtime::{
    BotProfile, CreateInstanceRequest, InMemoryBot, InMemoryListener, InstanceLifecycleManager,
    RelayCorrelator, RelayError, RelayProbe, StaticIdentities, SyncOrchestrator,
};
use relay_store::{InstanceStore, SqliteInstanceStore};
use relay_types::{CommandCategory, InstanceId, InstanceStatus};
use tempfile::TempDir;

const MASTER: &str = "MasterLookupBot";

const MASTER_HELP: &str = "\
Budi Santoso
ID: 7555202218
EXPIRED: 29 Jun 2026 22:0:20
STATUS: ACTIVE

/help - Tampilkan menu bantuan
/quota - Cek sisa kuota
/location {phone_number}
/locimei {imei} 💎";

struct Deployment {
    _workspace: TempDir,
    store: Arc<SqliteInstanceStore>,
    listener: Arc<InMemoryListener>,
    facade: Arc<InMemoryBot>,
    correlator: Arc<RelayCorrelator>,
    lifecycle: InstanceLifecycleManager,
    sync: SyncOrchestrator,
}

impl Deployment {
    fn new() -> Self {
        let workspace = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(
            SqliteInstanceStore::new(workspace.path().join("relay.sqlite")).expect("store"),
        );
        let listener = Arc::new(InMemoryListener::new());
        let facade = Arc::new(InMemoryBot::new(BotProfile {
            id: 42,
            username: Some("facade_lookup_bot".to_string()),
            display_name: "Facade Lookup".to_string(),
        }));
        let identities = Arc::new(
            StaticIdentities::new()
                .with_listener("listener-session", listener.clone())
                .with_bot("facade-token", facade.clone()),
        );
        let clock = Arc::new(SystemClock);
        let correlator = Arc::new(RelayCorrelator::new(
            store.clone(),
            identities.clone(),
            clock.clone(),
        ));
        let probe = Arc::new(
            RelayProbe::new(correlator.clone()).with_timeout(Duration::from_secs(5)),
        );
        Self {
            lifecycle: InstanceLifecycleManager::new(store.clone(), clock.clone()),
            sync: SyncOrchestrator::new(store.clone(), probe, identities, clock),
            _workspace: workspace,
            store,
            listener,
            facade,
            correlator,
        }
    }

    async fn create(&self, quota: u32) -> InstanceId {
        self.lifecycle
            .create(
                CreateInstanceRequest::new(
                    "owner-1",
                    "lookup",
                    "facade-token",
                    "listener-session",
                    MASTER,
                )
                .with_quota(quota),
            )
            .await
            .expect("create")
            .instance_id
    }

    /// Answers `/help` with the catalog text and echoes everything else.
    fn start_master(&self) {
        let mut outbound = self.listener.outbound();
        let listener = self.listener.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                let reply = if message.text == "/help" {
                    MASTER_HELP.to_string()
                } else {
                    format!("hasil {}", message.text)
                };
                listener.deliver(MASTER, &reply);
            }
        });
    }

    async fn quota_used(&self, instance_id: &InstanceId) -> u32 {
        self.store
            .find_by_id(instance_id)
            .await
            .expect("find")
            .expect("instance")
            .quota_used
    }
}

#[tokio::test(start_paused = true)]
async fn silent_master_leaves_quota_untouched_after_timeouts() {
    let deployment = Deployment::new();
    let instance_id = deployment.create(2).await;

    for user in ["1001", "1002"] {
        let error = deployment
            .correlator
            .handle_user_command(&instance_id, "/quota", user, Duration::from_secs(5))
            .await
            .expect_err("master is silent");
        assert!(matches!(error, RelayError::Timeout(_)));
    }

    assert_eq!(deployment.quota_used(&instance_id).await, 0);
    let notices = deployment.facade.sent();
    assert_eq!(notices.len(), 2);
    assert!(notices
        .iter()
        .all(|notice| notice.text.contains("did not respond in time")));
    assert_eq!(deployment.listener.active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn relays_consume_quota_until_exhausted() {
    let deployment = Deployment::new();
    let instance_id = deployment.create(2).await;
    deployment.start_master();

    for (user, command) in [("1001", "/location 08123"), ("1002", "/locimei 3569")] {
        let reply = deployment
            .correlator
            .relay(&instance_id, command, user, Duration::from_secs(5))
            .await
            .expect("relay");
        assert_eq!(reply, format!("hasil {command}"));
    }
    let error = deployment
        .correlator
        .relay(&instance_id, "/quota", "1003", Duration::from_secs(5))
        .await
        .expect_err("quota exhausted");
    assert!(matches!(error, RelayError::QuotaExceeded(_)));

    assert_eq!(deployment.quota_used(&instance_id).await, 2);
    assert_eq!(deployment.listener.sent().len(), 2);
    let delivered: Vec<_> = deployment
        .facade
        .sent()
        .into_iter()
        .map(|message| message.target)
        .collect();
    assert_eq!(delivered, vec!["1001", "1002"]);
}

#[tokio::test(start_paused = true)]
async fn sync_through_master_conversation_persists_catalog() {
    let deployment = Deployment::new();
    let instance_id = deployment.create(10).await;
    deployment.start_master();

    let report = deployment.sync.sync(&instance_id).await.expect("sync");
    assert_eq!(report.entries_found, 4);
    let status = report.status.expect("status block");
    assert_eq!(status.reported_name, "Budi Santoso");
    assert_eq!(status.expiry_text, "29 Jun 2026 22:0:20");

    let commands = deployment
        .store
        .list_commands(&instance_id)
        .await
        .expect("commands");
    let parametric: Vec<_> = commands
        .iter()
        .filter(|entry| entry.category == CommandCategory::Parametric)
        .map(|entry| entry.usage_template.clone().unwrap_or_default())
        .collect();
    assert_eq!(parametric, vec!["/location {phone_number}", "/locimei {imei}"]);
    assert!(commands
        .iter()
        .any(|entry| entry.token == "/locimei" && entry.premium));

    // Probing charges no quota.
    assert_eq!(deployment.quota_used(&instance_id).await, 0);

    let menu = deployment
        .sync
        .publish_command_menu(&instance_id)
        .await
        .expect("publish");
    assert_eq!(deployment.facade.menu(), menu);

    deployment
        .lifecycle
        .suspend(&instance_id)
        .await
        .expect("suspend");
    let error = deployment
        .correlator
        .relay(&instance_id, "/help", "1001", Duration::from_secs(5))
        .await
        .expect_err("suspended");
    assert!(matches!(
        error,
        RelayError::InstanceUnavailable {
            status: Some(InstanceStatus::Suspended),
            ..
        }
    ));
}
