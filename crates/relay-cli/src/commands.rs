use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use relay_core::{Clock, SystemClock};
use relay_runtime::{
    BotMenuProbe, CreateInstanceRequest, IdentityResolver, InstanceLifecycleManager,
    RelayCorrelator, SyncOrchestrator,
};
use relay_store::{InstanceStore, SqliteInstanceStore};
use relay_telegram::{
    FacadePoller, FacadePollerConfig, PollCycleReport, TelegramClientConfig, TelegramIdentities,
};
use relay_types::{InstanceId, InstanceStatus};
use serde_json::json;

use crate::cli_args::{Cli, RelayCommand, ServeArgs};
use crate::render::{
    render_catalog, render_instance, render_instance_list, render_menu, render_poll_report,
    render_sync_report,
};

/// Components wired for one CLI invocation.
pub(crate) struct RelayApp {
    store: Arc<dyn InstanceStore>,
    identities: Arc<TelegramIdentities>,
    clock: Arc<dyn Clock>,
    lifecycle: InstanceLifecycleManager,
    sync: SyncOrchestrator,
    correlator: Arc<RelayCorrelator>,
}

impl RelayApp {
    pub(crate) fn new(
        store: Arc<dyn InstanceStore>,
        identities: Arc<TelegramIdentities>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let resolver: Arc<dyn IdentityResolver> = identities.clone();
        let probe = Arc::new(BotMenuProbe::new(resolver.clone()));
        Self {
            lifecycle: InstanceLifecycleManager::new(store.clone(), clock.clone()),
            sync: SyncOrchestrator::new(store.clone(), probe, resolver.clone(), clock.clone()),
            correlator: Arc::new(RelayCorrelator::new(store.clone(), resolver, clock.clone())),
            store,
            identities,
            clock,
        }
    }

    pub(crate) fn from_cli(cli: &Cli) -> Result<Self> {
        tracing::debug!(db_path = %cli.db_path.display(), "opening relay database");
        let store = SqliteInstanceStore::new(&cli.db_path).with_context(|| {
            format!("failed to open relay database {}", cli.db_path.display())
        })?;
        let config = TelegramClientConfig {
            api_base: cli.telegram_api_base.clone(),
            request_timeout_ms: cli.request_timeout_ms,
            retry_max_attempts: usize::try_from(cli.request_retry_max_attempts)
                .unwrap_or(usize::MAX),
            ..TelegramClientConfig::default()
        };
        Ok(Self::new(
            Arc::new(store),
            Arc::new(TelegramIdentities::new(config)),
            Arc::new(SystemClock),
        ))
    }

    /// Executes `command` and returns the text to print.
    pub(crate) async fn execute(&self, command: RelayCommand, as_json: bool) -> Result<String> {
        match command {
            RelayCommand::CreateInstance(args) => {
                let request = CreateInstanceRequest::new(
                    args.owner,
                    args.name,
                    args.facade_token,
                    args.master_cred,
                    args.master_peer,
                )
                .with_quota(args.quota)
                .with_duration_hours(args.duration_hours);
                let instance = self.lifecycle.create(request).await?;
                if as_json {
                    return Ok(json!({
                        "instance_id": instance.instance_id,
                        "status": instance.status,
                        "expires_at": instance.expires_at,
                    })
                    .to_string());
                }
                Ok(format!("created {}", render_instance(&instance)))
            }
            RelayCommand::ListInstances { owner } => {
                let instances = match owner {
                    Some(owner) => self.lifecycle.list_for_owner(&owner).await?,
                    None => self.lifecycle.list_all().await?,
                };
                if as_json {
                    return Ok(serde_json::to_string_pretty(&redacted(&instances))?);
                }
                Ok(render_instance_list(&instances))
            }
            RelayCommand::Sync { instance_id } => {
                let instance_id = InstanceId::new(instance_id);
                let report = self
                    .sync
                    .sync(&instance_id)
                    .await
                    .with_context(|| format!("sync failed for instance {instance_id}"))?;
                if as_json {
                    return Ok(json!({
                        "instance_id": report.instance_id,
                        "entries_found": report.entries_found,
                        "general_commands": report.general_commands,
                        "parametric_commands": report.parametric_commands,
                        "status": report.status,
                        "synced_at": report.synced_at,
                    })
                    .to_string());
                }
                Ok(render_sync_report(&report))
            }
            RelayCommand::ShowCommands { instance_id } => {
                let instance_id = InstanceId::new(instance_id);
                // Fails for unknown ids instead of showing an empty catalog.
                self.lifecycle.get(&instance_id).await?;
                let entries = self.store.list_commands(&instance_id).await?;
                let status = self.store.get_status_snapshot(&instance_id).await?;
                if as_json {
                    return Ok(serde_json::to_string_pretty(
                        &json!({ "commands": entries, "status": status }),
                    )?);
                }
                Ok(render_catalog(&entries, status.as_ref()))
            }
            RelayCommand::PublishMenu { instance_id } => {
                let instance_id = InstanceId::new(instance_id);
                let menu = self
                    .sync
                    .publish_command_menu(&instance_id)
                    .await
                    .with_context(|| format!("menu publish failed for instance {instance_id}"))?;
                if as_json {
                    return Ok(serde_json::to_string_pretty(&menu)?);
                }
                Ok(render_menu(&menu))
            }
            RelayCommand::Suspend { instance_id } => {
                let instance = self.lifecycle.suspend(&InstanceId::new(instance_id)).await?;
                Ok(format!("suspended {}", render_instance(&instance)))
            }
            RelayCommand::Resume { instance_id } => {
                let instance = self.lifecycle.resume(&InstanceId::new(instance_id)).await?;
                Ok(format!("resumed {}", render_instance(&instance)))
            }
            RelayCommand::Serve(args) => {
                let instance_id = InstanceId::new(args.instance_id.clone());
                let shutdown = async {
                    if let Err(error) = tokio::signal::ctrl_c().await {
                        tracing::warn!(error = %error, "failed to listen for ctrl-c");
                        std::future::pending::<()>().await;
                    }
                };
                let report = self.serve(&args, shutdown).await?;
                if as_json {
                    return Ok(json!({
                        "instance_id": instance_id,
                        "cycles": report.cycles,
                        "updates": report.updates,
                        "relayed": report.relayed,
                        "failed": report.failed,
                        "ignored": report.ignored,
                    })
                    .to_string());
                }
                Ok(render_poll_report(&instance_id, &report))
            }
            RelayCommand::Sweep => {
                let swept = self.lifecycle.sweep_expired(self.clock.now()).await?;
                if as_json {
                    return Ok(json!({ "expired": swept }).to_string());
                }
                if swept.is_empty() {
                    return Ok("no instances expired".to_string());
                }
                let ids: Vec<String> = swept.iter().map(ToString::to_string).collect();
                Ok(format!("expired {} instance(s): {}", ids.len(), ids.join(", ")))
            }
        }
    }
}

impl RelayApp {
    /// Polls the instance's façade bot and relays user commands until
    /// `shutdown` resolves or the cycle limit is reached.
    pub(crate) async fn serve<F>(&self, args: &ServeArgs, shutdown: F) -> Result<PollCycleReport>
    where
        F: Future<Output = ()>,
    {
        let instance_id = InstanceId::new(args.instance_id.clone());
        let instance = self.lifecycle.get(&instance_id).await?;
        if instance.status != InstanceStatus::Active {
            bail!("instance {instance_id} is {}; only active instances can be served", instance.status);
        }
        self.identities
            .listener(&instance.master_cred)
            .with_context(|| {
                format!("no listener session is registered for instance {instance_id}")
            })?;
        let client = self
            .identities
            .bot_client(&instance.facade_cred)
            .with_context(|| format!("invalid façade bot token for instance {instance_id}"))?;

        let mut poller = FacadePoller::new(
            client,
            self.correlator.clone(),
            instance_id.clone(),
            FacadePollerConfig {
                long_poll_secs: args.long_poll_secs,
                relay_timeout: Duration::from_millis(args.relay_timeout_ms),
                ..FacadePollerConfig::default()
            },
        );
        tracing::debug!(instance_id = %instance_id, "serving façade bot");
        Ok(poller.run(shutdown, args.max_cycles).await)
    }
}

/// Instance records without credential fields.
fn redacted(instances: &[relay_types::FacadeInstance]) -> Vec<serde_json::Value> {
    instances
        .iter()
        .map(|instance| {
            json!({
                "instance_id": instance.instance_id,
                "name": instance.name,
                "owner_id": instance.owner_id,
                "master_peer": instance.master_peer,
                "quota_limit": instance.quota_limit,
                "quota_used": instance.quota_used,
                "expires_at": instance.expires_at,
                "status": instance.status,
                "last_sync": instance.last_sync,
            })
        })
        .collect()
}

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let app = RelayApp::from_cli(&cli)?;
    let output = app.execute(cli.command, cli.json).await?;
    println!("{output}");
    Ok(())
}
