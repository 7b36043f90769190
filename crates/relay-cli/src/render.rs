//! Plain-text presentation of instances, catalogs and sync results.

use relay_runtime::SyncReport;
use relay_telegram::PollCycleReport;
use relay_types::{
    BotCommand, CommandCategory, CommandEntry, FacadeInstance, InstanceId, MasterStatusSnapshot,
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M UTC";

pub(crate) fn render_instance(instance: &FacadeInstance) -> String {
    let last_sync = instance
        .last_sync
        .map(|value| value.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_else(|| "never".to_string());
    format!(
        "{id} name={name} owner={owner} master={peer} status={status} quota={used}/{limit} expires={expires} last_sync={last_sync}",
        id = instance.instance_id,
        name = instance.name,
        owner = instance.owner_id,
        peer = instance.master_peer,
        status = instance.status,
        used = instance.quota_used,
        limit = instance.quota_limit,
        expires = instance.expires_at.format(TIMESTAMP_FORMAT),
    )
}

pub(crate) fn render_instance_list(instances: &[FacadeInstance]) -> String {
    if instances.is_empty() {
        return "no instances".to_string();
    }
    instances
        .iter()
        .map(render_instance)
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_entry(entry: &CommandEntry) -> String {
    let mut line = match (&entry.category, &entry.usage_template) {
        (CommandCategory::Parametric, Some(usage)) => format!("  {usage}"),
        _ => format!("  {}", entry.token),
    };
    if !entry.description.is_empty() {
        line.push_str(" - ");
        line.push_str(&entry.description);
    }
    if entry.premium {
        line.push_str(" [premium]");
    }
    line
}

/// Catalog grouped by category, followed by the master's status block.
pub(crate) fn render_catalog(
    entries: &[CommandEntry],
    status: Option<&MasterStatusSnapshot>,
) -> String {
    let mut sections = Vec::new();
    for category in [CommandCategory::General, CommandCategory::Parametric] {
        let lines: Vec<String> = entries
            .iter()
            .filter(|entry| entry.category == category)
            .map(render_entry)
            .collect();
        if !lines.is_empty() {
            sections.push(format!("{category} ({}):\n{}", lines.len(), lines.join("\n")));
        }
    }
    if sections.is_empty() {
        sections.push("no commands recorded".to_string());
    }
    if let Some(status) = status {
        sections.push(render_status(status));
    }
    sections.join("\n\n")
}

fn render_status(status: &MasterStatusSnapshot) -> String {
    let premium = if status.premium { " (premium)" } else { "" };
    format!(
        "master status{premium}:\n  name: {}\n  id: {}\n  expired: {}\n  status: {}",
        status.reported_name, status.reported_id, status.expiry_text, status.status_text
    )
}

pub(crate) fn render_sync_report(report: &SyncReport) -> String {
    let mut output = format!(
        "synced {} at {}: {} commands ({} general, {} parametric)",
        report.instance_id,
        report.synced_at.format(TIMESTAMP_FORMAT),
        report.entries_found,
        report.general_commands,
        report.parametric_commands
    );
    match &report.status {
        Some(status) => {
            output.push('\n');
            output.push_str(&render_status(status));
        }
        None => output.push_str("\nno status block reported"),
    }
    output
}

pub(crate) fn render_menu(commands: &[BotCommand]) -> String {
    if commands.is_empty() {
        return "command menu cleared".to_string();
    }
    let lines: Vec<String> = commands
        .iter()
        .map(|command| format!("  /{} - {}", command.command, command.description))
        .collect();
    format!("command menu set ({}):\n{}", commands.len(), lines.join("\n"))
}

pub(crate) fn render_poll_report(instance_id: &InstanceId, report: &PollCycleReport) -> String {
    format!(
        "served {instance_id}: {} poll cycle(s), {} updates, {} relayed, {} failed, {} ignored",
        report.cycles, report.updates, report.relayed, report.failed, report.ignored
    )
}
