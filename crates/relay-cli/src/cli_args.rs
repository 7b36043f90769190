use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use relay_telegram::{
    DEFAULT_LONG_POLL_SECS, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_TELEGRAM_API_BASE,
};
use relay_types::{DEFAULT_DURATION_HOURS, DEFAULT_QUOTA_LIMIT};

fn parse_positive_u32(value: &str) -> Result<u32, String> {
    let parsed = value
        .parse::<u32>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_non_empty(value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("value must not be empty".to_string());
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Parser)]
#[command(
    name = "relay-rs",
    about = "Operate façade bots that relay commands to a master bot",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "RELAY_DB_PATH",
        default_value = ".relay/relay.sqlite",
        help = "SQLite database holding instances and command catalogs"
    )]
    pub(crate) db_path: PathBuf,

    #[arg(
        long,
        env = "RELAY_TELEGRAM_API_BASE",
        default_value = DEFAULT_TELEGRAM_API_BASE,
        help = "Base URL of the Telegram Bot API"
    )]
    pub(crate) telegram_api_base: String,

    #[arg(
        long,
        env = "RELAY_REQUEST_TIMEOUT_MS",
        default_value_t = DEFAULT_REQUEST_TIMEOUT_MS,
        value_parser = parse_positive_u64,
        help = "Timeout for each Bot API request in milliseconds"
    )]
    pub(crate) request_timeout_ms: u64,

    #[arg(
        long,
        env = "RELAY_REQUEST_RETRY_MAX_ATTEMPTS",
        default_value_t = 3,
        value_parser = parse_positive_u64,
        help = "Attempts per Bot API request, including the first"
    )]
    pub(crate) request_retry_max_attempts: u64,

    #[arg(long, help = "Print machine-readable JSON instead of text")]
    pub(crate) json: bool,

    #[command(subcommand)]
    pub(crate) command: RelayCommand,
}

#[derive(Debug, Subcommand)]
pub(crate) enum RelayCommand {
    /// Register a new façade instance.
    CreateInstance(CreateInstanceArgs),
    /// List instances with their status evaluated now.
    ListInstances {
        #[arg(long, help = "Only list instances owned by this user")]
        owner: Option<String>,
    },
    /// Refresh an instance's command catalog from its master.
    Sync { instance_id: String },
    /// Show the stored command catalog and master status of an instance.
    ShowCommands { instance_id: String },
    /// Push the stored catalog to the façade bot's command menu.
    PublishMenu { instance_id: String },
    /// Stop relaying for an instance.
    Suspend { instance_id: String },
    /// Re-activate a suspended instance.
    Resume { instance_id: String },
    /// Persist the expired status of instances past their expiry.
    Sweep,
    /// Run the façade bot: relay user commands to the master until Ctrl-C.
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
pub(crate) struct ServeArgs {
    pub(crate) instance_id: String,
    #[arg(
        long,
        env = "RELAY_TIMEOUT_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "How long to wait for the master's reply to each command"
    )]
    pub(crate) relay_timeout_ms: u64,
    #[arg(
        long,
        default_value_t = DEFAULT_LONG_POLL_SECS,
        help = "Long-poll duration of each getUpdates call in seconds"
    )]
    pub(crate) long_poll_secs: u64,
    #[arg(
        long,
        value_parser = parse_positive_u64,
        help = "Stop after this many poll cycles"
    )]
    pub(crate) max_cycles: Option<u64>,
}

#[derive(Debug, Args)]
pub(crate) struct CreateInstanceArgs {
    #[arg(long, value_parser = parse_non_empty)]
    pub(crate) owner: String,
    #[arg(long, value_parser = parse_non_empty)]
    pub(crate) name: String,
    #[arg(
        long,
        env = "RELAY_FACADE_TOKEN",
        value_parser = parse_non_empty,
        help = "Bot token of the façade bot"
    )]
    pub(crate) facade_token: String,
    #[arg(
        long,
        env = "RELAY_MASTER_CRED",
        value_parser = parse_non_empty,
        help = "Credential used to reach the master (bot token or listener session)"
    )]
    pub(crate) master_cred: String,
    #[arg(long, value_parser = parse_non_empty, help = "Username or id of the master bot")]
    pub(crate) master_peer: String,
    #[arg(long, default_value_t = DEFAULT_QUOTA_LIMIT, value_parser = parse_positive_u32)]
    pub(crate) quota: u32,
    #[arg(long, default_value_t = DEFAULT_DURATION_HOURS)]
    pub(crate) duration_hours: u32,
}
