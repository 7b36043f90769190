//! Telegram Bot API adapters for the relay runtime.

mod bot_api_client;
mod facade_poller;
mod identities;

pub use bot_api_client::{
    TelegramBotClient, TelegramChat, TelegramClientConfig, TelegramIncomingMessage,
    TelegramUpdate, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_TELEGRAM_API_BASE,
};
pub use facade_poller::{
    FacadePoller, FacadePollerConfig, PollCycleReport, DEFAULT_LONG_POLL_SECS,
};
pub use identities::TelegramIdentities;
