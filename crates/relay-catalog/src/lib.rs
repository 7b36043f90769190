//! Heuristic extraction of command catalogs from free-text master replies.
//!
//! Masters describe their commands in loosely formatted help text. The
//! extractor recognizes three shapes independently and unions the results:
//! plain `/command description` lines, parametric `/command {placeholder}`
//! usages, and an account status block (`name`, `ID`, `EXPIRED`, `STATUS`).
//! Extraction never fails; unrecognized text yields an empty catalog.

mod patterns;
mod status_block;

use relay_types::{BotCommand, CommandCategory, ExtractedCommand, ExtractedStatus};
use serde::{Deserialize, Serialize};

use patterns::{is_premium_marker, parametric_usage_regex, plain_command_line_regex};
pub use status_block::extract_status_block;

/// Structured result of parsing one master reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedCatalog {
    pub entries: Vec<ExtractedCommand>,
    pub status: Option<ExtractedStatus>,
    /// Number of extracted entries, duplicates across categories included.
    pub total_commands: usize,
}

impl ExtractedCatalog {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.status.is_none()
    }

    pub fn count_by_category(&self, category: CommandCategory) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.category == category)
            .count()
    }
}

/// Parses `reply_text` into command entries and an optional status snapshot.
pub fn extract(reply_text: &str) -> ExtractedCatalog {
    let mut entries = extract_plain_commands(reply_text);
    entries.extend(extract_parametric_commands(reply_text));
    let status = extract_status_block(reply_text);
    ExtractedCatalog {
        total_commands: entries.len(),
        entries,
        status,
    }
}

/// Extracts `/word description` lines.
///
/// The description runs from the token to the end of its line and continues
/// over following lines until a blank line or another `/token` line. Lines
/// whose token is immediately followed by `{placeholder}` belong to the
/// parametric form and are skipped here.
pub fn extract_plain_commands(reply_text: &str) -> Vec<ExtractedCommand> {
    let line_regex = plain_command_line_regex();
    let mut entries: Vec<ExtractedCommand> = Vec::new();
    let mut open: Option<ExtractedCommand> = None;

    for line in reply_text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            entries.extend(open.take());
            continue;
        }

        if let Some(captures) = line_regex.captures(trimmed) {
            entries.extend(open.take());
            let token = captures["token"].to_string();
            let rest = captures
                .name("rest")
                .or_else(|| captures.name("glued"))
                .map_or("", |rest| rest.as_str());
            if rest.trim_start().starts_with('{') {
                continue;
            }
            open = Some(ExtractedCommand {
                token,
                description: clean_description(rest),
                usage_template: None,
                category: CommandCategory::General,
                premium: is_premium_marker(trimmed),
            });
            continue;
        }

        if let Some(entry) = open.as_mut() {
            let continuation = clean_description(trimmed);
            if !continuation.is_empty() {
                if !entry.description.is_empty() {
                    entry.description.push(' ');
                }
                entry.description.push_str(&continuation);
            }
            entry.premium |= is_premium_marker(trimmed);
        }
    }
    entries.extend(open);
    entries
}

/// Extracts `/word {placeholder}` usages anywhere in the text.
pub fn extract_parametric_commands(reply_text: &str) -> Vec<ExtractedCommand> {
    let usage_regex = parametric_usage_regex();
    let mut entries = Vec::new();
    for line in reply_text.lines() {
        for captures in usage_regex.captures_iter(line) {
            let Some(usage) = captures.name("usage") else {
                continue;
            };
            let tail = &line[usage.end()..];
            entries.push(ExtractedCommand {
                token: captures["token"].to_string(),
                description: clean_description(tail),
                usage_template: Some(usage.as_str().to_string()),
                category: CommandCategory::Parametric,
                premium: is_premium_marker(line),
            });
        }
    }
    entries
}

/// Renders a bot command menu as plain-form lines so it can be fed back into
/// [`extract`].
pub fn render_menu_text(commands: &[BotCommand]) -> String {
    commands
        .iter()
        .map(|command| {
            let token = command.command.trim_start_matches('/');
            let description = command.description.trim();
            if description.is_empty() {
                format!("/{token}")
            } else {
                format!("/{token} - {description}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn clean_description(raw: &str) -> String {
    raw.trim()
        .trim_start_matches(['-', '–', '—', ':', '=', '>', '|'])
        .trim()
        .to_string()
}
