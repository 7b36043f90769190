#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_catalog::{extract_plain_commands, render_menu_text};
use relay_types::BotCommand;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let commands: Vec<BotCommand> = raw
        .split('\n')
        .filter_map(|line| {
            let (token, description) = line.split_once(' ').unwrap_or((line, ""));
            let token: String = token
                .chars()
                .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
                .take(32)
                .collect();
            if token.is_empty() {
                return None;
            }
            let description = description.replace(['\r', '{'], " ");
            Some(BotCommand::new(token, description))
        })
        .collect();

    let rendered = render_menu_text(&commands);
    let extracted = extract_plain_commands(&rendered);
    let tokens: Vec<String> = extracted.into_iter().map(|entry| entry.token).collect();
    let expected: Vec<String> = commands
        .iter()
        .map(|command| format!("/{}", command.command))
        .collect();
    assert_eq!(tokens, expected);
});
