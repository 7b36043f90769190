use std::sync::OnceLock;

use regex::Regex;

/// `/token` at the start of a (trimmed) line, optionally addressed as
/// `/token@botname`, followed by the rest of the line.
pub(crate) fn plain_command_line_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<token>/[A-Za-z0-9_]+)(?:@[A-Za-z0-9_]+)?(?:\s+(?P<rest>.*)|(?P<glued>[\{\-:–—].*))?$")
            .expect("plain command pattern compiles")
    })
}

/// `/token {placeholder}` (one or more placeholder groups) anywhere in a line,
/// provided the slash starts a word.
pub(crate) fn parametric_usage_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?:^|\s)(?P<usage>(?P<token>/[A-Za-z0-9_]+)[ \t]*\{[^{}\r\n]+\}(?:[ \t]*\{[^{}\r\n]+\})*)",
        )
        .expect("parametric usage pattern compiles")
    })
}

/// `LABEL : value` with a case-insensitive label.
pub(crate) fn labeled_line_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^[^A-Za-z0-9]*(?P<label>id|expired|status|name|nama)\s*:\s*(?P<value>.*?)\s*$")
            .expect("labeled line pattern compiles")
    })
}

pub(crate) fn is_premium_marker(text: &str) -> bool {
    text.contains('💎') || text.contains('⭐') || text.to_lowercase().contains("premium")
}
