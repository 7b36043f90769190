//! Account status block recognition.

use relay_types::ExtractedStatus;

use crate::patterns::{is_premium_marker, labeled_line_regex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Id,
    Expired,
    Status,
    Name,
}

fn labeled(line: &str) -> Option<(Label, String)> {
    let captures = labeled_line_regex().captures(line)?;
    let label = match captures["label"].to_ascii_lowercase().as_str() {
        "id" => Label::Id,
        "expired" => Label::Expired,
        "status" => Label::Status,
        _ => Label::Name,
    };
    Some((label, captures["value"].to_string()))
}

fn name_from_line(line: &str) -> Option<String> {
    if line.starts_with('/') {
        return None;
    }
    let name = match labeled(line) {
        Some((Label::Name, value)) => value,
        Some(_) => return None,
        None => line
            .trim_start_matches(|ch: char| !ch.is_alphanumeric())
            .trim_end()
            .to_string(),
    };
    (!name.is_empty()).then_some(name)
}

/// Finds the first `name`, `ID`, `EXPIRED`, `STATUS` run of lines.
///
/// Labels match case-insensitively and blank lines between the four lines are
/// ignored. Values are kept verbatim; the expiry in particular is free text.
pub fn extract_status_block(reply_text: &str) -> Option<ExtractedStatus> {
    let lines: Vec<&str> = reply_text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    for index in 1..lines.len().saturating_sub(2) {
        let Some((Label::Id, reported_id)) = labeled(lines[index]) else {
            continue;
        };
        let Some((Label::Expired, expiry_text)) = labeled(lines[index + 1]) else {
            continue;
        };
        let Some((Label::Status, status_text)) = labeled(lines[index + 2]) else {
            continue;
        };
        let Some(reported_name) = name_from_line(lines[index - 1]) else {
            continue;
        };
        let premium = is_premium_marker(&status_text) || is_premium_marker(&reported_name);
        return Some(ExtractedStatus {
            reported_name,
            reported_id,
            expiry_text,
            status_text,
            premium,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::extract_status_block;
    use crate::extract;

    #[test]
    fn captures_reference_status_block_verbatim() {
        let reply = "Budi Santoso\nID : 7555202218\nEXPIRED : 29 Jun 2026 22:0:20\nSTATUS : ACTIVE";
        let status = extract_status_block(reply).expect("status block");
        assert_eq!(status.reported_name, "Budi Santoso");
        assert_eq!(status.reported_id, "7555202218");
        assert_eq!(status.expiry_text, "29 Jun 2026 22:0:20");
        assert_eq!(status.status_text, "ACTIVE");
        assert!(!status.premium);
    }

    #[test]
    fn labels_are_case_insensitive_and_decorations_are_stripped() {
        let reply = "Welcome back!\n\n👤 Nama: Siti\nid: 42\n\nExpired:never\nStatus : Premium\n\n/help bantuan";
        let catalog = extract(reply);
        let status = catalog.status.expect("status block");
        assert_eq!(status.reported_name, "Siti");
        assert_eq!(status.reported_id, "42");
        assert_eq!(status.expiry_text, "never");
        assert_eq!(status.status_text, "Premium");
        assert!(status.premium);
        assert_eq!(catalog.total_commands, 1);
    }

    #[test]
    fn out_of_order_or_incomplete_blocks_are_ignored() {
        assert!(extract_status_block("Budi\nEXPIRED : soon\nID : 1\nSTATUS : ACTIVE").is_none());
        assert!(extract_status_block("Budi\nID : 1\nEXPIRED : soon").is_none());
        assert!(extract_status_block("ID : 1\nEXPIRED : soon\nSTATUS : ACTIVE").is_none());
    }
}
