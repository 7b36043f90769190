#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_catalog::extract;
use relay_types::CommandCategory;

fuzz_target!(|data: &[u8]| {
    let reply = String::from_utf8_lossy(data);
    let catalog = extract(&reply);
    assert_eq!(catalog.total_commands, catalog.entries.len());
    for entry in &catalog.entries {
        assert!(entry.token.starts_with('/'));
        match entry.category {
            CommandCategory::General => assert!(entry.usage_template.is_none()),
            CommandCategory::Parametric => {
                let usage = entry.usage_template.as_deref().unwrap_or_default();
                assert!(usage.starts_with(&entry.token));
            }
        }
    }
});
