//! # Validate Command
//!
//! Checks a rules file the same way the controller does at load time.

use anyhow::{Context, Result};
use push_secret_controller::config::RulesFile;
use push_secret_controller::constants::DEFAULT_MAX_RETRIES;
use push_secret_controller::controller::rules::{RefreshPolicy, RuleSource};
use std::path::Path;

pub fn validate_command(file: &Path) -> Result<()> {
    let loaded = RulesFile::load(file)
        .and_then(|rules| rules.validate(DEFAULT_MAX_RETRIES))
        .with_context(|| format!("{} is invalid", file.display()))?;

    println!("✅ {} is valid", file.display());
    println!();
    println!("Stores ({}):", loaded.stores.len());
    for store in &loaded.stores {
        println!("  {}", store.name);
    }
    println!();
    println!("Rules ({}):", loaded.rules.len());
    for rule in &loaded.rules {
        let source = match &rule.source {
            RuleSource::Selector(_) => "secret selector".to_string(),
            RuleSource::Generator { generator, key, .. } => {
                format!("{} generator (key '{}')", generator.kind(), key)
            }
        };
        let refresh = match rule.refresh {
            RefreshPolicy::Never => "never".to_string(),
            RefreshPolicy::Every(interval) => format!("every {}s", interval.as_secs()),
        };
        let stores: Vec<&str> = rule.destinations.iter().map(|d| d.store.as_str()).collect();
        println!("  {}: {} -> [{}], refresh {}", rule.id, source, stores.join(", "), refresh);
    }
    Ok(())
}
