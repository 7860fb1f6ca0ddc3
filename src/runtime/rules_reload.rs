//! # Rules File Reload
//!
//! Loads `RULES_FILE` at start and polls it for changes. A file that fails
//! to parse or validate is rejected whole and the previously loaded stores
//! and rules stay in effect.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::config::RulesFile;
use crate::controller::reconciler::Reconciler;
use crate::controller::rules::RuleId;
use crate::observability::metrics;
use crate::provider::{ClientOptions, SecretStore, StoreClient};
use crate::runtime::watchers::ResourceIndex;
use crate::secret::hex_digest;

#[derive(Debug)]
pub struct RulesFileLoader {
    path: PathBuf,
    default_max_retries: u32,
    options: ClientOptions,
    /// Hash of the last file content applied
    applied: Option<String>,
    rules: HashSet<RuleId>,
    stores: HashSet<String>,
}

impl RulesFileLoader {
    #[must_use]
    pub fn new(path: PathBuf, default_max_retries: u32, options: ClientOptions) -> Self {
        Self {
            path,
            default_max_retries,
            options,
            applied: None,
            rules: HashSet::new(),
            stores: HashSet::new(),
        }
    }

    /// Apply the file when its content changed since the last successful load
    ///
    /// Returns whether anything was applied.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed or validated,
    /// or when a store client cannot be built. Nothing is applied then.
    pub async fn reload(&mut self, reconciler: &Reconciler, index: &ResourceIndex) -> Result<bool> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read rules file {}", self.path.display()))?;
        let hash = hex_digest(&Sha256::digest(content.as_bytes()));
        if self.applied.as_deref() == Some(hash.as_str()) {
            return Ok(false);
        }

        let loaded = RulesFile::parse(&content)
            .and_then(|file| file.validate(self.default_max_retries))
            .with_context(|| format!("Rules file {} rejected", self.path.display()))?;

        // Build every client before touching the reconciler
        let mut clients = Vec::with_capacity(loaded.stores.len());
        for store in &loaded.stores {
            let client = StoreClient::from_spec(&store.spec, &self.options)
                .await
                .with_context(|| format!("Rules file store '{}' rejected", store.name))?;
            let timeout = store.spec.timeout_seconds.map(Duration::from_secs);
            clients.push((store.name.trim().to_string(), client, timeout));
        }

        let stores: HashSet<String> = clients.iter().map(|(name, _, _)| name.clone()).collect();
        let rules: HashSet<RuleId> = loaded.rules.iter().map(|rule| rule.id.clone()).collect();

        for (name, client, timeout) in clients {
            info!("Loading store {} ({}) from rules file", name, client.kind().as_str());
            reconciler.apply_store(&name, Arc::new(client), timeout);
        }
        for rule in loaded.rules {
            reconciler.apply_rule(rule);
        }
        for gone in self.rules.difference(&rules) {
            if !index.contains_rule(gone) {
                reconciler.remove_rule(gone);
            }
        }
        for gone in self.stores.difference(&stores) {
            if !index.contains_store(gone) {
                reconciler.remove_store(gone);
            }
        }

        info!(
            "Rules file {} applied: {} store(s), {} rule(s)",
            self.path.display(),
            stores.len(),
            rules.len()
        );
        self.rules = rules;
        self.stores = stores;
        self.applied = Some(hash);
        Ok(true)
    }
}

pub async fn run_rules_reload(
    mut loader: RulesFileLoader,
    reconciler: Arc<Reconciler>,
    index: ResourceIndex,
    poll: Duration,
) {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the file was loaded at start
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = loader.reload(&reconciler, &index).await {
            metrics::increment_rules_reload_errors();
            error!("{:#}", e);
        }
    }
}
