//! Common test utilities
//!
//! Rustls setup for the Pact tests and helpers for driving a reconciler
//! against in-memory stores.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::BTreeMap;
use std::sync::{Arc, Once};
use std::time::Duration;

use push_secret_controller::controller::generator::GeneratorEngine;
use push_secret_controller::controller::reconciler::{Reconciler, ReconcilerConfig};
use push_secret_controller::controller::rules::{PushRule, RuleId};
use push_secret_controller::controller::state::{StateStore, SyncRecord};
use push_secret_controller::crd::PushSecretSpec;
use push_secret_controller::provider::memory::MemoryStore;
use push_secret_controller::provider::ClientOptions;
use push_secret_controller::secret::{SecretId, SecretValue};

static RUSTLS_INIT: Once = Once::new();

/// Install the ring crypto provider once per test binary
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install rustls crypto provider");
    });
}

pub fn client_options() -> ClientOptions {
    ClientOptions {
        request_timeout: Duration::from_secs(5),
        refresh_margin: Duration::from_secs(60),
    }
}

/// Base URL of a Pact mock server without the trailing slash
pub fn base_url(url: impl std::fmt::Display) -> String {
    url.to_string().trim_end_matches('/').to_string()
}

/// Reconciler tunables for tests: fast backoff, fast scheduler tick
pub fn test_config() -> ReconcilerConfig {
    ReconcilerConfig {
        worker_count: 4,
        backend_timeout: Duration::from_secs(5),
        backoff_base: Duration::from_millis(100),
        backoff_max: Duration::from_secs(2),
        default_max_retries: 5,
        scheduler_tick: Duration::from_millis(50),
        failed_retry_interval: Duration::from_secs(300),
        token_refresh_margin: Duration::from_secs(60),
    }
}

pub fn reconciler() -> Arc<Reconciler> {
    Reconciler::new(test_config(), StateStore::new(), GeneratorEngine::new())
}

/// Parse a `PushSecret` spec from YAML and validate it
pub fn rule(namespace: &str, name: &str, yaml: &str) -> PushRule {
    let spec: PushSecretSpec = serde_yaml::from_str(yaml).expect("valid PushSecret spec YAML");
    PushRule::from_spec(RuleId::new(namespace, name), &spec, 5).expect("valid rule")
}

pub fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, SecretValue> {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), SecretValue::from(*value)))
        .collect()
}

/// Load one fresh in-memory store per name
pub fn stores(reconciler: &Reconciler, names: &[&str]) -> Vec<MemoryStore> {
    names
        .iter()
        .map(|name| {
            let store = MemoryStore::new();
            reconciler.apply_store(name, Arc::new(store.clone()), None);
            store
        })
        .collect()
}

/// Record of one destination, if any
pub fn record(reconciler: &Reconciler, secret: &SecretId, rule: &RuleId, store: &str) -> Option<SyncRecord> {
    reconciler
        .state()
        .snapshot()
        .values()
        .find(|record| &record.secret == secret && &record.rule == rule && record.store == store)
        .cloned()
}

/// Poll until `condition` holds; panics after `limit`
pub async fn wait_for(limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {limit:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Let queued work drain
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}
