//! # Reconciler
//!
//! Push reconciliation of (secret, rule, destination) triples.
//!
//! The reconciler:
//! - Keeps the source secret cache, the loaded rules and the store clients
//! - Turns watch events into tasks on a single coalescing work queue
//! - Runs a fixed pool of workers that push one triple at a time
//! - Records every attempt in the [`StateStore`]
//! - Schedules backoff retries and refresh ticks
//!
//! ## Task Flow
//!
//! 1. `apply_secret` / `apply_rule` / `apply_store` enqueue the affected triples
//!    (synchronous, no network)
//! 2. A worker takes the triple's lock and re-checks that it still exists
//! 3. The destination payload is planned from the rule's mappings
//! 4. Unchanged payloads are skipped; changed entries are written
//! 5. The outcome is recorded and the next retry or refresh is scheduled
//!
//! Removing a secret or rule cancels its tasks and forgets its sync records.
//! Nothing is deleted from the destination stores; that only happens through
//! [`Reconciler::retract`].

mod push;
mod scheduler;
pub mod types;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, Instrument};

use crate::constants::SYNC_EVENT_CHANNEL_CAPACITY;
use crate::controller::backoff::ExponentialBackoff;
use crate::controller::generator::GeneratorEngine;
use crate::controller::locks::{lock, KeyedLocks};
use crate::controller::queue::{Trigger, TriggerSource, WorkQueue};
use crate::controller::rules::{PushRule, RuleId, RuleSource};
use crate::controller::source::{SecretCache, UpsertOutcome};
use crate::controller::state::{StateStore, SyncPhase, SyncRecord};
use crate::observability::metrics;
use crate::provider::SecretStore;
use crate::secret::{Secret, SecretId, SecretValue};

pub use scheduler::Scheduled;
pub use types::{
    AlertKind, MaterializedSecret, ReconcilerConfig, ReconcilerError, SkipReason, StoreHealth,
    SyncEvent, TaskKey,
};

/// A loaded `ClusterSecretStore`
pub struct StoreHandle {
    pub name: String,
    pub client: Arc<dyn SecretStore>,
    /// Deadline of each backend call
    pub timeout: Duration,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("name", &self.name)
            .field("kind", &self.client.kind())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Source of a live task
enum Resolved {
    Secret(Arc<Secret>),
    Generated,
}

pub struct Reconciler {
    config: ReconcilerConfig,
    secrets: Mutex<SecretCache>,
    rules: Mutex<HashMap<RuleId, Arc<PushRule>>>,
    stores: Mutex<HashMap<String, Arc<StoreHandle>>>,
    queue: WorkQueue<TaskKey>,
    triple_locks: KeyedLocks<TaskKey>,
    remote_locks: KeyedLocks<(String, String)>,
    generator_locks: KeyedLocks<RuleId>,
    generator: GeneratorEngine,
    materialized: Mutex<HashMap<RuleId, MaterializedSecret>>,
    backoffs: Mutex<HashMap<TaskKey, ExponentialBackoff>>,
    schedule: Mutex<HashMap<TaskKey, Scheduled>>,
    state: StateStore,
    events: broadcast::Sender<SyncEvent>,
    health: Mutex<BTreeMap<String, StoreHealth>>,
}

/// Background tasks of a started reconciler
#[derive(Debug)]
pub struct ReconcilerHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl ReconcilerHandle {
    /// Stop workers and the scheduler; in-flight pushes are dropped
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(config: ReconcilerConfig, state: StateStore, generator: GeneratorEngine) -> Arc<Self> {
        let (events, _) = broadcast::channel(SYNC_EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            secrets: Mutex::new(SecretCache::new()),
            rules: Mutex::new(HashMap::new()),
            stores: Mutex::new(HashMap::new()),
            queue: WorkQueue::new(),
            triple_locks: KeyedLocks::new(),
            remote_locks: KeyedLocks::new(),
            generator_locks: KeyedLocks::new(),
            generator,
            materialized: Mutex::new(HashMap::new()),
            backoffs: Mutex::new(HashMap::new()),
            schedule: Mutex::new(HashMap::new()),
            state,
            events,
            health: Mutex::new(BTreeMap::new()),
        })
    }

    /// Spawn the worker pool and the scheduler
    pub fn start(self: &Arc<Self>) -> ReconcilerHandle {
        let worker_count = self.config.worker_count.max(1);
        let mut tasks = Vec::with_capacity(worker_count + 1);
        for worker in 0..worker_count {
            let span = info_span!("push_worker", worker);
            tasks.push(tokio::spawn(Arc::clone(self).run_worker().instrument(span)));
        }
        tasks.push(tokio::spawn(Arc::clone(self).run_scheduler()));
        info!("Reconciler started with {} workers", worker_count);
        ReconcilerHandle { tasks }
    }

    async fn run_worker(self: Arc<Self>) {
        while let Some((key, trigger)) = self.queue.pop().await {
            metrics::set_queue_depth(self.queue.len());
            metrics::increment_in_flight();

            let this = Arc::clone(&self);
            let task_key = key.clone();
            let span = info_span!("push", task = %key, trigger = trigger.source.as_str());
            let outcome = tokio::spawn(async move { this.process(task_key, trigger).await }.instrument(span)).await;

            metrics::decrement_in_flight();
            if let Err(e) = outcome {
                if e.is_panic() {
                    self.record_panic(&key);
                }
            }
        }
    }

    #[must_use]
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Subscribe to phase transitions, skips and alerts
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // ---- secrets ----

    /// Record a created or updated source secret
    pub fn apply_secret(
        &self,
        id: SecretId,
        data: BTreeMap<String, SecretValue>,
        labels: BTreeMap<String, String>,
    ) {
        let (secret, outcome) = lock(&self.secrets).upsert(id, data, labels);
        if outcome == UpsertOutcome::Updated {
            debug!("Secret {} changed, now at version {}", secret.id, secret.version);
        }

        for rule in self.rules_snapshot() {
            if rule.matches(&secret) {
                for destination in &rule.destinations {
                    let key = TaskKey::new(secret.id.clone(), rule.id.clone(), destination.store.clone());
                    // Label-only edits and resyncs only pick up newly matched destinations
                    if outcome != UpsertOutcome::Unchanged || self.state.get(&key.record_key()).is_none() {
                        self.enqueue(key, Trigger::new(TriggerSource::SourceChange), &rule);
                    }
                }
            } else if matches!(rule.source, RuleSource::Selector(_))
                && rule.id.namespace == secret.id.namespace
            {
                self.forget(|key| key.secret == secret.id && key.rule == rule.id);
            }
        }
    }

    /// Forget a deleted source secret
    ///
    /// Pending tasks are cancelled and sync records dropped. Values already
    /// pushed stay in the destination stores.
    pub fn remove_secret(&self, id: &SecretId) {
        if lock(&self.secrets).remove(id).is_some() {
            info!("Secret {} removed; pushed values are left in place", id);
        }
        self.forget(|key| &key.secret == id);
    }

    /// Drop cached secrets `keep` rejects (after a watch relist)
    pub fn retain_secrets(&self, keep: impl FnMut(&SecretId) -> bool) {
        let removed = lock(&self.secrets).retain(keep);
        for id in removed {
            self.remove_secret(&id);
        }
    }

    // ---- rules ----

    /// Load or replace a rule
    pub fn apply_rule(&self, rule: PushRule) {
        let rule = Arc::new(rule);
        let previous = lock(&self.rules).insert(rule.id.clone(), Arc::clone(&rule));

        if let Some(previous) = &previous {
            if **previous == *rule {
                return;
            }
            let dropped: Vec<String> = previous
                .destinations
                .iter()
                .filter(|d| !rule.references_store(&d.store))
                .map(|d| d.store.clone())
                .collect();
            if !dropped.is_empty() {
                info!("Rule {} no longer pushes to {:?}", rule.id, dropped);
                self.forget(|key| key.rule == rule.id && dropped.contains(&key.store));
            }
            if previous.source != rule.source {
                lock(&self.materialized).remove(&rule.id);
            }
        }

        let targets = self.target_secrets(&rule);
        self.forget(|key| key.rule == rule.id && !targets.contains(&key.secret));

        info!(
            "Rule {} loaded: {} secret(s), {} destination(s)",
            rule.id,
            targets.len(),
            rule.destinations.len()
        );
        self.enqueue_rule(&rule, &targets, TriggerSource::ConfigChange);
    }

    /// Forget a deleted rule; pushed values are left in place
    pub fn remove_rule(&self, id: &RuleId) {
        if lock(&self.rules).remove(id).is_some() {
            info!("Rule {} removed; pushed values are left in place", id);
        }
        lock(&self.materialized).remove(id);
        self.generator_locks.prune(|rule| rule == id);
        self.forget(|key| &key.rule == id);
    }

    #[must_use]
    pub fn rule(&self, id: &RuleId) -> Option<Arc<PushRule>> {
        lock(&self.rules).get(id).map(Arc::clone)
    }

    #[must_use]
    pub fn rule_ids(&self) -> Vec<RuleId> {
        let mut ids: Vec<RuleId> = lock(&self.rules).keys().cloned().collect();
        ids.sort();
        ids
    }

    fn rules_snapshot(&self) -> Vec<Arc<PushRule>> {
        lock(&self.rules).values().map(Arc::clone).collect()
    }

    /// Secrets a rule currently applies to
    fn target_secrets(&self, rule: &PushRule) -> Vec<SecretId> {
        if let Some(generated) = rule.generated_secret_id() {
            return vec![generated];
        }
        let secrets = lock(&self.secrets);
        secrets
            .in_namespace(&rule.id.namespace)
            .filter(|secret| rule.matches(secret))
            .map(|secret| secret.id.clone())
            .collect()
    }

    fn enqueue_rule(&self, rule: &PushRule, targets: &[SecretId], source: TriggerSource) {
        for secret in targets {
            for destination in &rule.destinations {
                let key = TaskKey::new(secret.clone(), rule.id.clone(), destination.store.clone());
                self.enqueue(key, Trigger::new(source), rule);
            }
        }
    }

    // ---- stores ----

    /// Load or replace a store client
    pub fn apply_store(&self, name: &str, client: Arc<dyn SecretStore>, timeout: Option<Duration>) {
        let handle = Arc::new(StoreHandle {
            name: name.to_string(),
            timeout: timeout.unwrap_or(self.config.backend_timeout),
            client,
        });
        let kind = handle.client.kind().as_str().to_string();
        lock(&self.stores).insert(name.to_string(), handle);
        lock(&self.health)
            .entry(name.to_string())
            .and_modify(|health| health.kind.clone_from(&kind))
            .or_insert_with(|| StoreHealth {
                store: name.to_string(),
                kind,
                healthy: false,
                checked_at: None,
                message: None,
            });
        info!("Store {} loaded", name);

        for rule in self.rules_snapshot() {
            if rule.references_store(name) {
                let targets = self.target_secrets(&rule);
                for secret in targets {
                    let key = TaskKey::new(secret, rule.id.clone(), name);
                    self.enqueue(key, Trigger::new(TriggerSource::ConfigChange), &rule);
                }
            }
        }
    }

    /// Unload a store; its records stay until the rules referencing it change
    pub fn remove_store(&self, name: &str) {
        if lock(&self.stores).remove(name).is_some() {
            info!("Store {} removed", name);
        }
        lock(&self.health).remove(name);
        metrics::remove_store(name);
    }

    #[must_use]
    pub fn store(&self, name: &str) -> Option<Arc<StoreHandle>> {
        lock(&self.stores).get(name).map(Arc::clone)
    }

    #[must_use]
    pub fn stores(&self) -> Vec<Arc<StoreHandle>> {
        lock(&self.stores).values().map(Arc::clone).collect()
    }

    /// Record a health check result
    pub fn set_store_health(&self, name: &str, healthy: bool, message: Option<String>) {
        metrics::set_store_healthy(name, healthy);
        if let Some(health) = lock(&self.health).get_mut(name) {
            health.healthy = healthy;
            health.checked_at = Some(chrono::Utc::now());
            health.message = message;
        }
    }

    #[must_use]
    pub fn store_health(&self) -> Vec<StoreHealth> {
        lock(&self.health).values().cloned().collect()
    }

    /// Whether every loaded store passed its last health check
    #[must_use]
    pub fn all_stores_healthy(&self) -> bool {
        lock(&self.health).values().all(|health| health.healthy)
    }

    // ---- queue ----

    /// Queue a triple, marking its record `Pending` when it has to push again
    pub fn enqueue(&self, key: TaskKey, trigger: Trigger, rule: &PushRule) {
        let record_key = key.record_key();
        if let Some(record) = self.state.get(&record_key) {
            let moves = match record.phase {
                SyncPhase::Failed => true,
                SyncPhase::Synced => {
                    trigger.source == TriggerSource::SourceChange && rule.refresh.interval().is_some()
                }
                SyncPhase::Pending | SyncPhase::Pushing => false,
            };
            if moves {
                let updated = self.state.update(
                    &record_key,
                    || SyncRecord::new(key.secret.clone(), key.rule.clone(), key.store.clone()),
                    |record| record.phase = SyncPhase::Pending,
                );
                self.emit(SyncEvent::Phase {
                    secret: key.secret.clone(),
                    destination: record_key.destination.clone(),
                    phase: SyncPhase::Pending,
                    attempt: updated.retry_count,
                });
            }
        }

        if self.queue.push(key, trigger) {
            metrics::set_queue_depth(self.queue.len());
        }
    }

    /// Queue a triple on operator request
    ///
    /// # Errors
    /// Returns `NotFound` when the rule does not exist or does not push to the store.
    pub fn trigger(&self, key: TaskKey) -> Result<(), ReconcilerError> {
        let rule = self
            .rule(&key.rule)
            .filter(|rule| rule.references_store(&key.store))
            .ok_or_else(|| ReconcilerError::NotFound(key.to_string()))?;
        self.enqueue(key, Trigger::new(TriggerSource::Manual), &rule);
        Ok(())
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Number of per-key locks currently allocated
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.triple_locks.len() + self.remote_locks.len() + self.generator_locks.len()
    }

    /// Cancel tasks and drop records of every triple matching `predicate`
    fn forget(&self, predicate: impl Fn(&TaskKey) -> bool) {
        let cancelled = self.queue.cancel(&predicate);
        lock(&self.schedule).retain(|key, _| !predicate(key));
        lock(&self.backoffs).retain(|key, _| !predicate(key));
        let removed = self
            .state
            .remove_where(|record| predicate(&task_key_of(record)));
        self.triple_locks.prune(&predicate);
        self.remote_locks.prune(|_| true);
        if cancelled > 0 || removed > 0 {
            debug!("Cancelled {} task(s), forgot {} record(s)", cancelled, removed);
            metrics::set_queue_depth(self.queue.len());
        }
    }

    /// The rule and source of a task, or `None` when it was cancelled
    fn resolve(&self, key: &TaskKey) -> Option<(Arc<PushRule>, Resolved)> {
        let rule = self.rule(&key.rule)?;
        rule.destination(&key.store)?;
        match &rule.source {
            RuleSource::Generator { .. } => {
                (rule.generated_secret_id().as_ref() == Some(&key.secret)).then_some((rule, Resolved::Generated))
            }
            RuleSource::Selector(_) => {
                let secret = lock(&self.secrets).get(&key.secret)?;
                rule.matches(&secret).then_some((rule, Resolved::Secret(secret)))
            }
        }
    }

    fn is_live(&self, key: &TaskKey) -> bool {
        self.resolve(key).is_some()
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("rules", &lock(&self.rules).len())
            .field("secrets", &lock(&self.secrets).len())
            .field("queue", &self.queue.len())
            .finish_non_exhaustive()
    }
}

fn task_key_of(record: &SyncRecord) -> TaskKey {
    TaskKey::new(record.secret.clone(), record.rule.clone(), record.store.clone())
}
