//! Execution of one push task, and explicit retraction.

use chrono::{DateTime, TimeDelta, Utc};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::types::{AlertKind, MaterializedSecret, ReconcilerError, SkipReason, SyncEvent, TaskKey};
use super::{Reconciler, Resolved, StoreHandle};
use crate::controller::backoff::ExponentialBackoff;
use crate::controller::generator::{Generator, GeneratorError};
use crate::controller::locks::lock;
use crate::controller::queue::{Trigger, TriggerSource};
use crate::controller::rules::{payload_hash, PlannedEntry, PushRule, RuleSource};
use crate::controller::state::{
    FailureInfo, FailureKind, PushedEntry, SyncOutcome, SyncPhase, SyncRecord,
};
use crate::observability::metrics;
use crate::provider::{RemoteRef, StoreError, StoreErrorKind};
use crate::secret::{Secret, SecretOrigin};

/// What a successful attempt pushed
struct Pushed<'a> {
    secret: &'a Secret,
    entries: &'a [PlannedEntry],
    payload: String,
    written: usize,
    fingerprint: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl Reconciler {
    pub(super) async fn process(&self, key: TaskKey, trigger: Trigger) {
        let triple_lock = self.triple_locks.get(&key);
        let _guard = triple_lock.lock().await;

        let Some((rule, resolved)) = self.resolve(&key) else {
            debug!("Task {} cancelled before execution", key);
            self.skip(&key, SkipReason::Cancelled);
            return;
        };
        let record = self.state.get(&key.record_key());

        if rule.refresh.interval().is_none()
            && record
                .as_ref()
                .is_some_and(|r| r.phase == SyncPhase::Synced && r.value_expires_at.is_none())
        {
            self.skip(&key, SkipReason::RefreshDisabled);
            return;
        }

        let attempt = record.as_ref().map_or(0, |r| r.retry_count) + 1;
        let (secret, fingerprint, expires_at) = match resolved {
            Resolved::Secret(secret) => (secret, None, None),
            Resolved::Generated => {
                let RuleSource::Generator {
                    generator,
                    key: data_key,
                    fingerprint,
                } = &rule.source
                else {
                    return;
                };
                if !trigger.check_drift && self.generated_is_current(&rule, record.as_ref(), fingerprint) {
                    self.skip(&key, SkipReason::Unchanged);
                    self.ensure_refresh_scheduled(&key, &rule, record.as_ref().and_then(|r| r.value_expires_at));
                    return;
                }
                match self.materialize(&rule, generator, data_key, fingerprint).await {
                    Ok(materialized) => (
                        materialized.secret,
                        Some(materialized.fingerprint),
                        materialized.expires_at,
                    ),
                    Err(e) => {
                        self.fail(&key, &rule, FailureKind::from(&e), e.to_string(), attempt);
                        return;
                    }
                }
            }
        };

        let Some(destination) = rule.destination(&key.store) else {
            return;
        };
        let entries = match destination.plan(&secret) {
            Ok(entries) => entries,
            Err(e) => {
                self.fail(&key, &rule, FailureKind::InvalidInput, e.to_string(), attempt);
                return;
            }
        };
        let payload = payload_hash(&entries);

        let Some(handle) = self.store(&key.store) else {
            self.fail(
                &key,
                &rule,
                FailureKind::InvalidInput,
                format!("ClusterSecretStore '{}' is not loaded", key.store),
                attempt,
            );
            return;
        };

        let synced = record.as_ref().is_some_and(|r| {
            r.phase == SyncPhase::Synced && r.last_pushed_hash.as_deref() == Some(payload.as_str())
        });

        // (entry, expected prior hash)
        let mut writes: Vec<(&PlannedEntry, Option<String>)> = Vec::new();
        if synced {
            if !trigger.check_drift {
                self.skip(&key, SkipReason::Unchanged);
                self.ensure_refresh_scheduled(&key, &rule, expires_at);
                return;
            }
            match self.detect_drift(&key, &handle, &entries).await {
                Ok(drifted) if drifted.is_empty() => {
                    self.skip(&key, SkipReason::Unchanged);
                    self.ensure_refresh_scheduled(&key, &rule, expires_at);
                    return;
                }
                Ok(drifted) => writes = drifted,
                Err(e) => {
                    self.fail(&key, &rule, e.kind.into(), e.message, attempt);
                    return;
                }
            }
        } else {
            for entry in &entries {
                let previous = record.as_ref().and_then(|r| r.entry_hash(&entry.remote));
                if previous != Some(entry.value_hash().as_str()) {
                    writes.push((entry, previous.map(str::to_string)));
                }
            }
        }

        self.mark_pushing(&key, attempt);
        for (entry, expected) in writes.iter() {
            match self.write_entry(&handle, entry, expected.clone()).await {
                Ok(()) => {
                    let hash = entry.value_hash();
                    self.state.update(
                        &key.record_key(),
                        || SyncRecord::new(key.secret.clone(), key.rule.clone(), key.store.clone()),
                        |record| record.set_entry_hash(&entry.remote, hash),
                    );
                }
                Err(e) => {
                    let message = format!("{} {}: {}", handle.name, entry.remote, e.message);
                    self.fail(&key, &rule, e.kind.into(), message, attempt);
                    return;
                }
            }
        }

        self.succeed(
            &key,
            &rule,
            Pushed {
                secret: &secret,
                entries: &entries,
                payload,
                written: writes.len(),
                fingerprint,
                expires_at,
            },
            attempt,
        );
    }

    /// A synced generated destination needs no new value
    fn generated_is_current(&self, rule: &PushRule, record: Option<&SyncRecord>, fingerprint: &str) -> bool {
        let Some(record) = record else {
            return false;
        };
        let margin = TimeDelta::from_std(self.config.token_refresh_margin).unwrap_or(TimeDelta::zero());
        let not_expiring = record
            .value_expires_at
            .is_none_or(|expires_at| expires_at - margin > Utc::now());
        let cache_agrees = lock(&self.materialized).get(&rule.id).is_none_or(|m| {
            m.fingerprint == fingerprint && Some(m.secret.version) == record.last_pushed_version
        });
        record.phase == SyncPhase::Synced
            && record.source_fingerprint.as_deref() == Some(fingerprint)
            && not_expiring
            && cache_agrees
    }

    /// Generated secret of a rule, shared by all its destinations
    ///
    /// Regenerated when absent, when the generator spec changed, or when the
    /// value is about to expire.
    async fn materialize(
        &self,
        rule: &PushRule,
        generator: &Generator,
        data_key: &str,
        fingerprint: &str,
    ) -> Result<MaterializedSecret, GeneratorError> {
        let generator_lock = self.generator_locks.get(&rule.id);
        let _guard = generator_lock.lock().await;

        let margin = TimeDelta::from_std(self.config.token_refresh_margin).unwrap_or(TimeDelta::zero());
        let previous = lock(&self.materialized).get(&rule.id).cloned();
        if let Some(current) = &previous {
            let fresh = current
                .expires_at
                .is_none_or(|expires_at| expires_at - margin > Utc::now());
            if current.fingerprint == fingerprint && fresh {
                return Ok(current.clone());
            }
        }

        let generated = self.generator.generate(generator).await?;
        let Some(id) = rule.generated_secret_id() else {
            return Err(GeneratorError::InvalidSpec(format!("rule {} has no generator", rule.id)));
        };
        let version = previous.map_or(1, |p| p.secret.version + 1);
        info!("Generated new {} value for {} (version {})", generator.kind(), rule.id, version);

        let materialized = MaterializedSecret {
            secret: Arc::new(Secret {
                id,
                data: [(data_key.to_string(), generated.value)].into(),
                version,
                origin: SecretOrigin::Generated,
                labels: std::collections::BTreeMap::new(),
            }),
            expires_at: generated.expires_at,
            fingerprint: fingerprint.to_string(),
        };
        lock(&self.materialized).insert(rule.id.clone(), materialized.clone());
        Ok(materialized)
    }

    /// Entries whose remote value no longer matches what was pushed
    async fn detect_drift<'a>(
        &self,
        key: &TaskKey,
        handle: &StoreHandle,
        entries: &'a [PlannedEntry],
    ) -> Result<Vec<(&'a PlannedEntry, Option<String>)>, StoreError> {
        let mut drifted = Vec::new();
        for entry in entries {
            let current = self
                .call(handle, "read", handle.client.read(&entry.remote))
                .await?
                .map(|remote| remote.value.digest());
            if current.as_deref() != Some(entry.value_hash().as_str()) {
                warn!("Drift detected on {} {}", handle.name, entry.remote);
                metrics::increment_drift_detected();
                self.emit(SyncEvent::DriftDetected {
                    secret: key.secret.clone(),
                    destination: key.record_key().destination,
                    remote: entry.remote.to_string(),
                });
                drifted.push((entry, current));
            }
        }
        Ok(drifted)
    }

    /// Write one entry under its (store, remote key) lock
    ///
    /// `Unauthenticated` forces a credential refresh and retries once;
    /// `Conflict` re-reads the remote value and retries once against it.
    async fn write_entry(
        &self,
        handle: &StoreHandle,
        entry: &PlannedEntry,
        expected: Option<String>,
    ) -> Result<(), StoreError> {
        let remote_key = (handle.name.clone(), entry.remote.key.clone());
        let remote_lock = self.remote_locks.get(&remote_key);
        let result = {
            let _guard = remote_lock.lock().await;
            self.write_with_recovery(handle, entry, expected).await
        };
        drop(remote_lock);
        self.remote_locks.release(&remote_key);
        result
    }

    async fn write_with_recovery(
        &self,
        handle: &StoreHandle,
        entry: &PlannedEntry,
        mut expected: Option<String>,
    ) -> Result<(), StoreError> {
        let mut refreshed = false;
        let mut reread = false;
        loop {
            let result = self
                .call(
                    handle,
                    "write",
                    handle.client.write(&entry.remote, &entry.value, expected.as_deref()),
                )
                .await;
            match result {
                Ok(version) => {
                    debug!("Wrote {} {} (version {})", handle.name, entry.remote, version);
                    return Ok(());
                }
                Err(e) if e.kind == StoreErrorKind::Unauthenticated && !refreshed => {
                    warn!("{} rejected credentials, refreshing: {}", handle.name, e.message);
                    refreshed = true;
                    self.call(handle, "refresh", handle.client.refresh_credentials())
                        .await?;
                }
                Err(e) if e.kind == StoreErrorKind::Conflict && !reread => {
                    warn!("Conflict on {} {}, re-reading: {}", handle.name, entry.remote, e.message);
                    reread = true;
                    expected = self
                        .call(handle, "read", handle.client.read(&entry.remote))
                        .await?
                        .map(|remote| remote.value.digest());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a backend call under the store deadline
    pub(super) async fn call<T>(
        &self,
        handle: &StoreHandle,
        operation: &str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let started = std::time::Instant::now();
        let result = match tokio::time::timeout(handle.timeout, call).await {
            Ok(result) => result,
            Err(_elapsed) => Err(StoreError::unavailable(format!(
                "{operation} on store '{}' exceeded the {}s deadline",
                handle.name,
                handle.timeout.as_secs()
            ))),
        };
        metrics::observe_backend_duration(handle.client.kind().as_str(), started.elapsed().as_secs_f64());
        result
    }

    fn skip(&self, key: &TaskKey, reason: SkipReason) {
        debug!("Skipping {}: {:?}", key, reason);
        self.emit(SyncEvent::Skipped {
            secret: key.secret.clone(),
            destination: key.record_key().destination,
            reason,
        });
    }

    fn mark_pushing(&self, key: &TaskKey, attempt: u32) {
        let record_key = key.record_key();
        self.state.update(
            &record_key,
            || SyncRecord::new(key.secret.clone(), key.rule.clone(), key.store.clone()),
            |record| {
                record.phase = SyncPhase::Pushing;
                record.last_attempt = Some(Utc::now());
            },
        );
        self.emit(SyncEvent::Phase {
            secret: key.secret.clone(),
            destination: record_key.destination,
            phase: SyncPhase::Pushing,
            attempt,
        });
    }

    fn succeed(&self, key: &TaskKey, rule: &PushRule, pushed: Pushed<'_>, attempt: u32) {
        let record_key = key.record_key();
        // Removed while the push was in flight
        if !self.is_live(key) {
            self.state.remove(&record_key);
            return;
        }

        let now = Utc::now();
        self.state.update(
            &record_key,
            || SyncRecord::new(key.secret.clone(), key.rule.clone(), key.store.clone()),
            |record| {
                record.phase = SyncPhase::Synced;
                record.last_pushed_version = Some(pushed.secret.version);
                record.last_pushed_hash = Some(pushed.payload.clone());
                record.source_fingerprint.clone_from(&pushed.fingerprint);
                record.value_expires_at = pushed.expires_at;
                record.pushed = pushed
                    .entries
                    .iter()
                    .map(|entry| PushedEntry {
                        remote: entry.remote.clone(),
                        hash: entry.value_hash(),
                    })
                    .collect();
                record.last_attempt = Some(now);
                record.last_success = Some(now);
                record.last_outcome = Some(if pushed.written > 0 {
                    SyncOutcome::Pushed
                } else {
                    SyncOutcome::Unchanged
                });
                record.retry_count = 0;
                record.last_failure = None;
            },
        );
        if let Some(backoff) = lock(&self.backoffs).get_mut(key) {
            backoff.reset();
        }

        metrics::record_push(&key.store, "synced");
        info!(
            "Synced {} version {} ({} value(s) written, attempt {})",
            key, pushed.secret.version, pushed.written, attempt
        );
        self.emit(SyncEvent::Phase {
            secret: key.secret.clone(),
            destination: record_key.destination,
            phase: SyncPhase::Synced,
            attempt,
        });
        self.schedule_refresh(key, rule, pushed.expires_at);
    }

    /// Record a failed attempt and decide when to try again
    ///
    /// Every failure raises an alert for its destination. Fatal kinds wait
    /// for the next refresh tick; others back off until `max_retries` is
    /// used up, then fall back to the refresh tick as well.
    pub(super) fn fail(&self, key: &TaskKey, rule: &PushRule, kind: FailureKind, message: String, attempt: u32) {
        let record_key = key.record_key();
        if !self.is_live(key) {
            self.state.remove(&record_key);
            return;
        }

        let now = Utc::now();
        let record = self.state.update(
            &record_key,
            || SyncRecord::new(key.secret.clone(), key.rule.clone(), key.store.clone()),
            |record| {
                record.phase = SyncPhase::Failed;
                record.retry_count = record.retry_count.saturating_add(1);
                record.last_attempt = Some(now);
                record.last_outcome = Some(SyncOutcome::Failed);
                record.last_failure = Some(FailureInfo {
                    kind,
                    message: message.clone(),
                    at: now,
                });
            },
        );

        metrics::record_push(&key.store, "failed");
        metrics::increment_failures(kind.as_str());
        warn!("Push of {} failed (attempt {}): {}: {}", key, attempt, kind, message);
        self.emit(SyncEvent::Phase {
            secret: key.secret.clone(),
            destination: record_key.destination.clone(),
            phase: SyncPhase::Failed,
            attempt,
        });
        self.emit(SyncEvent::Alert {
            secret: key.secret.clone(),
            destination: record_key.destination.clone(),
            alert: if kind.is_fatal() {
                AlertKind::Fatal
            } else {
                AlertKind::PushFailed
            },
            kind,
            message: message.clone(),
        });

        if kind.is_fatal() {
            self.schedule_fallback(key, rule);
            return;
        }

        if record.retry_count > rule.max_retries {
            if record.retry_count == rule.max_retries.saturating_add(1) {
                error!(
                    "{} exhausted {} retries; retrying on the next refresh tick",
                    key, rule.max_retries
                );
                metrics::increment_retries_exhausted();
                self.emit(SyncEvent::Alert {
                    secret: key.secret.clone(),
                    destination: record_key.destination,
                    alert: AlertKind::RetriesExhausted,
                    kind,
                    message,
                });
            }
            self.schedule_fallback(key, rule);
            return;
        }

        let delay = lock(&self.backoffs)
            .entry(key.clone())
            .or_insert_with(|| ExponentialBackoff::new(self.config.backoff_base, self.config.backoff_max))
            .next_backoff();
        metrics::increment_retries_scheduled();
        debug!("Retrying {} in {:?}", key, delay);
        self.schedule_in(key, delay, TriggerSource::Retry);
    }

    pub(super) fn record_panic(&self, key: &TaskKey) {
        error!("Push task for {} panicked", key);
        let Some(rule) = self.rule(&key.rule) else {
            return;
        };
        let attempt = self
            .state
            .get(&key.record_key())
            .map_or(0, |record| record.retry_count)
            + 1;
        self.fail(key, &rule, FailureKind::Internal, "push task panicked".to_string(), attempt);
    }

    /// Delete every value a destination pushed and forget its record
    ///
    /// This is the only code path that removes data from a destination store.
    ///
    /// # Errors
    /// - `NotFound` when there is no record for the triple
    /// - `StoreNotFound` when the store is not loaded
    /// - `Retract` when a delete fails; values deleted so far are dropped
    ///   from the record so a second call resumes where this one stopped
    pub async fn retract(&self, key: &TaskKey) -> Result<usize, ReconcilerError> {
        let triple_lock = self.triple_locks.get(key);
        let _guard = triple_lock.lock().await;

        let record_key = key.record_key();
        let record = self
            .state
            .get(&record_key)
            .ok_or_else(|| ReconcilerError::NotFound(record_key.to_string()))?;
        let handle = self
            .store(&key.store)
            .ok_or_else(|| ReconcilerError::StoreNotFound(key.store.clone()))?;

        let mut removed = 0;
        for entry in &record.pushed {
            if let Err(source) = self.delete_entry(&handle, &entry.remote).await {
                return Err(ReconcilerError::Retract {
                    key: record_key.to_string(),
                    source,
                });
            }
            removed += 1;
            self.state.update(
                &record_key,
                || record.clone(),
                |current| current.pushed.retain(|pushed| pushed.remote != entry.remote),
            );
        }

        self.queue.cancel(|queued| queued == key);
        lock(&self.schedule).remove(key);
        lock(&self.backoffs).remove(key);
        self.state.remove(&record_key);

        info!("Retracted {} value(s) pushed for {}", removed, key);
        self.emit(SyncEvent::Retracted {
            secret: key.secret.clone(),
            destination: record_key.destination,
            removed,
        });
        Ok(removed)
    }

    async fn delete_entry(&self, handle: &StoreHandle, remote: &RemoteRef) -> Result<(), StoreError> {
        let remote_key = (handle.name.clone(), remote.key.clone());
        let remote_lock = self.remote_locks.get(&remote_key);
        let result = {
            let _guard = remote_lock.lock().await;
            match self.call(handle, "delete", handle.client.delete(remote)).await {
                Err(e) if e.kind == StoreErrorKind::Unauthenticated => {
                    match self.call(handle, "refresh", handle.client.refresh_credentials()).await {
                        Ok(()) => self.call(handle, "delete", handle.client.delete(remote)).await,
                        Err(e) => Err(e),
                    }
                }
                result => result,
            }
        };
        drop(remote_lock);
        self.remote_locks.release(&remote_key);
        result
    }
}
