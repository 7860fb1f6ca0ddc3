//! Types shared by the reconciler, the scheduler and the runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::ControllerConfig;
use crate::controller::rules::RuleId;
use crate::controller::state::{FailureKind, RecordKey, StateError, SyncPhase};
use crate::provider::StoreError;
use crate::secret::{Secret, SecretId};

/// One unit of work: a (secret, rule, destination store) triple
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub secret: SecretId,
    pub rule: RuleId,
    pub store: String,
}

impl TaskKey {
    pub fn new(secret: SecretId, rule: RuleId, store: impl Into<String>) -> Self {
        Self {
            secret,
            rule,
            store: store.into(),
        }
    }

    #[must_use]
    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(self.secret.clone(), &self.rule, &self.store)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}/{}", self.secret, self.rule, self.store)
    }
}

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("no sync record for {0}")]
    NotFound(String),
    #[error("ClusterSecretStore '{0}' is not loaded")]
    StoreNotFound(String),
    #[error("retraction of {key} failed: {source}")]
    Retract { key: String, source: StoreError },
    #[error(transparent)]
    State(#[from] StateError),
}

/// Tunables of the reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub worker_count: usize,
    /// Deadline of a backend call when the store sets none
    pub backend_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub default_max_retries: u32,
    pub scheduler_tick: Duration,
    /// Retry interval of failed triples whose rule never refreshes
    pub failed_retry_interval: Duration,
    /// Generated tokens are replaced this long before they expire
    pub token_refresh_margin: Duration,
}

impl From<&ControllerConfig> for ReconcilerConfig {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            backend_timeout: config.backend_timeout,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
            default_max_retries: config.default_max_retries,
            scheduler_tick: config.scheduler_tick,
            failed_retry_interval: config.failed_retry_interval,
            token_refresh_margin: config.token_refresh_margin,
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

/// Why an operator is alerted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    /// A single attempt failed
    PushFailed,
    /// Backoff retries are used up; the triple waits for its next refresh tick
    RetriesExhausted,
    /// Not retried until the configuration or source changes
    Fatal,
}

/// Why a task finished without writing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// Same payload already synced
    Unchanged,
    /// Rule never refreshes and the destination is synced
    RefreshDisabled,
    /// Rule, destination or secret no longer exists
    Cancelled,
}

/// Observability feed entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SyncEvent {
    Phase {
        secret: SecretId,
        destination: String,
        phase: SyncPhase,
        attempt: u32,
    },
    Skipped {
        secret: SecretId,
        destination: String,
        reason: SkipReason,
    },
    Alert {
        secret: SecretId,
        destination: String,
        alert: AlertKind,
        kind: FailureKind,
        message: String,
    },
    DriftDetected {
        secret: SecretId,
        destination: String,
        remote: String,
    },
    Retracted {
        secret: SecretId,
        destination: String,
        removed: usize,
    },
}

impl SyncEvent {
    #[must_use]
    pub fn destination(&self) -> &str {
        match self {
            SyncEvent::Phase { destination, .. }
            | SyncEvent::Skipped { destination, .. }
            | SyncEvent::Alert { destination, .. }
            | SyncEvent::DriftDetected { destination, .. }
            | SyncEvent::Retracted { destination, .. } => destination,
        }
    }
}

/// A generated secret shared by every destination of its rule
#[derive(Debug, Clone)]
pub struct MaterializedSecret {
    pub secret: Arc<Secret>,
    pub expires_at: Option<DateTime<Utc>>,
    pub fingerprint: String,
}

/// Last health check of a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreHealth {
    pub store: String,
    pub kind: String,
    pub healthy: bool,
    pub checked_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}
