//! # State Store
//!
//! Durable record of every (secret, destination) push.
//!
//! The table is an immutable `Arc<BTreeMap>` published through a
//! `tokio::sync::watch` channel. The reconciler is the only writer
//! (copy-on-write through [`StateStore::update`]); the status API and the
//! persister read snapshots without blocking it.
//!
//! Records hold keyed digests of pushed values, never the values themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::controller::generator::GeneratorError;
use crate::controller::rules::RuleId;
use crate::provider::{RemoteRef, StoreErrorKind};
use crate::secret::SecretId;

const STATE_FILE_VERSION: u32 = 1;
const PERSIST_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("state file {path} is not valid: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("state file {path} has unsupported version {version}")]
    Version { path: PathBuf, version: u32 },
}

/// Per-destination state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    Pending,
    Pushing,
    Synced,
    Failed,
}

impl SyncPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Pending => "Pending",
            SyncPhase::Pushing => "Pushing",
            SyncPhase::Synced => "Synced",
            SyncPhase::Failed => "Failed",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a push failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    InvalidInput,
    Unauthenticated,
    Unavailable,
    Conflict,
    ExhaustedAlphabet,
    GeneratorConstraint,
    UpstreamAuth,
    Internal,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidInput => "InvalidInput",
            FailureKind::Unauthenticated => "Unauthenticated",
            FailureKind::Unavailable => "Unavailable",
            FailureKind::Conflict => "Conflict",
            FailureKind::ExhaustedAlphabet => "ExhaustedAlphabet",
            FailureKind::GeneratorConstraint => "GeneratorConstraint",
            FailureKind::UpstreamAuth => "UpstreamAuth",
            FailureKind::Internal => "Internal",
        }
    }

    /// Fatal for this attempt: no backoff, wait for the next refresh or change
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FailureKind::InvalidInput
                | FailureKind::ExhaustedAlphabet
                | FailureKind::GeneratorConstraint
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<StoreErrorKind> for FailureKind {
    fn from(kind: StoreErrorKind) -> Self {
        match kind {
            StoreErrorKind::Unauthenticated => FailureKind::Unauthenticated,
            StoreErrorKind::Unavailable => FailureKind::Unavailable,
            StoreErrorKind::Conflict => FailureKind::Conflict,
            StoreErrorKind::InvalidInput => FailureKind::InvalidInput,
        }
    }
}

impl From<&GeneratorError> for FailureKind {
    fn from(err: &GeneratorError) -> Self {
        match err {
            GeneratorError::InvalidSpec(_) => FailureKind::GeneratorConstraint,
            GeneratorError::ExhaustedAlphabet { .. } => FailureKind::ExhaustedAlphabet,
            GeneratorError::UpstreamAuth(_) => FailureKind::UpstreamAuth,
            GeneratorError::Unavailable(_) => FailureKind::Unavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOutcome {
    /// At least one value was written
    Pushed,
    /// Nothing to write
    Unchanged,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    pub kind: FailureKind,
    /// Sanitized; never contains secret values
    pub message: String,
    pub at: DateTime<Utc>,
}

/// One remote location written for a destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushedEntry {
    pub remote: RemoteRef,
    /// Keyed digest of the value as written
    pub hash: String,
}

/// Sync state of one (secret, destination) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub secret: SecretId,
    pub rule: RuleId,
    pub store: String,
    pub phase: SyncPhase,
    #[serde(default)]
    pub last_pushed_version: Option<u64>,
    #[serde(default)]
    pub last_pushed_hash: Option<String>,
    /// Generator spec fingerprint of generated sources
    #[serde(default)]
    pub source_fingerprint: Option<String>,
    /// Expiry of a pushed provider token
    #[serde(default)]
    pub value_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pushed: Vec<PushedEntry>,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_outcome: Option<SyncOutcome>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_failure: Option<FailureInfo>,
}

impl SyncRecord {
    #[must_use]
    pub fn new(secret: SecretId, rule: RuleId, store: String) -> Self {
        Self {
            secret,
            rule,
            store,
            phase: SyncPhase::Pending,
            last_pushed_version: None,
            last_pushed_hash: None,
            source_fingerprint: None,
            value_expires_at: None,
            pushed: Vec::new(),
            last_attempt: None,
            last_success: None,
            last_outcome: None,
            retry_count: 0,
            last_failure: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.secret.clone(), &self.rule, &self.store)
    }

    /// Hash previously written to `remote`
    #[must_use]
    pub fn entry_hash(&self, remote: &RemoteRef) -> Option<&str> {
        self.pushed
            .iter()
            .find(|entry| &entry.remote == remote)
            .map(|entry| entry.hash.as_str())
    }

    /// Record a successful write of one entry
    pub fn set_entry_hash(&mut self, remote: &RemoteRef, hash: String) {
        match self.pushed.iter_mut().find(|entry| &entry.remote == remote) {
            Some(entry) => entry.hash = hash,
            None => self.pushed.push(PushedEntry {
                remote: remote.clone(),
                hash,
            }),
        }
    }
}

/// `(secret-namespace, secret-name, destination-id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub secret: SecretId,
    /// `<rule-namespace>/<rule-name>/<store>`
    pub destination: String,
}

impl RecordKey {
    #[must_use]
    pub fn new(secret: SecretId, rule: &RuleId, store: &str) -> Self {
        Self {
            secret,
            destination: destination_id(rule, store),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.secret, self.destination)
    }
}

#[must_use]
pub fn destination_id(rule: &RuleId, store: &str) -> String {
    format!("{}/{}/{}", rule.namespace, rule.name, store)
}

pub type StateSnapshot = Arc<BTreeMap<RecordKey, SyncRecord>>;

#[derive(Serialize, Deserialize)]
struct StateFile {
    version: u32,
    records: BTreeMap<String, SyncRecord>,
}

pub struct StateStore {
    tx: watch::Sender<StateSnapshot>,
}

impl StateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_records(BTreeMap::new())
    }

    #[must_use]
    pub fn with_records(records: BTreeMap<RecordKey, SyncRecord>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(records));
        Self { tx }
    }

    /// Load a state file; a missing file yields an empty store
    ///
    /// Records left in `Pushing` by a crash are reset to `Pending`.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {}, starting empty", path.display());
                return Ok(Self::new());
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let file: StateFile = serde_json::from_str(&raw).map_err(|source| StateError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if file.version != STATE_FILE_VERSION {
            return Err(StateError::Version {
                path: path.to_path_buf(),
                version: file.version,
            });
        }

        let records: BTreeMap<RecordKey, SyncRecord> = file
            .records
            .into_values()
            .map(|mut record| {
                if record.phase == SyncPhase::Pushing {
                    record.phase = SyncPhase::Pending;
                }
                (record.key(), record)
            })
            .collect();
        info!("Loaded {} sync records from {}", records.len(), path.display());
        Ok(Self::with_records(records))
    }

    /// Current table; cheap, never blocks writers for long
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        Arc::clone(&self.tx.borrow())
    }

    /// Receiver notified on every change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn get(&self, key: &RecordKey) -> Option<SyncRecord> {
        self.tx.borrow().get(key).cloned()
    }

    /// Create-or-update a record and return the updated copy
    pub fn update(
        &self,
        key: &RecordKey,
        init: impl FnOnce() -> SyncRecord,
        apply: impl FnOnce(&mut SyncRecord),
    ) -> SyncRecord {
        let mut updated = None;
        self.tx.send_modify(|snapshot| {
            let records = Arc::make_mut(snapshot);
            let record = records.entry(key.clone()).or_insert_with(init);
            apply(record);
            updated = Some(record.clone());
        });
        // send_modify always runs the closure
        updated.unwrap_or_else(|| unreachable!("send_modify did not run"))
    }

    pub fn remove(&self, key: &RecordKey) -> Option<SyncRecord> {
        let mut removed = None;
        self.tx.send_if_modified(|snapshot| {
            if !snapshot.contains_key(key) {
                return false;
            }
            removed = Arc::make_mut(snapshot).remove(key);
            true
        });
        removed
    }

    /// Remove every record matching `predicate`
    pub fn remove_where(&self, predicate: impl Fn(&SyncRecord) -> bool) -> usize {
        let mut removed = 0;
        self.tx.send_if_modified(|snapshot| {
            if !snapshot.values().any(&predicate) {
                return false;
            }
            let records = Arc::make_mut(snapshot);
            let before = records.len();
            records.retain(|_, record| !predicate(record));
            removed = before - records.len();
            true
        });
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write changes to `path` in the background
    pub fn spawn_persister(&self, path: PathBuf) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                tokio::time::sleep(PERSIST_DEBOUNCE).await;
                let snapshot = Arc::clone(&rx.borrow_and_update());
                let target = path.clone();
                match tokio::task::spawn_blocking(move || write_state_file(&target, &snapshot)).await {
                    Ok(Ok(())) => debug!("Persisted sync state to {}", path.display()),
                    Ok(Err(e)) => error!("{e}"),
                    Err(e) => error!("State persister task failed: {e}"),
                }
            }
            warn!("State persister stopped: state store dropped");
        })
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("records", &self.len())
            .finish()
    }
}

/// Atomically replace `path` with `snapshot` (temp file in the same directory, then rename)
pub fn write_state_file(path: &Path, snapshot: &BTreeMap<RecordKey, SyncRecord>) -> Result<(), StateError> {
    let write_error = |source| StateError::Write {
        path: path.to_path_buf(),
        source,
    };
    let file = StateFile {
        version: STATE_FILE_VERSION,
        records: snapshot
            .iter()
            .map(|(key, record)| (key.to_string(), record.clone()))
            .collect(),
    };
    let encoded = serde_json::to_vec_pretty(&file).map_err(|source| StateError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(write_error)?;
    temp.write_all(&encoded).map_err(write_error)?;
    temp.as_file().sync_all().map_err(write_error)?;
    temp.persist(path).map_err(|e| write_error(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RecordKey {
        RecordKey::new(
            SecretId::new("payments", "db-credentials"),
            &RuleId::new("payments", "db-credentials"),
            "vault-r1",
        )
    }

    fn init() -> SyncRecord {
        SyncRecord::new(
            SecretId::new("payments", "db-credentials"),
            RuleId::new("payments", "db-credentials"),
            "vault-r1".to_string(),
        )
    }

    #[test]
    fn test_key_format() {
        assert_eq!(
            key().to_string(),
            "payments/db-credentials|payments/db-credentials/vault-r1"
        );
        assert_eq!(init().key(), key());
    }

    #[test]
    fn test_snapshots_are_isolated_from_updates() {
        let store = StateStore::new();
        let before = store.snapshot();
        store.update(&key(), init, |record| record.phase = SyncPhase::Synced);
        assert!(before.is_empty());
        assert_eq!(store.snapshot()[&key()].phase, SyncPhase::Synced);
    }

    #[test]
    fn test_update_creates_then_mutates() {
        let store = StateStore::new();
        let record = store.update(&key(), init, |record| record.retry_count += 1);
        assert_eq!(record.retry_count, 1);
        let record = store.update(&key(), init, |record| record.retry_count += 1);
        assert_eq!(record.retry_count, 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_where() {
        let store = StateStore::new();
        store.update(&key(), init, |_| {});
        assert_eq!(store.remove_where(|record| record.store == "other"), 0);
        assert_eq!(store.remove_where(|record| record.store == "vault-r1"), 1);
        assert!(store.is_empty());
        assert!(store.remove(&key()).is_none());
    }

    #[test]
    fn test_entry_hashes() {
        let mut record = init();
        let remote = RemoteRef::new("payments/db", Some("password".to_string()));
        assert!(record.entry_hash(&remote).is_none());
        record.set_entry_hash(&remote, "aa".to_string());
        record.set_entry_hash(&remote, "bb".to_string());
        assert_eq!(record.entry_hash(&remote), Some("bb"));
        assert_eq!(record.pushed.len(), 1);
    }

    #[test]
    fn test_state_file_round_trip_resets_pushing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::new();
        store.update(&key(), init, |record| {
            record.phase = SyncPhase::Pushing;
            record.last_pushed_hash = Some("abc".to_string());
        });
        write_state_file(&path, &store.snapshot()).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("payments/db-credentials|payments/db-credentials/vault-r1"));

        let loaded = StateStore::load(&path).unwrap();
        let record = loaded.get(&key()).unwrap();
        assert_eq!(record.phase, SyncPhase::Pending);
        assert_eq!(record.last_pushed_hash.as_deref(), Some("abc"));
    }

    #[test]
    fn test_missing_state_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StateStore::load(&dir.path().join("absent.json")).unwrap().is_empty());
    }

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(FailureKind::from(StoreErrorKind::Conflict), FailureKind::Conflict);
        assert!(FailureKind::from(&GeneratorError::ExhaustedAlphabet {
            class: "digit",
            requested: 11,
            available: 10
        })
        .is_fatal());
        assert!(!FailureKind::from(&GeneratorError::Unavailable("down".to_string())).is_fatal());
    }
}
