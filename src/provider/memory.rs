//! # In-Memory Store
//!
//! Process-local secret store used for dry runs and tests. Supports
//! injecting failures so retry behaviour can be exercised without a real
//! backend.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::controller::locks::lock;
use crate::provider::common::ensure_prior_hash;
use crate::provider::{RemoteRef, RemoteValue, SecretStore, StoreError, StoreErrorKind, StoreKind};
use crate::secret::SecretValue;

#[derive(Debug, Default)]
struct Entry {
    value: Option<SecretValue>,
    properties: BTreeMap<String, SecretValue>,
    version: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    write_faults: Mutex<VecDeque<StoreErrorKind>>,
    read_faults: Mutex<VecDeque<StoreErrorKind>>,
    unhealthy: AtomicBool,
    write_calls: AtomicUsize,
    read_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    credential_refreshes: AtomicUsize,
}

/// In-memory store; clones share the same contents
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` write calls with `kind`
    pub fn fail_writes(&self, kind: StoreErrorKind, times: usize) {
        lock(&self.inner.write_faults).extend(std::iter::repeat_n(kind, times));
    }

    /// Fail the next `times` read calls with `kind`
    pub fn fail_reads(&self, kind: StoreErrorKind, times: usize) {
        lock(&self.inner.read_faults).extend(std::iter::repeat_n(kind, times));
    }

    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.inner.unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    /// Change a value without going through `write`, as another writer would
    pub fn put_out_of_band(&self, remote: &RemoteRef, value: SecretValue) {
        let mut entries = lock(&self.inner.entries);
        store_value(entries.entry(remote.key.clone()).or_default(), remote, value);
    }

    /// Current value, without counting as a read
    #[must_use]
    pub fn get(&self, remote: &RemoteRef) -> Option<SecretValue> {
        lock(&self.inner.entries)
            .get(&remote.key)
            .and_then(|entry| lookup(entry, remote))
    }

    #[must_use]
    pub fn write_calls(&self) -> usize {
        self.inner.write_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn read_calls(&self) -> usize {
        self.inner.read_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.inner.delete_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn credential_refreshes(&self) -> usize {
        self.inner.credential_refreshes.load(Ordering::SeqCst)
    }

    fn injected(faults: &Mutex<VecDeque<StoreErrorKind>>) -> Result<(), StoreError> {
        match lock(faults).pop_front() {
            Some(kind) => Err(StoreError::new(kind, "injected failure")),
            None => Ok(()),
        }
    }
}

fn lookup(entry: &Entry, remote: &RemoteRef) -> Option<SecretValue> {
    match &remote.property {
        Some(property) => entry.properties.get(property).cloned(),
        None => entry.value.clone(),
    }
}

fn store_value(entry: &mut Entry, remote: &RemoteRef, value: SecretValue) {
    match &remote.property {
        Some(property) => {
            entry.properties.insert(property.clone(), value);
        }
        None => entry.value = Some(value),
    }
    entry.version += 1;
}

#[async_trait]
impl SecretStore for MemoryStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }

    async fn write(
        &self,
        remote: &RemoteRef,
        value: &SecretValue,
        expected_prior_hash: Option<&str>,
    ) -> Result<String, StoreError> {
        self.inner.write_calls.fetch_add(1, Ordering::SeqCst);
        Self::injected(&self.inner.write_faults)?;

        let mut entries = lock(&self.inner.entries);
        let entry = entries.entry(remote.key.clone()).or_default();
        ensure_prior_hash(lookup(entry, remote).as_ref(), expected_prior_hash)?;
        store_value(entry, remote, value.clone());
        Ok(entry.version.to_string())
    }

    async fn read(&self, remote: &RemoteRef) -> Result<Option<RemoteValue>, StoreError> {
        self.inner.read_calls.fetch_add(1, Ordering::SeqCst);
        Self::injected(&self.inner.read_faults)?;

        let entries = lock(&self.inner.entries);
        Ok(entries.get(&remote.key).and_then(|entry| {
            lookup(entry, remote).map(|value| RemoteValue {
                value,
                version: Some(entry.version.to_string()),
            })
        }))
    }

    async fn delete(&self, remote: &RemoteRef) -> Result<(), StoreError> {
        self.inner.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut entries = lock(&self.inner.entries);
        match &remote.property {
            Some(property) => {
                if let Some(entry) = entries.get_mut(&remote.key) {
                    entry.properties.remove(property);
                    if entry.properties.is_empty() && entry.value.is_none() {
                        entries.remove(&remote.key);
                    }
                }
            }
            None => {
                entries.remove(&remote.key);
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        if self.inner.unhealthy.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("memory store marked unhealthy"));
        }
        Ok(())
    }

    async fn refresh_credentials(&self) -> Result<(), StoreError> {
        self.inner.credential_refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(key: &str, property: Option<&str>) -> RemoteRef {
        RemoteRef::new(key, property.map(str::to_string))
    }

    #[tokio::test]
    async fn test_write_then_read_is_byte_identical() {
        let store = MemoryStore::new();
        let binary = SecretValue::new(vec![0, 159, 146, 150, 255]);
        let target = remote("app/blob", None);

        store.write(&target, &binary, None).await.unwrap();
        let read = store.read(&target).await.unwrap().unwrap();
        assert_eq!(read.value.as_bytes(), binary.as_bytes());
    }

    #[tokio::test]
    async fn test_poisoned_store_stays_usable() {
        let store = MemoryStore::new();
        let poisoner = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.inner.entries.lock().unwrap();
            panic!("writer panicked");
        })
        .join();
        assert!(store.inner.entries.is_poisoned());

        store
            .write(&remote("app/db", None), &SecretValue::from("v"), None)
            .await
            .unwrap();
        assert!(store.read(&remote("app/db", None)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_properties_are_independent() {
        let store = MemoryStore::new();
        store
            .write(&remote("app/db", Some("user")), &SecretValue::from("admin"), None)
            .await
            .unwrap();
        store
            .write(&remote("app/db", Some("password")), &SecretValue::from("s3cret"), None)
            .await
            .unwrap();

        store.delete(&remote("app/db", Some("user"))).await.unwrap();
        assert!(store.get(&remote("app/db", Some("user"))).is_none());
        assert_eq!(
            store.get(&remote("app/db", Some("password"))).unwrap().as_bytes(),
            b"s3cret"
        );
    }

    #[tokio::test]
    async fn test_prior_hash_conflict() {
        let store = MemoryStore::new();
        let target = remote("app/token", None);
        let first = SecretValue::from("one");
        store.write(&target, &first, None).await.unwrap();
        store.put_out_of_band(&target, SecretValue::from("changed"));

        let err = store
            .write(&target, &SecretValue::from("two"), Some(&first.digest()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let store = MemoryStore::new();
        store.fail_writes(StoreErrorKind::Unavailable, 2);
        let target = remote("k", None);
        let value = SecretValue::from("v");

        assert!(store.write(&target, &value, None).await.is_err());
        assert!(store.write(&target, &value, None).await.is_err());
        assert!(store.write(&target, &value, None).await.is_ok());
        assert_eq!(store.write_calls(), 3);
    }
}
