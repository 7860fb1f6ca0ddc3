//! # Source Cache
//!
//! Canonical copy of every watched secret, with a revision counter that
//! only moves when the content actually changes. Kubernetes bumps
//! `resourceVersion` on label and annotation edits too; those must not
//! trigger pushes.

use k8s_openapi::api::core::v1::Secret as KubeSecret;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::secret::{content_hash, Secret, SecretId, SecretOrigin, SecretValue};

/// Result of [`SecretCache::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    /// Content changed; the version was bumped
    Updated,
    /// Same content; only labels may have changed
    Unchanged,
}

#[derive(Debug, Default)]
pub struct SecretCache {
    secrets: HashMap<SecretId, (Arc<Secret>, String)>,
}

impl SecretCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a secret's content and labels
    pub fn upsert(
        &mut self,
        id: SecretId,
        data: BTreeMap<String, SecretValue>,
        labels: BTreeMap<String, String>,
    ) -> (Arc<Secret>, UpsertOutcome) {
        let hash = content_hash(&data);
        let (version, outcome) = match self.secrets.get(&id) {
            None => (1, UpsertOutcome::Created),
            Some((existing, existing_hash)) if *existing_hash == hash => {
                (existing.version, UpsertOutcome::Unchanged)
            }
            Some((existing, _)) => (existing.version + 1, UpsertOutcome::Updated),
        };

        let secret = Arc::new(Secret {
            id: id.clone(),
            data,
            version,
            origin: SecretOrigin::OperatorProvided,
            labels,
        });
        self.secrets.insert(id, (Arc::clone(&secret), hash));
        (secret, outcome)
    }

    pub fn remove(&mut self, id: &SecretId) -> Option<Arc<Secret>> {
        self.secrets.remove(id).map(|(secret, _)| secret)
    }

    #[must_use]
    pub fn get(&self, id: &SecretId) -> Option<Arc<Secret>> {
        self.secrets.get(id).map(|(secret, _)| Arc::clone(secret))
    }

    /// Secrets in one namespace
    pub fn in_namespace<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a Arc<Secret>> + 'a {
        self.secrets
            .iter()
            .filter(move |(id, _)| id.namespace == namespace)
            .map(|(_, (secret, _))| secret)
    }

    /// Remove every secret `keep` rejects, returning the removed identities
    pub fn retain(&mut self, mut keep: impl FnMut(&SecretId) -> bool) -> Vec<SecretId> {
        let removed: Vec<SecretId> = self
            .secrets
            .keys()
            .filter(|id| !keep(id))
            .cloned()
            .collect();
        for id in &removed {
            self.secrets.remove(id);
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

/// Identity, data and labels of a Kubernetes `Secret`
///
/// `stringData` entries win over `data` entries with the same key, as the
/// API server would merge them. Returns `None` for objects without a
/// namespace or name.
#[must_use]
pub fn from_kube_secret(
    secret: &KubeSecret,
) -> Option<(SecretId, BTreeMap<String, SecretValue>, BTreeMap<String, String>)> {
    let namespace = secret.metadata.namespace.clone()?;
    let name = secret.metadata.name.clone()?;

    let mut data: BTreeMap<String, SecretValue> = secret
        .data
        .iter()
        .flatten()
        .map(|(key, bytes)| (key.clone(), SecretValue::new(bytes.0.clone())))
        .collect();
    if let Some(string_data) = &secret.string_data {
        for (key, value) in string_data {
            data.insert(key.clone(), SecretValue::from(value.as_str()));
        }
    }

    let labels = secret.metadata.labels.clone().unwrap_or_default();
    Some((SecretId::new(namespace, name), data, labels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, SecretValue> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), SecretValue::from(*v)))
            .collect()
    }

    #[test]
    fn test_version_only_moves_on_content_change() {
        let mut cache = SecretCache::new();
        let id = SecretId::new("payments", "db-credentials");

        let (secret, outcome) = cache.upsert(id.clone(), data(&[("password", "p@ss1")]), BTreeMap::new());
        assert_eq!((secret.version, outcome), (1, UpsertOutcome::Created));

        let labels: BTreeMap<String, String> = [("tier".to_string(), "db".to_string())].into();
        let (secret, outcome) = cache.upsert(id.clone(), data(&[("password", "p@ss1")]), labels);
        assert_eq!((secret.version, outcome), (1, UpsertOutcome::Unchanged));
        assert_eq!(secret.labels.get("tier").map(String::as_str), Some("db"));

        let (secret, outcome) = cache.upsert(id, data(&[("password", "p@ss2")]), BTreeMap::new());
        assert_eq!((secret.version, outcome), (2, UpsertOutcome::Updated));
    }

    #[test]
    fn test_remove_and_retain() {
        let mut cache = SecretCache::new();
        cache.upsert(SecretId::new("a", "one"), data(&[("k", "v")]), BTreeMap::new());
        cache.upsert(SecretId::new("b", "two"), data(&[("k", "v")]), BTreeMap::new());
        assert_eq!(cache.in_namespace("a").count(), 1);

        let removed = cache.retain(|id| id.namespace == "a");
        assert_eq!(removed, vec![SecretId::new("b", "two")]);
        assert!(cache.remove(&SecretId::new("a", "one")).is_some());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_from_kube_secret_merges_string_data() {
        let secret = KubeSecret {
            metadata: ObjectMeta {
                name: Some("db-credentials".to_string()),
                namespace: Some("payments".to_string()),
                labels: Some([("tier".to_string(), "db".to_string())].into()),
                ..ObjectMeta::default()
            },
            data: Some(
                [
                    ("password".to_string(), ByteString(b"old".to_vec())),
                    ("user".to_string(), ByteString(b"app".to_vec())),
                ]
                .into(),
            ),
            string_data: Some([("password".to_string(), "p@ss1".to_string())].into()),
            ..KubeSecret::default()
        };
        let (id, data, labels) = from_kube_secret(&secret).unwrap();
        assert_eq!(id, SecretId::new("payments", "db-credentials"));
        assert_eq!(data["password"].as_bytes(), b"p@ss1");
        assert_eq!(data["user"].as_bytes(), b"app");
        assert_eq!(labels.len(), 1);
    }
}
