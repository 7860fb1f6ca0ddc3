//! # Rules File
//!
//! Stores and rules declared in a YAML file, for clusters without the CRDs
//! installed and for `pushctl validate`.
//!
//! ```yaml
//! stores:
//!   - name: vault-r1
//!     spec:
//!       provider:
//!         vault:
//!           server: https://vault.r1.example.com
//!           auth:
//!             token:
//!               tokenRef:
//!                 env: VAULT_TOKEN
//! rules:
//!   - namespace: payments
//!     name: db-credentials
//!     spec:
//!       source:
//!         generator:
//!           password:
//!             length: 32
//!       destinations:
//!         - storeRef:
//!             name: vault-r1
//! ```
//!
//! A file is accepted whole or not at all.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::controller::rules::{PushRule, RuleId, ValidationError};
use crate::crd::{ClusterSecretStoreSpec, PushSecretSpec};

#[derive(Debug, Error)]
pub enum RulesFileError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("store '{0}' is declared more than once")]
    DuplicateStore(String),
    #[error("store '{store}': {message}")]
    InvalidStore { store: String, message: String },
    #[error("rule {0} is declared more than once")]
    DuplicateRule(RuleId),
    #[error("rule {rule}: {source}")]
    InvalidRule {
        rule: RuleId,
        source: ValidationError,
    },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesFile {
    #[serde(default)]
    pub stores: Vec<StoreEntry>,
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreEntry {
    pub name: String,
    pub spec: ClusterSecretStoreSpec,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleEntry {
    pub namespace: String,
    pub name: String,
    pub spec: PushSecretSpec,
}

/// A validated rules file
#[derive(Debug, Clone)]
pub struct LoadedRules {
    pub stores: Vec<StoreEntry>,
    pub rules: Vec<PushRule>,
}

impl RulesFile {
    /// # Errors
    /// Returns `Read` when the file cannot be read and `Parse` when it is not valid YAML.
    pub fn load(path: &Path) -> Result<Self, RulesFileError> {
        let content = std::fs::read_to_string(path).map_err(|source| RulesFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// # Errors
    /// Returns `Parse` when `content` is not a valid rules file.
    pub fn parse(content: &str) -> Result<Self, RulesFileError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Validate every store and rule
    ///
    /// Rules may reference stores that are not in the file; those are
    /// expected to come from `ClusterSecretStore` resources.
    ///
    /// # Errors
    /// Returns the first problem found.
    pub fn validate(self, default_max_retries: u32) -> Result<LoadedRules, RulesFileError> {
        let mut store_names = HashSet::new();
        for store in &self.stores {
            let name = store.name.trim();
            if name.is_empty() {
                return Err(RulesFileError::InvalidStore {
                    store: store.name.clone(),
                    message: "name cannot be empty".to_string(),
                });
            }
            if !store_names.insert(name.to_string()) {
                return Err(RulesFileError::DuplicateStore(name.to_string()));
            }
            let providers = store.spec.provider.configured_count();
            if providers != 1 {
                return Err(RulesFileError::InvalidStore {
                    store: name.to_string(),
                    message: format!("provider must set exactly one backend (got {providers})"),
                });
            }
        }

        let mut rule_ids = HashSet::new();
        let mut rules = Vec::with_capacity(self.rules.len());
        for entry in &self.rules {
            let id = RuleId::new(entry.namespace.trim(), entry.name.trim());
            if !rule_ids.insert(id.clone()) {
                return Err(RulesFileError::DuplicateRule(id));
            }
            let rule = PushRule::from_spec(id.clone(), &entry.spec, default_max_retries)
                .map_err(|source| RulesFileError::InvalidRule { rule: id, source })?;
            rules.push(rule);
        }

        Ok(LoadedRules {
            stores: self.stores,
            rules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
stores:
  - name: vault-r1
    spec:
      provider:
        memory: {}
  - name: vault-r2
    spec:
      provider:
        memory: {}
      timeoutSeconds: 5
rules:
  - namespace: payments
    name: db-credentials
    spec:
      source:
        generator:
          password:
            length: 24
            digits: 4
            symbols: 2
      destinations:
        - storeRef:
            name: vault-r1
        - storeRef:
            name: vault-r2
"#;

    #[test]
    fn test_valid_file() {
        let loaded = RulesFile::parse(VALID).unwrap().validate(5).unwrap();
        assert_eq!(loaded.stores.len(), 2);
        assert_eq!(loaded.stores[1].spec.timeout_seconds, Some(5));
        assert_eq!(loaded.rules.len(), 1);
        assert_eq!(loaded.rules[0].id, RuleId::new("payments", "db-credentials"));
        assert_eq!(loaded.rules[0].destinations.len(), 2);
    }

    #[test]
    fn test_empty_file_is_valid() {
        let loaded = RulesFile::parse("\n").unwrap().validate(5).unwrap();
        assert!(loaded.stores.is_empty());
        assert!(loaded.rules.is_empty());
    }

    #[test]
    fn test_duplicate_store_rejects_whole_file() {
        let content = r#"
stores:
  - name: a
    spec: { provider: { memory: {} } }
  - name: a
    spec: { provider: { memory: {} } }
"#;
        let err = RulesFile::parse(content).unwrap().validate(5).unwrap_err();
        assert!(matches!(err, RulesFileError::DuplicateStore(name) if name == "a"));
    }

    #[test]
    fn test_store_without_provider_is_rejected() {
        let content = "stores:\n  - name: a\n    spec:\n      provider: {}\n";
        let err = RulesFile::parse(content).unwrap().validate(5).unwrap_err();
        assert!(matches!(err, RulesFileError::InvalidStore { .. }));
    }

    #[test]
    fn test_invalid_rule_names_the_rule() {
        let content = r#"
rules:
  - namespace: payments
    name: broken
    spec:
      source:
        secret:
          name: db
      destinations: []
"#;
        let err = RulesFile::parse(content).unwrap().validate(5).unwrap_err();
        match err {
            RulesFileError::InvalidRule { rule, source } => {
                assert_eq!(rule, RuleId::new("payments", "broken"));
                assert_eq!(source, ValidationError::NoDestinations);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            RulesFile::parse("stores: [").unwrap_err(),
            RulesFileError::Parse(_)
        ));
    }
}
