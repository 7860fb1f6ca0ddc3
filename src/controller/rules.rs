//! # Push Rules
//!
//! Validated, in-memory form of a `PushSecret` spec.
//!
//! A [`PushRule`] binds a source (a secret selected by name or labels, or a
//! generator) to one or more destinations. Every check that can be done
//! without the secret's content happens in [`PushRule::from_spec`], so an
//! ambiguous mapping is rejected when the rule is loaded instead of when a
//! value is pushed.

use base64::{engine::general_purpose, Engine as _};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::constants::MIN_REFRESH_INTERVAL_SECS;
use crate::controller::duration::{parse_refresh_interval, DurationError};
use crate::controller::generator::{Generator, GeneratorError};
use crate::crd::{PushSecretSpec, ValueEncoding};
use crate::provider::RemoteRef;
use crate::secret::{hex_digest, Secret, SecretId, SecretValue};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]*)\}").expect("placeholder regex is valid"));

/// Identity of a rule: the `PushSecret` namespace and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId {
    pub namespace: String,
    pub name: String,
}

impl RuleId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("rule must have at least one destination")]
    NoDestinations,
    #[error("store '{0}' appears in more than one destination")]
    DuplicateStore(String),
    #[error("destination store name cannot be empty")]
    EmptyStoreName,
    #[error("source must set exactly one of secret.name, secret.labels, generator")]
    AmbiguousSource,
    #[error("secret.labels cannot be empty")]
    EmptyLabelSelector,
    #[error("store '{store}': secretKey cannot be empty")]
    EmptySecretKey { store: String },
    #[error("store '{store}': remoteKey for '{secret_key}' cannot be empty")]
    EmptyRemoteKey { store: String, secret_key: String },
    #[error("store '{store}': property for '{secret_key}' cannot be empty")]
    EmptyProperty { store: String, secret_key: String },
    #[error("store '{store}': unknown placeholder '${{{placeholder}}}' in remoteKey '{remote_key}'")]
    UnknownPlaceholder {
        store: String,
        remote_key: String,
        placeholder: String,
    },
    #[error("store '{store}': keys '{first}' and '{second}' both map to {remote}")]
    AliasedRemote {
        store: String,
        first: String,
        second: String,
        remote: String,
    },
    #[error("store '{store}': remote key '{remote_key}' is used both as a whole value and with properties")]
    MixedProperty { store: String, remote_key: String },
    #[error("store '{store}': remoteKey '{remote_key}' must contain ${{name}} when secrets are selected by labels")]
    SelectorNeedsName { store: String, remote_key: String },
    #[error("store '{store}': generator produces key '{expected}', mapping references '{secret_key}'")]
    UnknownGeneratedKey {
        store: String,
        secret_key: String,
        expected: String,
    },
    #[error("invalid refreshInterval: {0}")]
    RefreshInterval(#[from] DurationError),
    #[error(transparent)]
    Generator(#[from] GeneratorError),
}

/// Raised at push time when a secret does not fit the rule's mappings
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("secret {secret} has no key '{key}'")]
    MissingKey { secret: SecretId, key: String },
    #[error("secret {0} has no data")]
    Empty(SecretId),
}

/// How secrets are selected, within the rule namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSelector {
    Name(String),
    Labels(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    Selector(SecretSelector),
    Generator {
        generator: Generator,
        /// Key the generated value is exposed under
        key: String,
        /// SHA-256 of the generator spec; a change forces regeneration
        fingerprint: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Push once; a synced destination ignores later changes
    Never,
    Every(Duration),
}

impl RefreshPolicy {
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        match self {
            RefreshPolicy::Never => None,
            RefreshPolicy::Every(interval) => Some(*interval),
        }
    }
}

/// Local key to remote location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMapping {
    pub secret_key: String,
    /// Remote key template (`${namespace}`, `${name}`)
    pub remote_key: String,
    pub property: Option<String>,
    pub encoding: ValueEncoding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub store: String,
    /// Empty means every key to `<namespace>/<name>` with the key as property
    pub mappings: Vec<KeyMapping>,
}

/// One value to write
#[derive(Debug, Clone)]
pub struct PlannedEntry {
    pub remote: RemoteRef,
    pub value: SecretValue,
}

impl PlannedEntry {
    /// Hash of the value as written, used for per-entry idempotence
    #[must_use]
    pub fn value_hash(&self) -> String {
        self.value.digest()
    }
}

/// Hash over every planned remote location and value
///
/// Changes when a value changes and also when the mapping changes.
#[must_use]
pub fn payload_hash(entries: &[PlannedEntry]) -> String {
    let mut sorted: Vec<&PlannedEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.remote.cmp(&b.remote));
    let mut hasher = Sha256::new();
    for entry in sorted {
        crate::secret::update_framed(&mut hasher, entry.remote.key.as_bytes());
        crate::secret::update_framed(
            &mut hasher,
            entry.remote.property.as_deref().unwrap_or("").as_bytes(),
        );
        crate::secret::update_framed(&mut hasher, entry.value_hash().as_bytes());
    }
    hex_digest(&hasher.finalize())
}

/// Substitute `${namespace}` and `${name}`
#[must_use]
pub fn render_remote_key(template: &str, secret: &SecretId) -> String {
    template
        .replace("${namespace}", &secret.namespace)
        .replace("${name}", &secret.name)
}

impl Destination {
    /// Compute the values to write for `secret`
    pub fn plan(&self, secret: &Secret) -> Result<Vec<PlannedEntry>, PlanError> {
        if self.mappings.is_empty() {
            if secret.data.is_empty() {
                return Err(PlanError::Empty(secret.id.clone()));
            }
            let remote_key = format!("{}/{}", secret.id.namespace, secret.id.name);
            return Ok(secret
                .data
                .iter()
                .map(|(key, value)| PlannedEntry {
                    remote: RemoteRef::new(remote_key.clone(), Some(key.clone())),
                    value: value.clone(),
                })
                .collect());
        }

        self.mappings
            .iter()
            .map(|mapping| {
                let value =
                    secret
                        .data
                        .get(&mapping.secret_key)
                        .ok_or_else(|| PlanError::MissingKey {
                            secret: secret.id.clone(),
                            key: mapping.secret_key.clone(),
                        })?;
                let value = match mapping.encoding {
                    ValueEncoding::None => value.clone(),
                    ValueEncoding::Base64 => {
                        SecretValue::from(general_purpose::STANDARD.encode(value.as_bytes()))
                    }
                };
                Ok(PlannedEntry {
                    remote: RemoteRef::new(
                        render_remote_key(&mapping.remote_key, &secret.id),
                        mapping.property.clone(),
                    ),
                    value,
                })
            })
            .collect()
    }
}

/// Validated `PushSecret`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRule {
    pub id: RuleId,
    pub source: RuleSource,
    pub destinations: Vec<Destination>,
    pub refresh: RefreshPolicy,
    pub max_retries: u32,
    pub drift_detection: bool,
}

impl PushRule {
    /// Validate a spec
    ///
    /// # Errors
    /// Returns the first [`ValidationError`] found; a rule is accepted whole or not at all.
    pub fn from_spec(
        id: RuleId,
        spec: &PushSecretSpec,
        default_max_retries: u32,
    ) -> Result<Self, ValidationError> {
        let source = Self::source_from_spec(spec)?;
        let refresh = match parse_refresh_interval(&spec.refresh_interval, MIN_REFRESH_INTERVAL_SECS)? {
            Some(interval) => RefreshPolicy::Every(interval),
            None => RefreshPolicy::Never,
        };

        if spec.destinations.is_empty() {
            return Err(ValidationError::NoDestinations);
        }

        let mut stores = HashSet::new();
        let mut destinations = Vec::with_capacity(spec.destinations.len());
        for destination in &spec.destinations {
            let store = destination.store_ref.name.trim().to_string();
            if store.is_empty() {
                return Err(ValidationError::EmptyStoreName);
            }
            if !stores.insert(store.clone()) {
                return Err(ValidationError::DuplicateStore(store));
            }

            let mappings: Vec<KeyMapping> = destination
                .data
                .iter()
                .map(|mapping| KeyMapping {
                    secret_key: mapping.secret_key.clone(),
                    remote_key: mapping.remote_ref.remote_key.trim().to_string(),
                    property: mapping.remote_ref.property.clone(),
                    encoding: mapping.encoding,
                })
                .collect();
            validate_mappings(&id, &store, &source, &mappings)?;
            destinations.push(Destination { store, mappings });
        }

        Ok(Self {
            id,
            source,
            destinations,
            refresh,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            drift_detection: spec.drift_detection,
        })
    }

    fn source_from_spec(spec: &PushSecretSpec) -> Result<RuleSource, ValidationError> {
        let selector = spec.source.secret.as_ref();
        let name = selector.and_then(|s| s.name.as_ref());
        let labels = selector.and_then(|s| s.labels.as_ref());

        match (name, labels, &spec.source.generator) {
            (Some(name), None, None) if !name.trim().is_empty() => Ok(RuleSource::Selector(
                SecretSelector::Name(name.trim().to_string()),
            )),
            (None, Some(labels), None) => {
                if labels.is_empty() {
                    return Err(ValidationError::EmptyLabelSelector);
                }
                Ok(RuleSource::Selector(SecretSelector::Labels(labels.clone())))
            }
            (None, None, Some(generator_spec)) => {
                let generator = Generator::from_spec(generator_spec)?;
                let key = generator_spec
                    .key
                    .clone()
                    .filter(|key| !key.trim().is_empty())
                    .unwrap_or_else(|| generator.default_key().to_string());
                let encoded = serde_json::to_vec(generator_spec).unwrap_or_default();
                Ok(RuleSource::Generator {
                    generator,
                    key,
                    fingerprint: hex_digest(&Sha256::digest(&encoded)),
                })
            }
            _ => Err(ValidationError::AmbiguousSource),
        }
    }

    /// Whether `secret` is selected by this rule
    #[must_use]
    pub fn matches(&self, secret: &Secret) -> bool {
        if secret.id.namespace != self.id.namespace {
            return false;
        }
        match &self.source {
            RuleSource::Selector(SecretSelector::Name(name)) => &secret.id.name == name,
            RuleSource::Selector(SecretSelector::Labels(labels)) => secret.matches_labels(labels),
            RuleSource::Generator { .. } => false,
        }
    }

    /// Identity of the secret a generator rule produces
    #[must_use]
    pub fn generated_secret_id(&self) -> Option<SecretId> {
        match self.source {
            RuleSource::Generator { .. } => {
                Some(SecretId::new(self.id.namespace.clone(), self.id.name.clone()))
            }
            RuleSource::Selector(_) => None,
        }
    }

    #[must_use]
    pub fn destination(&self, store: &str) -> Option<&Destination> {
        self.destinations.iter().find(|d| d.store == store)
    }

    #[must_use]
    pub fn references_store(&self, store: &str) -> bool {
        self.destination(store).is_some()
    }
}

fn validate_mappings(
    rule: &RuleId,
    store: &str,
    source: &RuleSource,
    mappings: &[KeyMapping],
) -> Result<(), ValidationError> {
    // Every secret a rule can match lives in the rule namespace, and a name
    // selector fixes the name too, so both are substituted before comparing.
    let known_name = match source {
        RuleSource::Selector(SecretSelector::Name(name)) => Some(name.as_str()),
        RuleSource::Selector(SecretSelector::Labels(_)) => None,
        RuleSource::Generator { .. } => Some(rule.name.as_str()),
    };

    let mut seen: HashMap<(String, Option<String>), &str> = HashMap::new();
    let mut whole: HashMap<String, bool> = HashMap::new();

    for mapping in mappings {
        if mapping.secret_key.trim().is_empty() {
            return Err(ValidationError::EmptySecretKey {
                store: store.to_string(),
            });
        }
        if mapping.remote_key.is_empty() {
            return Err(ValidationError::EmptyRemoteKey {
                store: store.to_string(),
                secret_key: mapping.secret_key.clone(),
            });
        }
        if mapping.property.as_deref().is_some_and(|p| p.trim().is_empty()) {
            return Err(ValidationError::EmptyProperty {
                store: store.to_string(),
                secret_key: mapping.secret_key.clone(),
            });
        }
        for captures in PLACEHOLDER.captures_iter(&mapping.remote_key) {
            let placeholder = &captures[1];
            if placeholder != "namespace" && placeholder != "name" {
                return Err(ValidationError::UnknownPlaceholder {
                    store: store.to_string(),
                    remote_key: mapping.remote_key.clone(),
                    placeholder: placeholder.to_string(),
                });
            }
        }
        if let RuleSource::Selector(SecretSelector::Labels(_)) = source {
            if !mapping.remote_key.contains("${name}") {
                return Err(ValidationError::SelectorNeedsName {
                    store: store.to_string(),
                    remote_key: mapping.remote_key.clone(),
                });
            }
        }
        if let RuleSource::Generator { key, .. } = source {
            if &mapping.secret_key != key {
                return Err(ValidationError::UnknownGeneratedKey {
                    store: store.to_string(),
                    secret_key: mapping.secret_key.clone(),
                    expected: key.clone(),
                });
            }
        }

        let mut resolved = mapping.remote_key.replace("${namespace}", &rule.namespace);
        if let Some(name) = known_name {
            resolved = resolved.replace("${name}", name);
        }

        let is_whole = mapping.property.is_none();
        if let Some(previous) = whole.insert(resolved.clone(), is_whole) {
            if previous != is_whole {
                return Err(ValidationError::MixedProperty {
                    store: store.to_string(),
                    remote_key: resolved,
                });
            }
        }

        let slot = (resolved, mapping.property.clone());
        if let Some(first) = seen.get(&slot) {
            let remote = RemoteRef::new(slot.0.clone(), slot.1.clone());
            return Err(ValidationError::AliasedRemote {
                store: store.to_string(),
                first: (*first).to_string(),
                second: mapping.secret_key.clone(),
                remote: remote.to_string(),
            });
        }
        seen.insert(slot, &mapping.secret_key);
    }
    Ok(())
}
