//! # PushSecret Spec
//!
//! Declares which secrets are pushed to which stores.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::DEFAULT_REFRESH_INTERVAL;
use crate::crd::GeneratorSpec;

/// PushSecret Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: secretpush.microscaler.io/v1alpha1
/// kind: PushSecret
/// metadata:
///   name: db-credentials
///   namespace: payments
/// spec:
///   source:
///     secret:
///       name: db-credentials
///   destinations:
///     - storeRef:
///         name: vault-r1
///       data:
///         - secretKey: password
///           remoteRef:
///             remoteKey: payments/db
///             property: password
///     - storeRef:
///         name: vault-r2
///   refreshInterval: 1h
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "PushSecret",
    group = "secretpush.microscaler.io",
    version = "v1alpha1",
    namespaced,
    status = "crate::crd::PushSecretStatus",
    shortname = "ps",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}, {"name":"Refresh", "type":"string", "jsonPath":".spec.refreshInterval"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PushSecretSpec {
    /// What to push: an existing secret (by name or labels) or a generator
    pub source: SourceSpec,
    /// Destinations, each pushed and tracked independently
    pub destinations: Vec<DestinationSpec>,
    /// How often pushed values are re-checked
    /// Format: Kubernetes duration string (e.g., "30s", "5m", "1h")
    /// "0" or "never" pushes once and then ignores further changes
    /// Default: "1h"
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: String,
    /// Backoff retries after a failed push before waiting for the next refresh tick
    /// Default: controller-wide `DEFAULT_MAX_RETRIES`
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Read remote values on every refresh tick and re-push when they were modified out of band
    #[serde(default)]
    pub drift_detection: bool,
}

/// Default value for `refreshInterval`
pub fn default_refresh_interval() -> String {
    DEFAULT_REFRESH_INTERVAL.to_string()
}

/// Source of the pushed data; exactly one field must be set
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// Existing secret(s) in the PushSecret namespace
    #[serde(default)]
    pub secret: Option<SecretSelectorSpec>,
    /// Value produced by a generator
    #[serde(default)]
    pub generator: Option<GeneratorSpec>,
}

/// Secret selector; exactly one of `name` or `labels`
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretSelectorSpec {
    #[serde(default)]
    pub name: Option<String>,
    /// Label set; every label must match
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

/// One destination store
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DestinationSpec {
    pub store_ref: StoreRefSpec,
    /// Key mappings. When empty, every key is pushed to remote key
    /// `<namespace>/<name>` under a property named after the key.
    #[serde(default)]
    pub data: Vec<KeyMappingSpec>,
}

/// Reference to a `ClusterSecretStore`
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoreRefSpec {
    pub name: String,
}

/// Maps one local key to one remote location
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyMappingSpec {
    pub secret_key: String,
    pub remote_ref: RemoteRefSpec,
    /// Encoding applied to the value before it is written
    #[serde(default)]
    pub encoding: ValueEncoding,
}

/// Remote location
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRefSpec {
    /// Remote key; may contain `${namespace}` and `${name}` of the matched secret
    pub remote_key: String,
    /// Field within the remote key
    #[serde(default)]
    pub property: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize, schemars::JsonSchema)]
pub enum ValueEncoding {
    #[default]
    None,
    Base64,
}
