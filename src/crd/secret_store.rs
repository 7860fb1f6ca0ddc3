//! # ClusterSecretStore Spec
//!
//! Destination backends. Each store names exactly one provider.
//! Credentials are never stored in the resource itself; they are referenced
//! through environment variables or files mounted into the controller pod.

use serde::{Deserialize, Serialize};

/// ClusterSecretStore Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: secretpush.microscaler.io/v1alpha1
/// kind: ClusterSecretStore
/// metadata:
///   name: vault-r1
/// spec:
///   provider:
///     vault:
///       server: https://vault.r1.example.com
///       mountPath: secret
///       auth:
///         kubernetes:
///           role: push-secret-controller
///   timeoutSeconds: 30
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ClusterSecretStore",
    group = "secretpush.microscaler.io",
    version = "v1alpha1",
    shortname = "css"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSecretStoreSpec {
    pub provider: StoreProviderSpec,
    /// Deadline for a single call to the store
    /// Default: controller-wide `BACKEND_TIMEOUT_SECS`
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Provider selection; exactly one field must be set
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoreProviderSpec {
    #[serde(default)]
    pub vault: Option<VaultProviderSpec>,
    #[serde(default)]
    pub infisical: Option<InfisicalProviderSpec>,
    #[serde(default)]
    pub aws: Option<AwsProviderSpec>,
    #[serde(default)]
    pub gcp: Option<GcpProviderSpec>,
    /// In-process store, for local development and dry runs
    #[serde(default)]
    pub memory: Option<MemoryProviderSpec>,
}

impl StoreProviderSpec {
    /// Number of providers set; valid specs have exactly one
    #[must_use]
    pub fn configured_count(&self) -> usize {
        [
            self.vault.is_some(),
            self.infisical.is_some(),
            self.aws.is_some(),
            self.gcp.is_some(),
            self.memory.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

/// Reference to a credential available to the controller process
///
/// Exactly one of `env` or `file` must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvSecretRef {
    /// Environment variable name
    #[serde(default)]
    pub env: Option<String>,
    /// File path (e.g. a mounted Kubernetes Secret)
    #[serde(default)]
    pub file: Option<String>,
}

/// HashiCorp Vault KV version 2
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VaultProviderSpec {
    /// Vault address, e.g. `https://vault.example.com:8200`
    pub server: String,
    /// KV v2 mount path
    /// Default: "secret"
    #[serde(default)]
    pub mount_path: Option<String>,
    /// Vault Enterprise namespace
    #[serde(default)]
    pub namespace: Option<String>,
    pub auth: VaultAuthSpec,
}

/// Vault auth method; exactly one field must be set
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VaultAuthSpec {
    #[serde(default)]
    pub token: Option<VaultTokenAuthSpec>,
    #[serde(default)]
    pub kubernetes: Option<VaultKubernetesAuthSpec>,
    #[serde(default)]
    pub app_role: Option<VaultAppRoleAuthSpec>,
}

/// Static token
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VaultTokenAuthSpec {
    pub token_ref: EnvSecretRef,
}

/// Kubernetes auth method using the controller's service account token
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VaultKubernetesAuthSpec {
    pub role: String,
    /// Auth mount path
    /// Default: "kubernetes"
    #[serde(default)]
    pub mount_path: Option<String>,
    /// Service account token file
    /// Default: the projected token of the controller pod
    #[serde(default)]
    pub service_account_token_path: Option<String>,
}

/// AppRole auth method
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VaultAppRoleAuthSpec {
    pub role_id: String,
    pub secret_id_ref: EnvSecretRef,
    /// Auth mount path
    /// Default: "approle"
    #[serde(default)]
    pub mount_path: Option<String>,
}

/// Infisical project environment
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfisicalProviderSpec {
    /// API host
    /// Default: `https://app.infisical.com`
    #[serde(default)]
    pub host_api: Option<String>,
    pub project_id: String,
    /// Environment slug, e.g. "prod"
    pub environment: String,
    /// Folder path
    /// Default: "/"
    #[serde(default)]
    pub secret_path: Option<String>,
    pub auth: InfisicalAuthSpec,
}

#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfisicalAuthSpec {
    pub universal_auth: UniversalAuthSpec,
}

/// Machine identity universal auth
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UniversalAuthSpec {
    pub client_id_ref: EnvSecretRef,
    pub client_secret_ref: EnvSecretRef,
}

/// AWS Secrets Manager; credentials come from the default chain (IRSA recommended)
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsProviderSpec {
    /// AWS region (e.g., "us-east-1")
    pub region: String,
}

/// GCP Secret Manager; credentials come from Workload Identity via the metadata server
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpProviderSpec {
    pub project_id: String,
    /// Override of the Secret Manager REST endpoint
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
pub struct MemoryProviderSpec {}
