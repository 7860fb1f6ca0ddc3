//! # Provider Modules
//!
//! Secret store clients that push values to external secret managers.
//!
//! Every backend implements [`SecretStore`]. The backend for a
//! `ClusterSecretStore` is chosen once, when the store is loaded, and held
//! as a [`StoreClient`] variant; the reconciler only ever talks to the trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::crd::ClusterSecretStoreSpec;
use crate::secret::SecretValue;

// Common utilities shared across providers
pub mod common;
pub mod credentials;
mod error;

// Provider implementations
pub mod aws;
pub mod gcp;
pub mod infisical;
pub mod memory;
pub mod vault;

pub use error::{StoreError, StoreErrorKind};

use aws::AwsSecretsManagerClient;
use gcp::GcpSecretManagerClient;
use infisical::InfisicalClient;
use memory::MemoryStore;
use vault::VaultKvClient;

/// Remote location of one pushed value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteRef {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
}

impl RemoteRef {
    pub fn new(key: impl Into<String>, property: Option<String>) -> Self {
        Self {
            key: key.into(),
            property,
        }
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.property {
            Some(property) => write!(f, "{}#{}", self.key, property),
            None => f.write_str(&self.key),
        }
    }
}

/// A value read back from a store
#[derive(Debug, Clone)]
pub struct RemoteValue {
    pub value: SecretValue,
    /// Backend version identifier, when the backend has one
    pub version: Option<String>,
}

/// Backend kind, used as a metrics label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    Vault,
    Infisical,
    AwsSecretsManager,
    GcpSecretManager,
    Memory,
}

impl StoreKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Vault => "vault",
            StoreKind::Infisical => "infisical",
            StoreKind::AwsSecretsManager => "aws",
            StoreKind::GcpSecretManager => "gcp",
            StoreKind::Memory => "memory",
        }
    }
}

/// Write/read/delete access to one external secret store
///
/// Implementations are safe for concurrent calls on distinct remote keys.
/// Writes to the same remote key are serialized by the caller.
#[async_trait]
pub trait SecretStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Write one value, returning the backend's new version identifier
    ///
    /// With `expected_prior_hash`, the write fails with `Conflict` when the
    /// current remote value's digest differs from it.
    async fn write(
        &self,
        remote: &RemoteRef,
        value: &SecretValue,
        expected_prior_hash: Option<&str>,
    ) -> Result<String, StoreError>;

    /// Read one value; `Ok(None)` when the key or property does not exist
    async fn read(&self, remote: &RemoteRef) -> Result<Option<RemoteValue>, StoreError>;

    /// Remove one value (the property only, when one is given)
    async fn delete(&self, remote: &RemoteRef) -> Result<(), StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;

    /// Drop any cached credential so the next call authenticates again
    async fn refresh_credentials(&self) -> Result<(), StoreError>;
}

/// Options shared by every client built from a store spec
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// HTTP request timeout; the reconciler also applies its own deadline
    pub request_timeout: Duration,
    /// Credentials are refreshed this long before they expire
    pub refresh_margin: Duration,
}

/// Tagged store client, selected from the `ClusterSecretStore` spec at load time
#[derive(Debug)]
pub enum StoreClient {
    Vault(VaultKvClient),
    Infisical(InfisicalClient),
    AwsSecretsManager(AwsSecretsManagerClient),
    GcpSecretManager(GcpSecretManagerClient),
    Memory(MemoryStore),
}

impl StoreClient {
    /// Build the client for a store spec
    ///
    /// Does not contact the store; authentication happens lazily on first use.
    ///
    /// # Errors
    /// Returns `InvalidInput` when the spec names no provider or several.
    pub async fn from_spec(
        spec: &ClusterSecretStoreSpec,
        options: &ClientOptions,
    ) -> Result<Self, StoreError> {
        let provider = &spec.provider;
        let configured = provider.configured_count();
        if configured != 1 {
            return Err(StoreError::invalid_input(format!(
                "store provider must set exactly one of vault, infisical, aws, gcp, memory (got {configured})"
            )));
        }

        if let Some(vault) = &provider.vault {
            return VaultKvClient::new(vault, options).map(StoreClient::Vault);
        }
        if let Some(infisical) = &provider.infisical {
            return InfisicalClient::new(infisical, options).map(StoreClient::Infisical);
        }
        if let Some(aws) = &provider.aws {
            return Ok(StoreClient::AwsSecretsManager(
                AwsSecretsManagerClient::new(aws).await,
            ));
        }
        if let Some(gcp) = &provider.gcp {
            return GcpSecretManagerClient::new(gcp, options).map(StoreClient::GcpSecretManager);
        }
        Ok(StoreClient::Memory(MemoryStore::new()))
    }

    fn inner(&self) -> &dyn SecretStore {
        match self {
            StoreClient::Vault(client) => client,
            StoreClient::Infisical(client) => client,
            StoreClient::AwsSecretsManager(client) => client,
            StoreClient::GcpSecretManager(client) => client,
            StoreClient::Memory(client) => client,
        }
    }
}

#[async_trait]
impl SecretStore for StoreClient {
    fn kind(&self) -> StoreKind {
        self.inner().kind()
    }

    async fn write(
        &self,
        remote: &RemoteRef,
        value: &SecretValue,
        expected_prior_hash: Option<&str>,
    ) -> Result<String, StoreError> {
        self.inner().write(remote, value, expected_prior_hash).await
    }

    async fn read(&self, remote: &RemoteRef) -> Result<Option<RemoteValue>, StoreError> {
        self.inner().read(remote).await
    }

    async fn delete(&self, remote: &RemoteRef) -> Result<(), StoreError> {
        self.inner().delete(remote).await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.inner().health_check().await
    }

    async fn refresh_credentials(&self) -> Result<(), StoreError> {
        self.inner().refresh_credentials().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MemoryProviderSpec, StoreProviderSpec};

    fn options() -> ClientOptions {
        ClientOptions {
            request_timeout: Duration::from_secs(5),
            refresh_margin: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_from_spec_rejects_empty_provider() {
        let spec = ClusterSecretStoreSpec {
            provider: StoreProviderSpec::default(),
            timeout_seconds: None,
        };
        let err = StoreClient::from_spec(&spec, &options()).await.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_from_spec_memory() {
        let spec = ClusterSecretStoreSpec {
            provider: StoreProviderSpec {
                memory: Some(MemoryProviderSpec {}),
                ..StoreProviderSpec::default()
            },
            timeout_seconds: None,
        };
        let client = StoreClient::from_spec(&spec, &options()).await.unwrap();
        assert_eq!(client.kind(), StoreKind::Memory);
    }

    #[test]
    fn test_remote_ref_display() {
        assert_eq!(RemoteRef::new("app/db", None).to_string(), "app/db");
        assert_eq!(
            RemoteRef::new("app/db", Some("password".to_string())).to_string(),
            "app/db#password"
        );
    }
}
