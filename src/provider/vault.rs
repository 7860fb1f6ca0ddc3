//! Vault KV v2 REST Client
//!
//! Pushes values into a KV version 2 mount using check-and-set writes.
//! A remote key maps to one KV path; properties are fields of the KV data
//! map. Writes without a property use the field `value`.
//!
//! References:
//! - [KV v2 API](https://developer.hashicorp.com/vault/api-docs/secret/kv/kv-v2)
//! - [Kubernetes auth API](https://developer.hashicorp.com/vault/api-docs/auth/kubernetes)

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info_span, Instrument};
use zeroize::Zeroizing;

use crate::constants::{
    DEFAULT_SERVICE_ACCOUNT_TOKEN_PATH, DEFAULT_VAULT_APPROLE_AUTH_PATH,
    DEFAULT_VAULT_KUBERNETES_AUTH_PATH, DEFAULT_VAULT_MOUNT_PATH, VAULT_DEFAULT_PROPERTY,
};
use crate::crd::{VaultAuthSpec, VaultProviderSpec};
use crate::provider::common::{
    classify_status, ensure_prior_hash, error_from_response, field_value, transport_error,
    truncate_body, value_as_text,
};
use crate::provider::credentials::{resolve_secret_ref, IssuedToken, TokenCache};
use crate::provider::{
    ClientOptions, RemoteRef, RemoteValue, SecretStore, StoreError, StoreErrorKind, StoreKind,
};
use crate::secret::SecretValue;

/// Auth method, resolved from the store spec
#[derive(Debug, Clone)]
enum VaultAuth {
    Token(crate::crd::EnvSecretRef),
    Kubernetes {
        mount_path: String,
        role: String,
        jwt_path: String,
    },
    AppRole {
        mount_path: String,
        role_id: String,
        secret_id: crate::crd::EnvSecretRef,
    },
}

impl VaultAuth {
    fn from_spec(spec: &VaultAuthSpec) -> Result<Self, StoreError> {
        match (&spec.token, &spec.kubernetes, &spec.app_role) {
            (Some(token), None, None) => Ok(VaultAuth::Token(token.token_ref.clone())),
            (None, Some(k8s), None) => Ok(VaultAuth::Kubernetes {
                mount_path: k8s
                    .mount_path
                    .clone()
                    .unwrap_or_else(|| DEFAULT_VAULT_KUBERNETES_AUTH_PATH.to_string()),
                role: k8s.role.clone(),
                jwt_path: k8s
                    .service_account_token_path
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SERVICE_ACCOUNT_TOKEN_PATH.to_string()),
            }),
            (None, None, Some(app_role)) => Ok(VaultAuth::AppRole {
                mount_path: app_role
                    .mount_path
                    .clone()
                    .unwrap_or_else(|| DEFAULT_VAULT_APPROLE_AUTH_PATH.to_string()),
                role_id: app_role.role_id.clone(),
                secret_id: app_role.secret_id_ref.clone(),
            }),
            _ => Err(StoreError::invalid_input(
                "vault auth must set exactly one of token, kubernetes, appRole",
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Debug, Deserialize)]
struct LoginAuth {
    client_token: String,
    #[serde(default)]
    lease_duration: u64,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    data: ReadData,
}

#[derive(Debug, Deserialize)]
struct ReadData {
    /// `null` when the latest version is soft-deleted
    data: Option<Map<String, Value>>,
    metadata: ReadMetadata,
}

#[derive(Debug, Deserialize)]
struct ReadMetadata {
    version: u64,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    data: WriteMetadata,
}

#[derive(Debug, Deserialize)]
struct WriteMetadata {
    version: u64,
}

/// Current state of one KV path
///
/// `data` is empty when the latest version is soft-deleted.
struct KvEntry {
    data: Map<String, Value>,
    version: u64,
}

impl From<ReadResponse> for KvEntry {
    fn from(body: ReadResponse) -> Self {
        Self {
            data: body.data.data.unwrap_or_default(),
            version: body.data.metadata.version,
        }
    }
}

/// Vault KV v2 client
pub struct VaultKvClient {
    http_client: Client,
    server: String,
    mount_path: String,
    namespace: Option<String>,
    auth: VaultAuth,
    token: TokenCache,
}

impl std::fmt::Debug for VaultKvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKvClient")
            .field("server", &self.server)
            .field("mount_path", &self.mount_path)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl VaultKvClient {
    /// # Errors
    /// Returns `InvalidInput` for an ambiguous auth block or if the HTTP
    /// client cannot be built.
    pub fn new(spec: &VaultProviderSpec, options: &ClientOptions) -> Result<Self, StoreError> {
        let http_client = Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| StoreError::invalid_input(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http_client,
            server: spec.server.trim_end_matches('/').to_string(),
            mount_path: spec
                .mount_path
                .clone()
                .unwrap_or_else(|| DEFAULT_VAULT_MOUNT_PATH.to_string())
                .trim_matches('/')
                .to_string(),
            namespace: spec.namespace.clone(),
            auth: VaultAuth::from_spec(&spec.auth)?,
            token: TokenCache::new(options.refresh_margin),
        })
    }

    fn data_url(&self, key: &str) -> String {
        format!(
            "{}/v1/{}/data/{}",
            self.server,
            self.mount_path,
            key.trim_matches('/')
        )
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let request = self.http_client.request(method, url);
        match &self.namespace {
            Some(ns) => request.header("X-Vault-Namespace", ns),
            None => request,
        }
    }

    async fn client_token(&self) -> Result<Zeroizing<String>, StoreError> {
        self.token.get_or_refresh(|| self.login()).await
    }

    async fn login(&self) -> Result<IssuedToken, StoreError> {
        let (mount_path, body) = match &self.auth {
            VaultAuth::Token(reference) => {
                return Ok(IssuedToken {
                    token: resolve_secret_ref(reference).await?,
                    ttl: None,
                });
            }
            VaultAuth::Kubernetes {
                mount_path,
                role,
                jwt_path,
            } => {
                let jwt = tokio::fs::read_to_string(jwt_path).await.map_err(|e| {
                    StoreError::unauthenticated(format!(
                        "failed to read service account token {jwt_path}: {e}"
                    ))
                })?;
                let jwt = Zeroizing::new(jwt.trim().to_string());
                (mount_path, json!({ "role": role, "jwt": jwt.as_str() }))
            }
            VaultAuth::AppRole {
                mount_path,
                role_id,
                secret_id,
            } => {
                let secret_id = resolve_secret_ref(secret_id).await?;
                (
                    mount_path,
                    json!({ "role_id": role_id, "secret_id": secret_id.as_str() }),
                )
            }
        };

        let url = format!("{}/v1/auth/{}/login", self.server, mount_path);
        let response = self
            .request(Method::POST, &url)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("vault login", &e))?;

        if !response.status().is_success() {
            let mut err = error_from_response("vault login", response).await;
            // A rejected login is a credential problem whatever the status code
            if err.kind == StoreErrorKind::InvalidInput {
                err.kind = StoreErrorKind::Unauthenticated;
            }
            return Err(err);
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| transport_error("vault login", &e))?;
        debug!(
            "Vault login succeeded via auth/{}, lease {}s",
            mount_path, login.auth.lease_duration
        );
        Ok(IssuedToken {
            token: Zeroizing::new(login.auth.client_token),
            ttl: (login.auth.lease_duration > 0)
                .then(|| Duration::from_secs(login.auth.lease_duration)),
        })
    }

    async fn read_entry(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        let token = self.client_token().await?;
        let response = self
            .request(Method::GET, &self.data_url(key))
            .header("X-Vault-Token", token.as_str())
            .send()
            .await
            .map_err(|e| transport_error("vault read", &e))?;

        if response.status() == StatusCode::NOT_FOUND {
            // A soft-deleted latest version answers 404 with its metadata;
            // the next write must check-and-set against that version
            let body = response.text().await.unwrap_or_default();
            return Ok(serde_json::from_str::<ReadResponse>(&body)
                .ok()
                .map(KvEntry::from));
        }
        if !response.status().is_success() {
            return Err(error_from_response("vault read", response).await);
        }

        let body: ReadResponse = response
            .json()
            .await
            .map_err(|e| transport_error("vault read", &e))?;
        Ok(Some(KvEntry::from(body)))
    }

    async fn write_entry(
        &self,
        key: &str,
        data: &Map<String, Value>,
        cas: u64,
    ) -> Result<u64, StoreError> {
        let token = self.client_token().await?;
        let response = self
            .request(Method::POST, &self.data_url(key))
            .header("X-Vault-Token", token.as_str())
            .json(&json!({ "options": { "cas": cas }, "data": data }))
            .send()
            .await
            .map_err(|e| transport_error("vault write", &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = if status == StatusCode::BAD_REQUEST && body.contains("check-and-set") {
                StoreErrorKind::Conflict
            } else {
                classify_status(status)
            };
            return Err(StoreError::new(
                kind,
                format!("vault write failed with HTTP {status}: {}", truncate_body(&body)),
            ));
        }

        let written: WriteResponse = response
            .json()
            .await
            .map_err(|e| transport_error("vault write", &e))?;
        Ok(written.data.version)
    }

    async fn delete_path(&self, key: &str) -> Result<(), StoreError> {
        let token = self.client_token().await?;
        let response = self
            .request(Method::DELETE, &self.data_url(key))
            .header("X-Vault-Token", token.as_str())
            .send()
            .await
            .map_err(|e| transport_error("vault delete", &e))?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(error_from_response("vault delete", response).await)
    }
}

fn property_of(remote: &RemoteRef) -> &str {
    remote.property.as_deref().unwrap_or(VAULT_DEFAULT_PROPERTY)
}

#[async_trait]
impl SecretStore for VaultKvClient {
    fn kind(&self) -> StoreKind {
        StoreKind::Vault
    }

    async fn write(
        &self,
        remote: &RemoteRef,
        value: &SecretValue,
        expected_prior_hash: Option<&str>,
    ) -> Result<String, StoreError> {
        let span = info_span!("vault.kv.write", remote.key = %remote.key, server = %self.server);
        async move {
            let text = value_as_text(value)?;
            let property = property_of(remote);
            let current = self.read_entry(&remote.key).await?;

            let (mut data, cas) = match current {
                Some(entry) => (entry.data, entry.version),
                None => (Map::new(), 0),
            };
            ensure_prior_hash(field_value(&data, property).as_ref(), expected_prior_hash)?;

            data.insert(property.to_string(), Value::String(text.to_string()));
            let version = self.write_entry(&remote.key, &data, cas).await?;
            debug!("Wrote {} at version {}", remote, version);
            Ok(version.to_string())
        }
        .instrument(span)
        .await
    }

    async fn read(&self, remote: &RemoteRef) -> Result<Option<RemoteValue>, StoreError> {
        let entry = self.read_entry(&remote.key).await?;
        Ok(entry.and_then(|entry| {
            field_value(&entry.data, property_of(remote)).map(|value| RemoteValue {
                value,
                version: Some(entry.version.to_string()),
            })
        }))
    }

    async fn delete(&self, remote: &RemoteRef) -> Result<(), StoreError> {
        let Some(entry) = self.read_entry(&remote.key).await? else {
            return Ok(());
        };
        let mut data = entry.data;
        if data.remove(property_of(remote)).is_none() {
            return Ok(());
        }
        if data.is_empty() {
            return self.delete_path(&remote.key).await;
        }
        self.write_entry(&remote.key, &data, entry.version)
            .await
            .map(|_| ())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let url = format!("{}/v1/sys/health", self.server);
        let response = self
            .request(Method::GET, &url)
            .send()
            .await
            .map_err(|e| transport_error("vault health", &e))?;
        // 429: standby, 472/473: DR/performance standby; all serve reads
        match response.status().as_u16() {
            200 | 429 | 472 | 473 => Ok(()),
            501 => Err(StoreError::unavailable("vault is not initialized")),
            503 => Err(StoreError::unavailable("vault is sealed")),
            _ => Err(error_from_response("vault health", response).await),
        }
    }

    async fn refresh_credentials(&self) -> Result<(), StoreError> {
        self.token.invalidate().await;
        self.client_token().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EnvSecretRef, VaultKubernetesAuthSpec, VaultTokenAuthSpec};

    fn options() -> ClientOptions {
        ClientOptions {
            request_timeout: Duration::from_secs(5),
            refresh_margin: Duration::from_secs(60),
        }
    }

    fn spec(auth: VaultAuthSpec) -> VaultProviderSpec {
        VaultProviderSpec {
            server: "https://vault.example.com/".to_string(),
            mount_path: Some("/kv/".to_string()),
            namespace: None,
            auth,
        }
    }

    #[test]
    fn test_data_url_normalizes_slashes() {
        let client = VaultKvClient::new(
            &spec(VaultAuthSpec {
                token: Some(VaultTokenAuthSpec {
                    token_ref: EnvSecretRef {
                        env: Some("VAULT_TOKEN".to_string()),
                        file: None,
                    },
                }),
                ..VaultAuthSpec::default()
            }),
            &options(),
        )
        .unwrap();
        assert_eq!(
            client.data_url("/payments/db/"),
            "https://vault.example.com/v1/kv/data/payments/db"
        );
    }

    #[test]
    fn test_ambiguous_auth_rejected() {
        let auth = VaultAuthSpec {
            token: Some(VaultTokenAuthSpec {
                token_ref: EnvSecretRef::default(),
            }),
            kubernetes: Some(VaultKubernetesAuthSpec {
                role: "r".to_string(),
                mount_path: None,
                service_account_token_path: None,
            }),
            app_role: None,
        };
        let err = VaultKvClient::new(&spec(auth), &options()).unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::InvalidInput);
    }

    #[test]
    fn test_soft_deleted_read_keeps_version() {
        let body: ReadResponse = serde_json::from_value(json!({
            "data": { "data": null, "metadata": { "version": 2, "destroyed": false } }
        }))
        .unwrap();
        let entry = KvEntry::from(body);
        assert!(entry.data.is_empty());
        assert_eq!(entry.version, 2);
    }

    #[test]
    fn test_default_property() {
        assert_eq!(property_of(&RemoteRef::new("a", None)), VAULT_DEFAULT_PROPERTY);
        assert_eq!(property_of(&RemoteRef::new("a", Some("p".to_string()))), "p");
    }
}
