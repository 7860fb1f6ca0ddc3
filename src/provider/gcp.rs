//! GCP Secret Manager REST Client
//!
//! Native REST implementation for GCP Secret Manager API v1, authenticated
//! with Workload Identity tokens from the metadata server.
//!
//! Every write adds a new secret version. With a property, the payload is a
//! JSON object and the property is one of its fields.
//!
//! References:
//! - [GCP Secret Manager REST API v1](https://cloud.google.com/secret-manager/docs/reference/rest)

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use regex::Regex;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, info_span, Instrument};
use zeroize::Zeroizing;

use crate::constants::{DEFAULT_GCP_SECRET_MANAGER_ENDPOINT, GCP_METADATA_TOKEN_URL};
use crate::crd::GcpProviderSpec;
use crate::provider::common::{
    ensure_prior_hash, error_from_response, field_value, parse_object, render_object,
    transport_error, value_as_text,
};
use crate::provider::credentials::{IssuedToken, TokenCache};
use crate::provider::{ClientOptions, RemoteRef, RemoteValue, SecretStore, StoreError, StoreKind};
use crate::secret::SecretValue;

static SECRET_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{1,255}$").expect("secret id regex is valid")
});

/// Secret payload; `data` is base64 on the wire
#[derive(Debug, Serialize, Deserialize)]
struct SecretPayload {
    data: String,
}

#[derive(Debug, Deserialize)]
struct AccessSecretVersionResponse {
    name: String,
    payload: SecretPayload,
}

#[derive(Debug, Serialize)]
struct AddVersionRequest {
    payload: SecretPayload,
}

#[derive(Debug, Deserialize)]
struct SecretVersionResponse {
    name: String,
}

/// OAuth2 access token response from the GCP metadata server
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Access token for the workload's service account
#[derive(Debug)]
pub struct MetadataToken {
    pub access_token: Zeroizing<String>,
    pub expires_in: Duration,
}

/// Fetch an access token from the metadata server
///
/// `GCE_METADATA_HOST` overrides the metadata server address, as the
/// Google client libraries do.
///
/// # Errors
/// `Unauthenticated` when the metadata server refuses to issue a token,
/// `Unavailable` when it cannot be reached.
pub async fn metadata_access_token(
    http_client: &Client,
    scopes: Option<&str>,
) -> Result<MetadataToken, StoreError> {
    let url = match std::env::var("GCE_METADATA_HOST") {
        Ok(host) => format!(
            "http://{host}/computeMetadata/v1/instance/service-accounts/default/token"
        ),
        Err(_) => GCP_METADATA_TOKEN_URL.to_string(),
    };
    let mut request = http_client.get(url).header("Metadata-Flavor", "Google");
    if let Some(scopes) = scopes {
        request = request.query(&[("scopes", scopes)]);
    }

    let response = request
        .send()
        .await
        .map_err(|e| transport_error("gcp metadata token", &e))?;
    let status = response.status();
    if !status.is_success() {
        let mut err = error_from_response("gcp metadata token", response).await;
        if status == StatusCode::NOT_FOUND {
            // No service account bound to the workload
            err.kind = crate::provider::StoreErrorKind::Unauthenticated;
        }
        return Err(err);
    }
    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| transport_error("gcp metadata token", &e))?;
    Ok(MetadataToken {
        access_token: Zeroizing::new(token.access_token),
        expires_in: Duration::from_secs(token.expires_in),
    })
}

/// GCP Secret Manager REST client
pub struct GcpSecretManagerClient {
    http_client: Client,
    base_url: String,
    project_id: String,
    token: TokenCache,
}

impl std::fmt::Debug for GcpSecretManagerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpSecretManagerClient")
            .field("project_id", &self.project_id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GcpSecretManagerClient {
    /// # Errors
    /// Returns `InvalidInput` if the HTTP client cannot be built.
    pub fn new(spec: &GcpProviderSpec, options: &ClientOptions) -> Result<Self, StoreError> {
        let http_client = Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| StoreError::invalid_input(format!("failed to create HTTP client: {e}")))?;
        let base_url = spec
            .endpoint
            .as_deref()
            .unwrap_or(DEFAULT_GCP_SECRET_MANAGER_ENDPOINT)
            .trim_end_matches('/')
            .to_string();
        info!(
            "Initializing GCP Secret Manager client for project: {}",
            spec.project_id
        );
        Ok(Self {
            http_client,
            base_url,
            project_id: spec.project_id.clone(),
            token: TokenCache::new(options.refresh_margin),
        })
    }

    async fn access_token(&self) -> Result<Zeroizing<String>, StoreError> {
        self.token
            .get_or_refresh(|| async {
                let token = metadata_access_token(&self.http_client, None).await?;
                Ok(IssuedToken {
                    token: token.access_token,
                    ttl: Some(token.expires_in),
                })
            })
            .await
    }

    async fn make_request(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, StoreError> {
        let token = self.access_token().await?;
        Ok(self
            .http_client
            .request(method, format!("{}/v1/{}", self.base_url, path))
            .bearer_auth(token.as_str()))
    }

    fn secret_id(remote: &RemoteRef) -> Result<&str, StoreError> {
        if SECRET_ID.is_match(&remote.key) {
            Ok(&remote.key)
        } else {
            Err(StoreError::invalid_input(format!(
                "'{}' is not a valid GCP secret id ([A-Za-z0-9_-], at most 255 characters)",
                remote.key
            )))
        }
    }

    /// Latest payload and version number; `None` when the secret or its versions are missing
    async fn access_latest(&self, secret_id: &str) -> Result<Option<(Vec<u8>, String)>, StoreError> {
        let path = format!(
            "projects/{}/secrets/{}/versions/latest:access",
            self.project_id, secret_id
        );
        let response = self
            .make_request(Method::GET, &path)
            .await?
            .send()
            .await
            .map_err(|e| transport_error("gcp access", &e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_from_response("gcp access", response).await);
        }
        let body: AccessSecretVersionResponse = response
            .json()
            .await
            .map_err(|e| transport_error("gcp access", &e))?;
        let data = general_purpose::STANDARD
            .decode(body.payload.data.as_bytes())
            .map_err(|e| StoreError::invalid_input(format!("gcp payload is not base64: {e}")))?;
        Ok(Some((data, version_of(&body.name))))
    }

    async fn create_secret(&self, secret_id: &str) -> Result<(), StoreError> {
        info!("Creating new GCP secret: {}", secret_id);
        let response = self
            .make_request(Method::POST, &format!("projects/{}/secrets", self.project_id))
            .await?
            .query(&[("secretId", secret_id)])
            .json(&serde_json::json!({ "replication": { "automatic": {} } }))
            .send()
            .await
            .map_err(|e| transport_error("gcp create", &e))?;
        // 409: created concurrently by someone else; the version add below still applies
        if response.status().is_success() || response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        Err(error_from_response("gcp create", response).await)
    }

    async fn add_version(&self, secret_id: &str, data: &[u8]) -> Result<String, StoreError> {
        let path = format!("projects/{}/secrets/{}:addVersion", self.project_id, secret_id);
        let body = AddVersionRequest {
            payload: SecretPayload {
                data: general_purpose::STANDARD.encode(data),
            },
        };

        let mut created = false;
        loop {
            let response = self
                .make_request(Method::POST, &path)
                .await?
                .json(&body)
                .send()
                .await
                .map_err(|e| transport_error("gcp add version", &e))?;
            if response.status() == StatusCode::NOT_FOUND && !created {
                self.create_secret(secret_id).await?;
                created = true;
                continue;
            }
            if !response.status().is_success() {
                return Err(error_from_response("gcp add version", response).await);
            }
            let version: SecretVersionResponse = response
                .json()
                .await
                .map_err(|e| transport_error("gcp add version", &e))?;
            return Ok(version_of(&version.name));
        }
    }

    async fn delete_secret(&self, secret_id: &str) -> Result<(), StoreError> {
        let path = format!("projects/{}/secrets/{}", self.project_id, secret_id);
        let response = self
            .make_request(Method::DELETE, &path)
            .await?
            .send()
            .await
            .map_err(|e| transport_error("gcp delete", &e))?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(error_from_response("gcp delete", response).await)
    }
}

/// `projects/p/secrets/s/versions/7` -> `7`
fn version_of(name: &str) -> String {
    name.rsplit('/').next().unwrap_or(name).to_string()
}

fn object_of(current: Option<&[u8]>) -> Result<Map<String, Value>, StoreError> {
    match current {
        Some(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|e| {
                StoreError::invalid_input(format!(
                    "remote value is not UTF-8 ({e}); cannot address a property"
                ))
            })?;
            parse_object(text)
        }
        None => Ok(Map::new()),
    }
}

#[async_trait]
impl SecretStore for GcpSecretManagerClient {
    fn kind(&self) -> StoreKind {
        StoreKind::GcpSecretManager
    }

    async fn write(
        &self,
        remote: &RemoteRef,
        value: &SecretValue,
        expected_prior_hash: Option<&str>,
    ) -> Result<String, StoreError> {
        let span = info_span!(
            "gcp.secret.write",
            secret.name = %remote.key,
            project.id = %self.project_id
        );
        async move {
            let secret_id = Self::secret_id(remote)?;
            let current = self.access_latest(secret_id).await?;
            let current_bytes = current.as_ref().map(|(data, _)| data.as_slice());

            let payload = match &remote.property {
                Some(property) => {
                    let mut object = object_of(current_bytes)?;
                    ensure_prior_hash(field_value(&object, property).as_ref(), expected_prior_hash)?;
                    object.insert(property.clone(), Value::String(value_as_text(value)?.to_string()));
                    render_object(&object)?.into_bytes()
                }
                None => {
                    let current_value = current_bytes.map(|b| SecretValue::new(b.to_vec()));
                    ensure_prior_hash(current_value.as_ref(), expected_prior_hash)?;
                    value.as_bytes().to_vec()
                }
            };
            let payload = Zeroizing::new(payload);

            let version = self.add_version(secret_id, &payload).await?;
            debug!("Added version {} to {}", version, remote);
            Ok(version)
        }
        .instrument(span)
        .await
    }

    async fn read(&self, remote: &RemoteRef) -> Result<Option<RemoteValue>, StoreError> {
        let secret_id = Self::secret_id(remote)?;
        let Some((data, version)) = self.access_latest(secret_id).await? else {
            return Ok(None);
        };
        let data = Zeroizing::new(data);
        let value = match &remote.property {
            Some(property) => field_value(&object_of(Some(data.as_slice()))?, property),
            None => Some(SecretValue::new(data.to_vec())),
        };
        Ok(value.map(|value| RemoteValue {
            value,
            version: Some(version),
        }))
    }

    async fn delete(&self, remote: &RemoteRef) -> Result<(), StoreError> {
        let secret_id = Self::secret_id(remote)?;
        let Some(property) = &remote.property else {
            return self.delete_secret(secret_id).await;
        };
        let Some((data, _)) = self.access_latest(secret_id).await? else {
            return Ok(());
        };
        let mut object = object_of(Some(data.as_slice()))?;
        if object.remove(property).is_none() {
            return Ok(());
        }
        if object.is_empty() {
            return self.delete_secret(secret_id).await;
        }
        self.add_version(secret_id, render_object(&object)?.as_bytes())
            .await
            .map(|_| ())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let response = self
            .make_request(Method::GET, &format!("projects/{}/secrets", self.project_id))
            .await?
            .query(&[("pageSize", "1")])
            .send()
            .await
            .map_err(|e| transport_error("gcp health", &e))?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(error_from_response("gcp health", response).await)
    }

    async fn refresh_credentials(&self) -> Result<(), StoreError> {
        self.token.invalidate().await;
        self.access_token().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_of() {
        assert_eq!(version_of("projects/p/secrets/s/versions/7"), "7");
    }

    #[test]
    fn test_secret_id_validation() {
        assert!(GcpSecretManagerClient::secret_id(&RemoteRef::new("db-password", None)).is_ok());
        assert_eq!(
            GcpSecretManagerClient::secret_id(&RemoteRef::new("payments/db", None))
                .map_err(|e| e.kind),
            Err(crate::provider::StoreErrorKind::InvalidInput)
        );
    }

    #[test]
    fn test_object_of_missing_is_empty() {
        assert!(object_of(None).unwrap().is_empty());
    }
}
