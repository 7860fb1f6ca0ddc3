//! Infisical REST Client
//!
//! Pushes values as raw secrets of one project environment and folder.
//! Infisical secrets are flat name/value pairs, so remote refs with a
//! property are rejected as `InvalidInput`.
//!
//! References:
//! - [Universal auth login](https://infisical.com/docs/api-reference/endpoints/universal-auth/login)
//! - [Raw secrets API](https://infisical.com/docs/api-reference/endpoints/secrets/create)

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info_span, Instrument};
use zeroize::Zeroizing;

use crate::constants::DEFAULT_INFISICAL_HOST;
use crate::crd::{InfisicalProviderSpec, UniversalAuthSpec};
use crate::provider::common::{
    ensure_prior_hash, error_from_response, transport_error, value_as_text,
};
use crate::provider::credentials::{resolve_secret_ref, IssuedToken, TokenCache};
use crate::provider::{
    ClientOptions, RemoteRef, RemoteValue, SecretStore, StoreError, StoreErrorKind, StoreKind,
};
use crate::secret::SecretValue;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SecretResponse {
    secret: RawSecret,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSecret {
    secret_value: String,
    #[serde(default)]
    version: Option<u64>,
}

/// Infisical client bound to one project environment
pub struct InfisicalClient {
    http_client: Client,
    host: String,
    project_id: String,
    environment: String,
    secret_path: String,
    auth: UniversalAuthSpec,
    token: TokenCache,
}

impl std::fmt::Debug for InfisicalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfisicalClient")
            .field("host", &self.host)
            .field("project_id", &self.project_id)
            .field("environment", &self.environment)
            .field("secret_path", &self.secret_path)
            .finish_non_exhaustive()
    }
}

impl InfisicalClient {
    /// # Errors
    /// Returns `InvalidInput` if the HTTP client cannot be built.
    pub fn new(spec: &InfisicalProviderSpec, options: &ClientOptions) -> Result<Self, StoreError> {
        let http_client = Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| StoreError::invalid_input(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http_client,
            host: spec
                .host_api
                .as_deref()
                .unwrap_or(DEFAULT_INFISICAL_HOST)
                .trim_end_matches('/')
                .to_string(),
            project_id: spec.project_id.clone(),
            environment: spec.environment.clone(),
            secret_path: spec.secret_path.clone().unwrap_or_else(|| "/".to_string()),
            auth: spec.auth.universal_auth.clone(),
            token: TokenCache::new(options.refresh_margin),
        })
    }

    /// URL of one raw secret; `name` is percent-encoded as a single segment
    fn secret_url(&self, name: &str) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.host).map_err(|e| {
            StoreError::invalid_input(format!("invalid Infisical host '{}': {e}", self.host))
        })?;
        url.path_segments_mut()
            .map_err(|()| {
                StoreError::invalid_input(format!("Infisical host '{}' is not a base URL", self.host))
            })?
            .pop_if_empty()
            .extend(["api", "v3", "secrets", "raw", name]);
        Ok(url)
    }

    async fn access_token(&self) -> Result<Zeroizing<String>, StoreError> {
        self.token.get_or_refresh(|| self.login()).await
    }

    async fn login(&self) -> Result<IssuedToken, StoreError> {
        let client_id = resolve_secret_ref(&self.auth.client_id_ref).await?;
        let client_secret = resolve_secret_ref(&self.auth.client_secret_ref).await?;

        let response = self
            .http_client
            .post(format!("{}/api/v1/auth/universal-auth/login", self.host))
            .json(&json!({
                "clientId": client_id.as_str(),
                "clientSecret": client_secret.as_str(),
            }))
            .send()
            .await
            .map_err(|e| transport_error("infisical login", &e))?;

        if !response.status().is_success() {
            let mut err = error_from_response("infisical login", response).await;
            if err.kind == StoreErrorKind::InvalidInput {
                err.kind = StoreErrorKind::Unauthenticated;
            }
            return Err(err);
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| transport_error("infisical login", &e))?;
        debug!("Infisical universal auth login succeeded, expires in {}s", login.expires_in);
        Ok(IssuedToken {
            token: Zeroizing::new(login.access_token),
            ttl: (login.expires_in > 0).then(|| Duration::from_secs(login.expires_in)),
        })
    }

    fn secret_name(remote: &RemoteRef) -> Result<&str, StoreError> {
        if remote.property.is_some() {
            return Err(StoreError::invalid_input(
                "infisical secrets are flat; remote refs cannot name a property",
            ));
        }
        Ok(&remote.key)
    }

    async fn fetch(&self, name: &str) -> Result<Option<RawSecret>, StoreError> {
        let token = self.access_token().await?;
        let response = self
            .http_client
            .get(self.secret_url(name)?)
            .bearer_auth(token.as_str())
            .query(&[
                ("workspaceId", self.project_id.as_str()),
                ("environment", self.environment.as_str()),
                ("secretPath", self.secret_path.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error("infisical read", &e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_from_response("infisical read", response).await);
        }
        let body: SecretResponse = response
            .json()
            .await
            .map_err(|e| transport_error("infisical read", &e))?;
        Ok(Some(body.secret))
    }

    async fn send_value(
        &self,
        method: Method,
        name: &str,
        value: &str,
    ) -> Result<Option<u64>, StoreError> {
        let token = self.access_token().await?;
        let response = self
            .http_client
            .request(method, self.secret_url(name)?)
            .bearer_auth(token.as_str())
            .json(&json!({
                "workspaceId": self.project_id,
                "environment": self.environment,
                "secretPath": self.secret_path,
                "secretValue": value,
                "type": "shared",
            }))
            .send()
            .await
            .map_err(|e| transport_error("infisical write", &e))?;

        if !response.status().is_success() {
            return Err(error_from_response("infisical write", response).await);
        }
        let body: SecretResponse = response
            .json()
            .await
            .map_err(|e| transport_error("infisical write", &e))?;
        Ok(body.secret.version)
    }
}

#[async_trait]
impl SecretStore for InfisicalClient {
    fn kind(&self) -> StoreKind {
        StoreKind::Infisical
    }

    async fn write(
        &self,
        remote: &RemoteRef,
        value: &SecretValue,
        expected_prior_hash: Option<&str>,
    ) -> Result<String, StoreError> {
        let span = info_span!("infisical.secret.write", remote.key = %remote.key);
        async move {
            let name = Self::secret_name(remote)?;
            let text = value_as_text(value)?;
            let current = self.fetch(name).await?;
            let current_value = current
                .as_ref()
                .map(|secret| SecretValue::from(secret.secret_value.as_str()));
            ensure_prior_hash(current_value.as_ref(), expected_prior_hash)?;

            let method = if current.is_some() {
                Method::PATCH
            } else {
                Method::POST
            };
            let version = self.send_value(method, name, text).await?;
            Ok(version.map_or_else(String::new, |v| v.to_string()))
        }
        .instrument(span)
        .await
    }

    async fn read(&self, remote: &RemoteRef) -> Result<Option<RemoteValue>, StoreError> {
        let name = Self::secret_name(remote)?;
        Ok(self.fetch(name).await?.map(|secret| RemoteValue {
            value: SecretValue::from(secret.secret_value),
            version: secret.version.map(|v| v.to_string()),
        }))
    }

    async fn delete(&self, remote: &RemoteRef) -> Result<(), StoreError> {
        let name = Self::secret_name(remote)?;
        let token = self.access_token().await?;
        let response = self
            .http_client
            .delete(self.secret_url(name)?)
            .bearer_auth(token.as_str())
            .json(&json!({
                "workspaceId": self.project_id,
                "environment": self.environment,
                "secretPath": self.secret_path,
                "type": "shared",
            }))
            .send()
            .await
            .map_err(|e| transport_error("infisical delete", &e))?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(error_from_response("infisical delete", response).await)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let response = self
            .http_client
            .get(format!("{}/api/status", self.host))
            .send()
            .await
            .map_err(|e| transport_error("infisical health", &e))?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(error_from_response("infisical health", response).await)
    }

    async fn refresh_credentials(&self) -> Result<(), StoreError> {
        self.token.invalidate().await;
        self.access_token().await.map(|_| ())
    }
}
