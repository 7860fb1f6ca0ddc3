//! Provider token issuers.
//!
//! Short-lived cloud credentials produced on demand. Each issuer reports the
//! credential's expiry so the reconciler can refresh it ahead of time.

use async_trait::async_trait;
use aws_sdk_sts::error::{ProvideErrorMetadata, SdkError};
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use tracing::debug;

use crate::controller::generator::{GeneratedValue, GeneratorError};
use crate::provider::aws::classify_aws_error_code;
use crate::provider::gcp::metadata_access_token;
use crate::provider::StoreErrorKind;
use crate::secret::SecretValue;

/// Issues one short-lived credential per call
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self) -> Result<GeneratedValue, GeneratorError>;
}

/// OAuth2 access token of the workload's GCP service account
#[derive(Debug, Clone)]
pub struct GcpMetadataIssuer {
    http_client: reqwest::Client,
    scopes: Option<String>,
}

impl GcpMetadataIssuer {
    #[must_use]
    pub fn new(http_client: reqwest::Client, scopes: Option<String>) -> Self {
        Self {
            http_client,
            scopes,
        }
    }
}

#[async_trait]
impl TokenIssuer for GcpMetadataIssuer {
    async fn issue(&self) -> Result<GeneratedValue, GeneratorError> {
        let token = metadata_access_token(&self.http_client, self.scopes.as_deref())
            .await
            .map_err(|e| match e.kind {
                StoreErrorKind::Unauthenticated => GeneratorError::UpstreamAuth(e.message),
                _ => GeneratorError::Unavailable(e.message),
            })?;
        let lifetime = TimeDelta::from_std(token.expires_in).unwrap_or(TimeDelta::zero());
        debug!("Issued GCP access token valid for {}s", lifetime.num_seconds());
        Ok(GeneratedValue {
            value: SecretValue::from(token.access_token.as_str()),
            expires_at: Some(Utc::now() + lifetime),
        })
    }
}

/// AWS STS session credentials, rendered as a JSON document with
/// `accessKeyId`, `secretAccessKey` and `sessionToken`
#[derive(Debug, Clone)]
pub struct AwsStsIssuer {
    client: aws_sdk_sts::Client,
    duration_seconds: i32,
}

impl AwsStsIssuer {
    pub async fn new(region: &str, duration_seconds: i32) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: aws_sdk_sts::Client::new(&sdk_config),
            duration_seconds,
        }
    }
}

fn sts_error<E, R>(err: &SdkError<E, R>) -> GeneratorError
where
    E: ProvideErrorMetadata,
{
    let message = format!(
        "sts get session token failed: {} {}",
        err.code().unwrap_or("unknown"),
        err.message().unwrap_or_default()
    );
    match err.code().map(classify_aws_error_code) {
        Some(StoreErrorKind::Unauthenticated) => GeneratorError::UpstreamAuth(message),
        Some(StoreErrorKind::InvalidInput) => GeneratorError::InvalidSpec(message),
        _ => GeneratorError::Unavailable(message),
    }
}

#[async_trait]
impl TokenIssuer for AwsStsIssuer {
    async fn issue(&self) -> Result<GeneratedValue, GeneratorError> {
        let output = self
            .client
            .get_session_token()
            .duration_seconds(self.duration_seconds)
            .send()
            .await
            .map_err(|e| sts_error(&e))?;
        let credentials = output.credentials().ok_or_else(|| {
            GeneratorError::Unavailable("sts returned no credentials".to_string())
        })?;

        let document = json!({
            "accessKeyId": credentials.access_key_id(),
            "secretAccessKey": credentials.secret_access_key(),
            "sessionToken": credentials.session_token(),
        });
        let bytes = serde_json::to_vec(&document)
            .map_err(|e| GeneratorError::Unavailable(format!("failed to encode credentials: {e}")))?;
        Ok(GeneratedValue {
            value: SecretValue::new(bytes),
            expires_at: DateTime::<Utc>::from_timestamp(credentials.expiration().secs(), 0),
        })
    }
}
