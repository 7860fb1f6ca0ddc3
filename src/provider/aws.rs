//! # AWS Secrets Manager Client
//!
//! Pushes values to AWS Secrets Manager using the official SDK.
//!
//! - Remote refs without a property write the whole secret (string when the
//!   value is UTF-8, binary otherwise).
//! - Remote refs with a property treat the secret string as a JSON object.
//! - Credentials come from the SDK default chain (IRSA on EKS); forcing a
//!   refresh rebuilds the SDK config so a rotated web identity token is
//!   picked up.

use async_trait::async_trait;
use aws_sdk_secretsmanager::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_secretsmanager::primitives::Blob;
use aws_sdk_secretsmanager::Client as SecretsManagerClient;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, info_span, Instrument};

use crate::crd::AwsProviderSpec;
use crate::provider::common::{
    ensure_prior_hash, field_value, parse_object, render_object, value_as_text,
};
use crate::provider::{
    RemoteRef, RemoteValue, SecretStore, StoreError, StoreErrorKind, StoreKind,
};
use crate::secret::SecretValue;

/// Map an AWS error code to the store failure taxonomy
#[must_use]
pub fn classify_aws_error_code(code: &str) -> StoreErrorKind {
    match code {
        "UnrecognizedClientException"
        | "InvalidClientTokenId"
        | "ExpiredToken"
        | "ExpiredTokenException"
        | "AccessDenied"
        | "AccessDeniedException"
        | "InvalidSignatureException"
        | "SignatureDoesNotMatch"
        | "IncompleteSignature"
        | "MissingAuthenticationToken" => StoreErrorKind::Unauthenticated,
        "ResourceExistsException" | "PreconditionNotMetException" => StoreErrorKind::Conflict,
        "InternalServiceError"
        | "InternalFailure"
        | "ServiceUnavailable"
        | "ThrottlingException"
        | "Throttling"
        | "RequestTimeout" => StoreErrorKind::Unavailable,
        _ => StoreErrorKind::InvalidInput,
    }
}

/// Classify an SDK error
pub fn sdk_error<E, R>(operation: &str, err: &SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata,
{
    let kind = match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            StoreErrorKind::Unavailable
        }
        SdkError::ConstructionFailure(_) => StoreErrorKind::InvalidInput,
        _ => err
            .code()
            .map_or(StoreErrorKind::Unavailable, classify_aws_error_code),
    };
    StoreError::new(
        kind,
        format!(
            "{operation} failed: {} {}",
            err.code().unwrap_or("unknown"),
            err.message().unwrap_or_default()
        ),
    )
}

fn is_not_found<E, R>(err: &SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    err.code() == Some("ResourceNotFoundException")
}

async fn build_client(region: &str) -> SecretsManagerClient {
    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region.to_string()))
        .load()
        .await;
    SecretsManagerClient::new(&sdk_config)
}

/// AWS Secrets Manager client
pub struct AwsSecretsManagerClient {
    client: RwLock<SecretsManagerClient>,
    region: String,
}

impl std::fmt::Debug for AwsSecretsManagerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsSecretsManagerClient")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl AwsSecretsManagerClient {
    pub async fn new(spec: &AwsProviderSpec) -> Self {
        info!(
            "Initializing AWS Secrets Manager client for region {} (default credential chain)",
            spec.region
        );
        Self {
            client: RwLock::new(build_client(&spec.region).await),
            region: spec.region.clone(),
        }
    }

    async fn get(&self, secret_id: &str) -> Result<Option<(SecretValue, Option<String>)>, StoreError> {
        let client = self.client.read().await.clone();
        match client.get_secret_value().secret_id(secret_id).send().await {
            Ok(output) => {
                let value = match (output.secret_string(), output.secret_binary()) {
                    (Some(text), _) => SecretValue::from(text),
                    (None, Some(blob)) => SecretValue::new(blob.as_ref().to_vec()),
                    (None, None) => return Ok(None),
                };
                Ok(Some((value, output.version_id().map(str::to_string))))
            }
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(sdk_error("aws get secret value", &err)),
        }
    }

    /// Put a new version, creating the secret when it does not exist yet
    async fn put(&self, secret_id: &str, value: &SecretValue, exists: bool) -> Result<String, StoreError> {
        let client = self.client.read().await.clone();
        let text = value.as_str();

        if exists {
            let request = client.put_secret_value().secret_id(secret_id);
            let request = match text {
                Some(text) => request.secret_string(text),
                None => request.secret_binary(Blob::new(value.as_bytes().to_vec())),
            };
            let output = request
                .send()
                .await
                .map_err(|e| sdk_error("aws put secret value", &e))?;
            return Ok(output.version_id().unwrap_or_default().to_string());
        }

        info!("Creating AWS secret: {}", secret_id);
        let request = client.create_secret().name(secret_id);
        let request = match text {
            Some(text) => request.secret_string(text),
            None => request.secret_binary(Blob::new(value.as_bytes().to_vec())),
        };
        let output = request
            .send()
            .await
            .map_err(|e| sdk_error("aws create secret", &e))?;
        Ok(output.version_id().unwrap_or_default().to_string())
    }
}

#[async_trait]
impl SecretStore for AwsSecretsManagerClient {
    fn kind(&self) -> StoreKind {
        StoreKind::AwsSecretsManager
    }

    async fn write(
        &self,
        remote: &RemoteRef,
        value: &SecretValue,
        expected_prior_hash: Option<&str>,
    ) -> Result<String, StoreError> {
        let span = info_span!("aws.secret.write", secret.name = %remote.key, region = %self.region);
        async move {
            let current = self.get(&remote.key).await?;
            let exists = current.is_some();

            let payload = match &remote.property {
                Some(property) => {
                    let mut object = match &current {
                        Some((current, _)) => parse_object(value_as_text(current)?)?,
                        None => serde_json::Map::new(),
                    };
                    ensure_prior_hash(field_value(&object, property).as_ref(), expected_prior_hash)?;
                    object.insert(property.clone(), Value::String(value_as_text(value)?.to_string()));
                    SecretValue::from(render_object(&object)?)
                }
                None => {
                    ensure_prior_hash(current.as_ref().map(|(v, _)| v), expected_prior_hash)?;
                    value.clone()
                }
            };

            let version = self.put(&remote.key, &payload, exists).await?;
            debug!("Wrote {} as version {}", remote, version);
            Ok(version)
        }
        .instrument(span)
        .await
    }

    async fn read(&self, remote: &RemoteRef) -> Result<Option<RemoteValue>, StoreError> {
        let Some((value, version)) = self.get(&remote.key).await? else {
            return Ok(None);
        };
        let value = match &remote.property {
            Some(property) => field_value(&parse_object(value_as_text(&value)?)?, property),
            None => Some(value),
        };
        Ok(value.map(|value| RemoteValue { value, version }))
    }

    async fn delete(&self, remote: &RemoteRef) -> Result<(), StoreError> {
        if let Some(property) = &remote.property {
            let Some((current, _)) = self.get(&remote.key).await? else {
                return Ok(());
            };
            let mut object = parse_object(value_as_text(&current)?)?;
            if object.remove(property).is_none() {
                return Ok(());
            }
            if !object.is_empty() {
                return self
                    .put(&remote.key, &SecretValue::from(render_object(&object)?), true)
                    .await
                    .map(|_| ());
            }
        }

        let client = self.client.read().await.clone();
        match client.delete_secret().secret_id(&remote.key).send().await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(sdk_error("aws delete secret", &err)),
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let client = self.client.read().await.clone();
        client
            .list_secrets()
            .max_results(1)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| sdk_error("aws list secrets", &e))
    }

    async fn refresh_credentials(&self) -> Result<(), StoreError> {
        let fresh = build_client(&self.region).await;
        *self.client.write().await = fresh;
        debug!("Rebuilt AWS Secrets Manager client for region {}", self.region);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_aws_error_code() {
        assert_eq!(
            classify_aws_error_code("ExpiredTokenException"),
            StoreErrorKind::Unauthenticated
        );
        assert_eq!(
            classify_aws_error_code("AccessDeniedException"),
            StoreErrorKind::Unauthenticated
        );
        assert_eq!(
            classify_aws_error_code("ThrottlingException"),
            StoreErrorKind::Unavailable
        );
        assert_eq!(
            classify_aws_error_code("ResourceExistsException"),
            StoreErrorKind::Conflict
        );
        assert_eq!(
            classify_aws_error_code("InvalidParameterException"),
            StoreErrorKind::InvalidInput
        );
    }
}
