//! # Generator Engine
//!
//! Produces secret values that do not exist in the cluster: random
//! passwords, UUIDs and short-lived provider tokens.
//!
//! Password and UUID generation are pure and synchronous. Provider tokens
//! go through a [`TokenIssuer`], which tests replace with a stub via
//! [`GeneratorEngine::with_issuer`].

pub mod identifier;
pub mod password;
pub mod token;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::crd::{GeneratorSpec, PasswordSpec};
use crate::secret::SecretValue;
pub use token::{AwsStsIssuer, GcpMetadataIssuer, TokenIssuer};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GeneratorError {
    #[error("invalid generator spec: {0}")]
    InvalidSpec(String),
    #[error("cannot draw {requested} distinct {class} characters from an alphabet of {available}")]
    ExhaustedAlphabet {
        class: &'static str,
        requested: usize,
        available: usize,
    },
    #[error("upstream rejected credentials: {0}")]
    UpstreamAuth(String),
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

/// A generated value and, for expiring credentials, when it stops being valid
#[derive(Debug, Clone)]
pub struct GeneratedValue {
    pub value: SecretValue,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Which provider issues a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenProvider {
    Gcp { scopes: Option<String> },
    AwsSts { region: String, duration_seconds: i32 },
}

impl TokenProvider {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            TokenProvider::Gcp { .. } => "gcp",
            TokenProvider::AwsSts { .. } => "aws-sts",
        }
    }
}

/// Validated generator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generator {
    Password(PasswordSpec),
    Uuid,
    ProviderToken(TokenProvider),
}

impl Generator {
    /// Validate a generator spec
    ///
    /// Password constraints are checked here so an unsatisfiable rule is
    /// rejected when it is loaded rather than on every push.
    pub fn from_spec(spec: &GeneratorSpec) -> Result<Self, GeneratorError> {
        match (&spec.password, &spec.uuid, &spec.provider_token) {
            (Some(password), None, None) => {
                password::validate(password)?;
                Ok(Generator::Password(password.clone()))
            }
            (None, Some(_), None) => Ok(Generator::Uuid),
            (None, None, Some(token)) => match (&token.gcp, &token.aws_sts) {
                (Some(gcp), None) => Ok(Generator::ProviderToken(TokenProvider::Gcp {
                    scopes: gcp.scopes.clone(),
                })),
                (None, Some(sts)) => {
                    if !(900..=129_600).contains(&sts.duration_seconds) {
                        return Err(GeneratorError::InvalidSpec(format!(
                            "awsSts durationSeconds must be between 900 and 129600, got {}",
                            sts.duration_seconds
                        )));
                    }
                    Ok(Generator::ProviderToken(TokenProvider::AwsSts {
                        region: sts.region.clone(),
                        duration_seconds: sts.duration_seconds,
                    }))
                }
                _ => Err(GeneratorError::InvalidSpec(
                    "providerToken must set exactly one of gcp, awsSts".to_string(),
                )),
            },
            _ => Err(GeneratorError::InvalidSpec(
                "generator must set exactly one of password, uuid, providerToken".to_string(),
            )),
        }
    }

    /// Key the generated value is exposed under when the spec names none
    #[must_use]
    pub fn default_key(&self) -> &'static str {
        match self {
            Generator::Password(_) => "password",
            Generator::Uuid => "uuid",
            Generator::ProviderToken(_) => "token",
        }
    }

    /// Metrics label
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Generator::Password(_) => "password",
            Generator::Uuid => "uuid",
            Generator::ProviderToken(provider) => provider.kind(),
        }
    }
}

/// Runs generators
pub struct GeneratorEngine {
    http_client: reqwest::Client,
    issuers: HashMap<&'static str, Arc<dyn TokenIssuer>>,
}

impl GeneratorEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            http_client: reqwest::Client::new(),
            issuers: HashMap::new(),
        }
    }

    /// Use `issuer` for every token of the given provider kind (`"gcp"`, `"aws-sts"`)
    #[must_use]
    pub fn with_issuer(mut self, kind: &'static str, issuer: Arc<dyn TokenIssuer>) -> Self {
        self.issuers.insert(kind, issuer);
        self
    }

    async fn issuer_for(&self, provider: &TokenProvider) -> Arc<dyn TokenIssuer> {
        if let Some(issuer) = self.issuers.get(provider.kind()) {
            return Arc::clone(issuer);
        }
        match provider {
            TokenProvider::Gcp { scopes } => Arc::new(GcpMetadataIssuer::new(
                self.http_client.clone(),
                scopes.clone(),
            )),
            TokenProvider::AwsSts {
                region,
                duration_seconds,
            } => Arc::new(AwsStsIssuer::new(region, *duration_seconds).await),
        }
    }

    pub async fn generate(&self, generator: &Generator) -> Result<GeneratedValue, GeneratorError> {
        let result = match generator {
            Generator::Password(spec) => password::generate(spec).map(|value| GeneratedValue {
                value,
                expires_at: None,
            }),
            Generator::Uuid => Ok(GeneratedValue {
                value: identifier::generate(),
                expires_at: None,
            }),
            Generator::ProviderToken(provider) => self.issuer_for(provider).await.issue().await,
        };

        crate::observability::metrics::record_generator_run(generator.kind(), result.is_ok());
        result
    }
}

impl Default for GeneratorEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GeneratorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorEngine")
            .field("issuers", &self.issuers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
