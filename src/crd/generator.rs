//! # Generator Configuration
//!
//! Parameters of the generators usable as a `PushSecret` source.

use serde::{Deserialize, Serialize};

/// Generator selection; exactly one field must be set
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorSpec {
    #[serde(default)]
    pub password: Option<PasswordSpec>,
    #[serde(default)]
    pub uuid: Option<UuidSpec>,
    #[serde(default)]
    pub provider_token: Option<ProviderTokenSpec>,
    /// Key under which the generated value is exposed to destination mappings
    /// Default: "password", "uuid" or "token" depending on the generator
    #[serde(default)]
    pub key: Option<String>,
}

/// Random password parameters
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PasswordSpec {
    /// Exact password length
    #[serde(default = "default_password_length")]
    pub length: usize,
    /// Number of digits
    #[serde(default)]
    pub digits: usize,
    /// Number of symbols
    #[serde(default)]
    pub symbols: usize,
    /// Lowercase letters only
    #[serde(default)]
    pub no_upper: bool,
    /// Allow a character to appear more than once
    #[serde(default = "default_allow_repeat")]
    pub allow_repeat: bool,
}

fn default_password_length() -> usize {
    24
}

fn default_allow_repeat() -> bool {
    true
}

impl Default for PasswordSpec {
    fn default() -> Self {
        Self {
            length: default_password_length(),
            digits: 0,
            symbols: 0,
            no_upper: false,
            allow_repeat: default_allow_repeat(),
        }
    }
}

/// Version-4 UUID; no parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct UuidSpec {}

/// Short-lived cloud credential; exactly one field must be set
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTokenSpec {
    #[serde(default)]
    pub gcp: Option<GcpTokenSpec>,
    #[serde(default)]
    pub aws_sts: Option<AwsStsTokenSpec>,
}

/// OAuth2 access token of the workload's GCP service account (metadata server)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpTokenSpec {
    /// Comma separated OAuth2 scopes; metadata server default when unset
    #[serde(default)]
    pub scopes: Option<String>,
}

/// AWS STS session credentials
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsStsTokenSpec {
    pub region: String,
    /// Session duration in seconds (900 to 129600)
    #[serde(default = "default_sts_duration")]
    pub duration_seconds: i32,
}

fn default_sts_duration() -> i32 {
    3600
}
