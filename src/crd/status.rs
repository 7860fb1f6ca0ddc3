//! # PushSecret Status
//!
//! Status types patched onto `PushSecret` from the sync state table.

use serde::{Deserialize, Serialize};

/// Status of the PushSecret resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PushSecretStatus {
    /// Conditions represent the latest available observations
    /// `Ready` is True when every destination is Synced
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// One entry per (secret, destination) pair
    #[serde(default)]
    pub destinations: Vec<DestinationSyncStatus>,
}

/// Sync state of one (secret, destination) pair
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DestinationSyncStatus {
    /// Source secret, `<namespace>/<name>`
    pub secret: String,
    /// Destination store name
    pub store: String,
    /// Pending, Pushing, Synced or Failed
    pub phase: String,
    /// Source version last pushed successfully
    #[serde(default)]
    pub synced_version: Option<u64>,
    /// Last successful push (RFC3339)
    #[serde(default)]
    pub last_sync_time: Option<String>,
    /// Last attempt (RFC3339)
    #[serde(default)]
    pub last_attempt_time: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Failure kind of the last attempt, if it failed
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Condition represents a condition of a resource
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last transition time
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Message describing the condition
    #[serde(default)]
    pub message: Option<String>,
}
