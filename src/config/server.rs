//! # Server Configuration
//!
//! HTTP server settings loaded from environment variables.

use std::time::Duration;
use zeroize::Zeroizing;

use super::controller::parse_or;
use crate::constants::{
    DEFAULT_METRICS_PORT, DEFAULT_SERVER_POLL_INTERVAL_MS, DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
};

#[derive(Clone)]
pub struct ServerConfig {
    /// Port of the metrics, probe and admin endpoints
    pub metrics_port: u16,
    /// How long startup waits for the server to bind
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    /// Bearer token of `POST /retract` and `POST /trigger`; both are disabled when unset
    pub admin_token: Option<Zeroizing<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            startup_timeout: Duration::from_secs(DEFAULT_SERVER_STARTUP_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_SERVER_POLL_INTERVAL_MS),
            admin_token: None,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            metrics_port: parse_or(&lookup, "METRICS_PORT", DEFAULT_METRICS_PORT),
            startup_timeout: Duration::from_secs(parse_or(
                &lookup,
                "SERVER_STARTUP_TIMEOUT_SECS",
                DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            )),
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "SERVER_POLL_INTERVAL_MS",
                DEFAULT_SERVER_POLL_INTERVAL_MS,
            )),
            admin_token: lookup("ADMIN_TOKEN")
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty())
                .map(Zeroizing::new),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("metrics_port", &self.metrics_port)
            .field("startup_timeout", &self.startup_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_token_is_redacted() {
        let config = ServerConfig::from_lookup(|key| (key == "ADMIN_TOKEN").then(|| "s3cret".to_string()));
        assert_eq!(config.admin_token.as_deref().map(String::as_str), Some("s3cret"));
        assert!(!format!("{config:?}").contains("s3cret"));
    }

    #[test]
    fn test_blank_admin_token_disables_retraction() {
        let config = ServerConfig::from_lookup(|key| (key == "ADMIN_TOKEN").then(|| "  ".to_string()));
        assert!(config.admin_token.is_none());
        assert_eq!(config.metrics_port, 5000);
    }
}
