//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::constants::*;

/// Controller-level configuration
///
/// All settings have defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of push workers
    pub worker_count: usize,
    /// Deadline of a backend call when the store sets no `timeoutSeconds`
    pub backend_timeout: Duration,
    /// First backoff delay after a failed push
    pub backoff_base: Duration,
    /// Upper bound of the backoff delay
    pub backoff_max: Duration,
    /// Backoff retries when a `PushSecret` sets no `maxRetries`
    pub default_max_retries: u32,
    /// How often due retries and refreshes are queued
    pub scheduler_tick: Duration,
    /// Retry interval of failed destinations whose rule never refreshes
    pub failed_retry_interval: Duration,
    /// Generated tokens are replaced this long before they expire
    pub token_refresh_margin: Duration,
    /// How often every store is health checked
    pub health_check_interval: Duration,
    /// Sync records are persisted here when set
    pub state_file: Option<PathBuf>,
    /// Key of the value digests in sync records; defaults to `<STATE_FILE>.key`
    pub digest_key_file: Option<PathBuf>,
    /// Stores and rules are also loaded from this YAML file when set
    pub rules_file: Option<PathBuf>,
    pub rules_file_poll: Duration,
    /// Only watch secrets and `PushSecret`s in this namespace
    pub watch_namespace: Option<String>,
    /// Only watch secrets matching this label selector
    pub secret_label_selector: Option<String>,
    /// Namespace the controller runs in
    pub pod_namespace: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            backend_timeout: Duration::from_secs(DEFAULT_BACKEND_TIMEOUT_SECS),
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            default_max_retries: DEFAULT_MAX_RETRIES,
            scheduler_tick: Duration::from_millis(DEFAULT_SCHEDULER_TICK_MS),
            failed_retry_interval: Duration::from_secs(DEFAULT_FAILED_RETRY_INTERVAL_SECS),
            token_refresh_margin: Duration::from_secs(DEFAULT_TOKEN_REFRESH_MARGIN_SECS),
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
            state_file: None,
            digest_key_file: None,
            rules_file: None,
            rules_file_poll: Duration::from_secs(DEFAULT_RULES_FILE_POLL_SECS),
            watch_namespace: None,
            secret_label_selector: None,
            pod_namespace: "push-secret-system".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup (environment, ConfigMap data)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            worker_count: parse_or(&lookup, "WORKER_COUNT", DEFAULT_WORKER_COUNT).max(1),
            backend_timeout: Duration::from_secs(parse_or(
                &lookup,
                "BACKEND_TIMEOUT_SECS",
                DEFAULT_BACKEND_TIMEOUT_SECS,
            )),
            backoff_base: Duration::from_millis(parse_or(&lookup, "BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS)),
            backoff_max: Duration::from_millis(parse_or(&lookup, "BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS)),
            default_max_retries: parse_or(&lookup, "DEFAULT_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            scheduler_tick: Duration::from_millis(
                parse_or(&lookup, "SCHEDULER_TICK_MS", DEFAULT_SCHEDULER_TICK_MS).max(1),
            ),
            failed_retry_interval: Duration::from_secs(parse_or(
                &lookup,
                "FAILED_RETRY_INTERVAL_SECS",
                DEFAULT_FAILED_RETRY_INTERVAL_SECS,
            )),
            token_refresh_margin: Duration::from_secs(parse_or(
                &lookup,
                "TOKEN_REFRESH_MARGIN_SECS",
                DEFAULT_TOKEN_REFRESH_MARGIN_SECS,
            )),
            health_check_interval: Duration::from_secs(
                parse_or(&lookup, "HEALTH_CHECK_INTERVAL_SECS", DEFAULT_HEALTH_CHECK_INTERVAL_SECS).max(1),
            ),
            state_file: non_empty(&lookup, "STATE_FILE").map(PathBuf::from),
            digest_key_file: non_empty(&lookup, "DIGEST_KEY_FILE").map(PathBuf::from),
            rules_file: non_empty(&lookup, "RULES_FILE").map(PathBuf::from),
            rules_file_poll: Duration::from_secs(
                parse_or(&lookup, "RULES_FILE_POLL_SECS", DEFAULT_RULES_FILE_POLL_SECS).max(1),
            ),
            watch_namespace: non_empty(&lookup, "WATCH_NAMESPACE"),
            secret_label_selector: non_empty(&lookup, "SECRET_LABEL_SELECTOR"),
            pod_namespace: non_empty(&lookup, "POD_NAMESPACE").unwrap_or(defaults.pod_namespace),
        }
    }
}

impl ControllerConfig {
    /// Where the digest key lives; `None` means a per-process key
    #[must_use]
    pub fn digest_key_path(&self) -> Option<PathBuf> {
        self.digest_key_file.clone().or_else(|| {
            self.state_file.as_ref().map(|state| {
                let mut path = state.clone().into_os_string();
                path.push(".key");
                PathBuf::from(path)
            })
        })
    }
}

/// Read a value or return the default when it is unset or does not parse
pub(crate) fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::from_lookup(lookup(&[]));
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.backend_timeout, Duration::from_secs(30));
        assert_eq!(config.default_max_retries, 5);
        assert_eq!(config.scheduler_tick, Duration::from_secs(1));
        assert!(config.state_file.is_none());
        assert_eq!(config.pod_namespace, "push-secret-system");
    }

    #[test]
    fn test_overrides() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("WORKER_COUNT", "8"),
            ("BACKOFF_BASE_MS", "250"),
            ("STATE_FILE", "/var/lib/push/state.json"),
            ("WATCH_NAMESPACE", " payments "),
        ]));
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.backoff_base, Duration::from_millis(250));
        assert_eq!(config.state_file, Some(PathBuf::from("/var/lib/push/state.json")));
        assert_eq!(config.watch_namespace.as_deref(), Some("payments"));
    }

    #[test]
    fn test_digest_key_path() {
        assert!(ControllerConfig::from_lookup(lookup(&[])).digest_key_path().is_none());

        let beside_state = ControllerConfig::from_lookup(lookup(&[("STATE_FILE", "/var/lib/push/state.json")]));
        assert_eq!(
            beside_state.digest_key_path(),
            Some(PathBuf::from("/var/lib/push/state.json.key"))
        );

        let explicit = ControllerConfig::from_lookup(lookup(&[
            ("STATE_FILE", "/var/lib/push/state.json"),
            ("DIGEST_KEY_FILE", "/etc/push/digest.key"),
        ]));
        assert_eq!(explicit.digest_key_path(), Some(PathBuf::from("/etc/push/digest.key")));
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("WORKER_COUNT", "0"),
            ("DEFAULT_MAX_RETRIES", "lots"),
            ("RULES_FILE", "  "),
        ]));
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.default_max_retries, 5);
        assert!(config.rules_file.is_none());
    }
}
