//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Default HTTP server port for metrics, health probes and the status API
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default number of push workers
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default deadline for a single secret store call (seconds)
pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 30;

/// Default exponential backoff base value (milliseconds)
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;

/// Default exponential backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;

/// Default number of backoff retries before a triple waits for its next refresh tick
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default scheduler tick (milliseconds)
pub const DEFAULT_SCHEDULER_TICK_MS: u64 = 1000;

/// Default retry interval for failed triples of rules that never refresh (seconds)
pub const DEFAULT_FAILED_RETRY_INTERVAL_SECS: u64 = 300;

/// Default margin before credential expiry at which credentials are refreshed (seconds)
pub const DEFAULT_TOKEN_REFRESH_MARGIN_SECS: u64 = 60;

/// Default interval between secret store health checks (seconds)
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 60;

/// Default poll interval for the rules file (seconds)
pub const DEFAULT_RULES_FILE_POLL_SECS: u64 = 10;

/// Default refresh interval of a `PushSecret` when none is given
pub const DEFAULT_REFRESH_INTERVAL: &str = "1h";

/// Minimum refresh interval (seconds)
pub const MIN_REFRESH_INTERVAL_SECS: u64 = 10;

/// Default delay before restarting a watch stream after unknown errors (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Default delay before restarting a watch stream after it ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS: u64 = 1;

/// Capacity of the sync event broadcast channel
pub const SYNC_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Field manager name used when patching `PushSecret` status
pub const FIELD_MANAGER: &str = "push-secret-controller";

/// Property used for Vault writes that name no property
pub const VAULT_DEFAULT_PROPERTY: &str = "value";

/// Default Vault KV v2 mount path
pub const DEFAULT_VAULT_MOUNT_PATH: &str = "secret";

/// Default Vault Kubernetes auth mount path
pub const DEFAULT_VAULT_KUBERNETES_AUTH_PATH: &str = "kubernetes";

/// Default Vault AppRole auth mount path
pub const DEFAULT_VAULT_APPROLE_AUTH_PATH: &str = "approle";

/// Projected service account token used for Vault Kubernetes auth
pub const DEFAULT_SERVICE_ACCOUNT_TOKEN_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Default Infisical API host
pub const DEFAULT_INFISICAL_HOST: &str = "https://app.infisical.com";

/// Default GCP Secret Manager REST endpoint
pub const DEFAULT_GCP_SECRET_MANAGER_ENDPOINT: &str = "https://secretmanager.googleapis.com";

/// GCE/GKE metadata server token endpoint
pub const GCP_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Maximum number of characters of a backend error body kept in error messages
pub const MAX_ERROR_BODY_CHARS: usize = 256;
