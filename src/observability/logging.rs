//! # Logging
//!
//! `tracing` subscriber for the controller and the CLI.
//!
//! - `LOG_LEVEL`: either a level (`info`, `DEBUG`) applied to this crate, or a
//!   full `EnvFilter` directive (`push_secret_controller=debug,kube=info`).
//!   `RUST_LOG` takes precedence when set.
//! - `LOG_FORMAT`: `json` (default) or `text`

use tracing_subscriber::EnvFilter;

const CRATE_TARGET: &str = "push_secret_controller";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    /// Unknown values fall back to JSON
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" | "plain" => LogFormat::Text,
            _ => LogFormat::Json,
        }
    }
}

/// Filter directive for a `LOG_LEVEL` value
#[must_use]
pub fn filter_directive(level: Option<&str>) -> String {
    match level.map(str::trim).filter(|level| !level.is_empty()) {
        None => format!("{CRATE_TARGET}=info"),
        Some(level) if level.contains('=') || level.contains(',') => level.to_string(),
        Some(level) => format!("{CRATE_TARGET}={}", level.to_ascii_lowercase()),
    }
}

/// Install the global subscriber from `RUST_LOG` / `LOG_LEVEL` / `LOG_FORMAT`
///
/// Does nothing when a subscriber is already installed.
pub fn init() {
    let level = std::env::var("LOG_LEVEL").ok();
    let format = std::env::var("LOG_FORMAT")
        .map(|format| LogFormat::parse(&format))
        .unwrap_or(LogFormat::Json);
    init_with(level.as_deref(), format);
}

pub fn init_with(level: Option<&str>, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level)));

    let result = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_current_span(true)
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
    };
    if let Err(e) = result {
        tracing::debug!("Tracing subscriber already installed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter_directive(None), "push_secret_controller=info");
        assert_eq!(filter_directive(Some("DEBUG")), "push_secret_controller=debug");
        assert_eq!(filter_directive(Some("kube=warn,push_secret_controller=trace")), "kube=warn,push_secret_controller=trace");
        assert_eq!(filter_directive(Some(" ")), "push_secret_controller=info");
    }

    #[test]
    fn test_log_format() {
        assert_eq!(LogFormat::parse("TEXT"), LogFormat::Text);
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("yaml"), LogFormat::Json);
    }
}
