//! # Duration Parsing
//!
//! Parses Kubernetes-style duration strings used by `refreshInterval`.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

static DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<number>\d+)(?P<unit>[smhd])$").expect("duration regex is valid")
});

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("duration string cannot be empty")]
    Empty,
    #[error("invalid duration format '{0}'. Expected format: <number><unit> (e.g., '30s', '5m', '1h', '1d')")]
    Format(String),
    #[error("duration '{0}' is out of range")]
    Overflow(String),
    #[error("duration number must be greater than 0, got '{0}'")]
    Zero(String),
    #[error("'{value}' must be at least {min_seconds} seconds (got {actual_seconds} seconds)")]
    TooShort {
        value: String,
        min_seconds: u64,
        actual_seconds: u64,
    },
}

/// Parse a Kubernetes duration string into a `Duration`
/// Supports formats: "30s", "1m", "5m", "1h", "2h", "1d"
pub fn parse_kubernetes_duration(duration_str: &str) -> Result<Duration, DurationError> {
    let trimmed = duration_str.trim();
    if trimmed.is_empty() {
        return Err(DurationError::Empty);
    }

    let lower = trimmed.to_lowercase();
    let captures = DURATION
        .captures(&lower)
        .ok_or_else(|| DurationError::Format(trimmed.to_string()))?;

    let number: u64 = captures["number"]
        .parse()
        .map_err(|_parse_error| DurationError::Overflow(trimmed.to_string()))?;
    if number == 0 {
        return Err(DurationError::Zero(trimmed.to_string()));
    }

    let multiplier = match &captures["unit"] {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => 86400,
    };
    number
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| DurationError::Overflow(trimmed.to_string()))
}

/// Parse a refresh interval
///
/// Returns `None` for "0", "0s" and "never" (push once), otherwise the
/// interval, which must be at least `min_seconds`.
pub fn parse_refresh_interval(
    interval: &str,
    min_seconds: u64,
) -> Result<Option<Duration>, DurationError> {
    let trimmed = interval.trim();
    if matches!(trimmed.to_lowercase().as_str(), "0" | "0s" | "never") {
        return Ok(None);
    }

    let duration = parse_kubernetes_duration(trimmed)?;
    if duration.as_secs() < min_seconds {
        return Err(DurationError::TooShort {
            value: trimmed.to_string(),
            min_seconds,
            actual_seconds: duration.as_secs(),
        });
    }
    Ok(Some(duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_kubernetes_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_kubernetes_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_kubernetes_duration("1H"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_kubernetes_duration(" 2d "), Ok(Duration::from_secs(172_800)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_kubernetes_duration(""), Err(DurationError::Empty));
        assert!(matches!(parse_kubernetes_duration("1h30m"), Err(DurationError::Format(_))));
        assert!(matches!(parse_kubernetes_duration("-5m"), Err(DurationError::Format(_))));
        assert!(matches!(parse_kubernetes_duration("0m"), Err(DurationError::Zero(_))));
        assert!(matches!(
            parse_kubernetes_duration("99999999999999999999d"),
            Err(DurationError::Overflow(_))
        ));
    }

    #[test]
    fn test_refresh_interval_never() {
        assert_eq!(parse_refresh_interval("0", 10), Ok(None));
        assert_eq!(parse_refresh_interval("0s", 10), Ok(None));
        assert_eq!(parse_refresh_interval("Never", 10), Ok(None));
        assert_eq!(parse_refresh_interval("1h", 10), Ok(Some(Duration::from_secs(3600))));
    }

    #[test]
    fn test_refresh_interval_minimum() {
        assert!(matches!(
            parse_refresh_interval("5s", 10),
            Err(DurationError::TooShort { actual_seconds: 5, .. })
        ));
    }
}
