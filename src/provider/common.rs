//! # Common Provider Utilities
//!
//! Helpers shared by the REST and SDK backed stores: HTTP error
//! classification, JSON property merging and prior-hash checks.

use reqwest::StatusCode;
use serde_json::{Map, Value};

use crate::constants::MAX_ERROR_BODY_CHARS;
use crate::provider::{StoreError, StoreErrorKind};
use crate::secret::SecretValue;

/// Map an HTTP status to the store failure taxonomy
#[must_use]
pub fn classify_status(status: StatusCode) -> StoreErrorKind {
    match status.as_u16() {
        401 | 403 => StoreErrorKind::Unauthenticated,
        409 | 412 => StoreErrorKind::Conflict,
        408 | 429 => StoreErrorKind::Unavailable,
        s if s >= 500 => StoreErrorKind::Unavailable,
        _ => StoreErrorKind::InvalidInput,
    }
}

/// Build a [`StoreError`] from a non-success HTTP response
pub async fn error_from_response(operation: &str, response: reqwest::Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    StoreError::new(
        classify_status(status),
        format!("{operation} failed with HTTP {status}: {}", truncate_body(&body)),
    )
}

/// Transport level failure (connect, TLS, timeout, decode)
#[must_use]
pub fn transport_error(operation: &str, err: &reqwest::Error) -> StoreError {
    if err.is_decode() {
        return StoreError::invalid_input(format!("{operation}: malformed response: {err}"));
    }
    StoreError::unavailable(format!("{operation}: {err}"))
}

/// Shorten a backend response body for inclusion in an error message
#[must_use]
pub fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
    out.push_str("...");
    out
}

/// Text stores only accept UTF-8 values
pub fn value_as_text(value: &SecretValue) -> Result<&str, StoreError> {
    value.as_str().ok_or_else(|| {
        StoreError::invalid_input("value is not valid UTF-8; use the Base64 encoding for binary data")
    })
}

/// Fail with `Conflict` when the current remote value does not match what the caller last saw
pub fn ensure_prior_hash(
    current: Option<&SecretValue>,
    expected_prior_hash: Option<&str>,
) -> Result<(), StoreError> {
    let Some(expected) = expected_prior_hash else {
        return Ok(());
    };
    match current {
        Some(value) if value.digest() == expected => Ok(()),
        Some(_) => Err(StoreError::conflict("remote value changed since last observed")),
        None => Err(StoreError::conflict("remote value was removed since last observed")),
    }
}

/// Parse a remote value as a JSON object
pub fn parse_object(raw: &str) -> Result<Map<String, Value>, StoreError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) | Err(_) => Err(StoreError::invalid_input(
            "remote value is not a JSON object; cannot address a property",
        )),
    }
}

/// Value of one field of a JSON object, as bytes
///
/// String fields yield their content; any other JSON value yields its
/// serialized form.
#[must_use]
pub fn field_value(map: &Map<String, Value>, property: &str) -> Option<SecretValue> {
    map.get(property).map(|value| match value {
        Value::String(s) => SecretValue::from(s.as_str()),
        other => SecretValue::from(other.to_string()),
    })
}

/// Serialize a JSON object for storage as a single string value
pub fn render_object(map: &Map<String, Value>) -> Result<String, StoreError> {
    serde_json::to_string(map)
        .map_err(|e| StoreError::invalid_input(format!("failed to serialize remote object: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::FORBIDDEN), StoreErrorKind::Unauthenticated);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), StoreErrorKind::Unauthenticated);
        assert_eq!(classify_status(StatusCode::CONFLICT), StoreErrorKind::Conflict);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), StoreErrorKind::Unavailable);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), StoreErrorKind::Unavailable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), StoreErrorKind::InvalidInput);
    }

    #[test]
    fn test_ensure_prior_hash() {
        let value = SecretValue::from("v1");
        let hash = value.digest();
        assert_eq!(ensure_prior_hash(Some(&value), None), Ok(()));
        assert_eq!(ensure_prior_hash(Some(&value), Some(&hash)), Ok(()));
        assert_eq!(
            ensure_prior_hash(Some(&SecretValue::from("v2")), Some(&hash)).map_err(|e| e.kind),
            Err(StoreErrorKind::Conflict)
        );
        assert_eq!(
            ensure_prior_hash(None, Some(&hash)).map_err(|e| e.kind),
            Err(StoreErrorKind::Conflict)
        );
    }

    #[test]
    fn test_parse_object_rejects_scalars() {
        assert!(parse_object(r#"{"a":"b"}"#).is_ok());
        assert_eq!(
            parse_object("plain text").map_err(|e| e.kind),
            Err(StoreErrorKind::InvalidInput)
        );
    }

    #[test]
    fn test_field_value_non_string() {
        let map = parse_object(r#"{"port": 5432, "host": "db"}"#).unwrap();
        assert_eq!(field_value(&map, "host").unwrap().as_bytes(), b"db");
        assert_eq!(field_value(&map, "port").unwrap().as_bytes(), b"5432");
        assert!(field_value(&map, "user").is_none());
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(MAX_ERROR_BODY_CHARS + 10);
        let truncated = truncate_body(&long);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.len(), MAX_ERROR_BODY_CHARS + 3);
    }
}
