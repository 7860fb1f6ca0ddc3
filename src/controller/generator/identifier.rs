//! Random identifier generator (UUID version 4).

use uuid::Uuid;

use crate::secret::SecretValue;

/// Lowercase hyphenated 8-4-4-4-12 version-4 UUID
#[must_use]
pub fn generate() -> SecretValue {
    SecretValue::from(Uuid::new_v4().hyphenated().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn test_uuid_v4_format() {
        let pattern =
            Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
                .unwrap();
        for _ in 0..100 {
            let value = generate();
            let text = value.as_str().unwrap();
            assert!(pattern.is_match(text), "not a v4 uuid: {text}");
        }
    }

    #[test]
    fn test_uuid_distinct() {
        assert_ne!(generate(), generate());
    }
}
