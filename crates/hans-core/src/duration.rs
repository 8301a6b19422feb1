//! Human-readable `Duration` (de)serialization
//!
//! Durations are written as `humantime` strings (`"50ms"`, `"1m 30s"`) so that
//! configuration files and wire frames stay readable. Plain integers are also
//! accepted on input and read as milliseconds.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer, de};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Text(String),
    Millis(u64),
}

/// Parse a human-readable duration such as `"250ms"` or `"5s"`
pub fn parse(text: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(text.trim())
}

/// Format a duration the same way it is serialized
pub fn format(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format(*duration))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Text(text) => parse(&text).map_err(de::Error::custom),
        RawDuration::Millis(ms) => Ok(Duration::from_millis(ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde::Serialize;

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "crate::duration")]
        value: Duration,
    }

    #[test]
    fn test_duration_text_roundtrip() {
        let holder = Holder {
            value: Duration::from_millis(1500),
        };
        let json = serde_json::to_string(&holder).unwrap();
        assert_eq!(json, r#"{"value":"1s 500ms"}"#);

        let back: Holder = serde_json::from_str(&json).unwrap();
        assert_eq!(back.value, Duration::from_millis(1500));
    }

    #[test]
    fn test_duration_accepts_integer_millis() {
        let holder: Holder = serde_json::from_str(r#"{"value":20}"#).unwrap();
        assert_eq!(holder.value, Duration::from_millis(20));
    }

    #[test]
    fn test_duration_rejects_garbage() {
        assert!(serde_json::from_str::<Holder>(r#"{"value":"soon"}"#).is_err());
    }

    #[rstest]
    #[case("50ms", 50)]
    #[case("1s", 1_000)]
    #[case(" 2s 500ms ", 2_500)]
    #[case("1m", 60_000)]
    fn test_parse_human_durations(#[case] text: &str, #[case] millis: u64) {
        assert_eq!(parse(text).unwrap(), Duration::from_millis(millis));
    }
}
