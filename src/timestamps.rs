//! Normalization of the timestamp encodings seen across credential documents,
//! usage event logs and the web API: ISO-8601 strings (with or without an
//! offset), Unix seconds and Unix milliseconds.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// Epoch values at or above this are taken to be milliseconds.
pub const MILLIS_THRESHOLD: f64 = 1e12;

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Convert a Unix epoch number (seconds or milliseconds) to an instant.
pub fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let secs = if value >= MILLIS_THRESHOLD {
        value / 1000.0
    } else {
        value
    };
    let whole = secs.floor();
    let nanos = (((secs - whole) * 1e9).round() as u32).min(999_999_999);
    DateTime::from_timestamp(whole as i64, nanos)
}

/// Parse an ISO-8601 timestamp. Strings without an offset are read as UTC.
pub fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Parse a string that is either ISO-8601 or a bare epoch number.
pub fn parse_str(value: &str) -> Option<DateTime<Utc>> {
    parse_iso(value).or_else(|| value.trim().parse::<f64>().ok().and_then(from_epoch))
}

/// Parse a JSON timestamp field of either encoding.
pub fn from_json(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        Value::String(s) => parse_str(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn millisecond_values_match_their_seconds_equivalent() {
        for secs in [1_000_000_000_i64, 1_700_000_000, 2_000_000_000, 4_102_444_800] {
            let from_ms = from_epoch(secs as f64 * 1000.0).unwrap();
            let from_secs = from_epoch(secs as f64).unwrap();
            assert!((from_ms - from_secs).num_seconds().abs() <= 1);
        }
    }

    #[test]
    fn values_at_threshold_are_milliseconds() {
        let dt = from_epoch(MILLIS_THRESHOLD).unwrap();
        assert_eq!(dt.timestamp(), 1_000_000_000);
        let below = from_epoch(MILLIS_THRESHOLD - 1.0).unwrap();
        assert_eq!(below.timestamp(), 999_999_999_999);
    }

    #[test]
    fn fractional_seconds_are_kept() {
        let dt = from_epoch(1_700_000_000.5).unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn parses_iso_with_and_without_offset() {
        let expected = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_iso("2025-01-02T03:04:05Z"), Some(expected));
        assert_eq!(parse_iso("2025-01-02T03:04:05+00:00"), Some(expected));
        assert_eq!(parse_iso("2025-01-02T05:04:05+02:00"), Some(expected));
        assert_eq!(parse_iso("2025-01-02T03:04:05"), Some(expected));
        assert_eq!(parse_iso("2025-01-02 03:04:05.000"), Some(expected));
        assert_eq!(parse_iso("not a date"), None);
        assert_eq!(parse_iso(""), None);
    }

    #[test]
    fn json_values_of_either_encoding() {
        let expected = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(from_json(&serde_json::json!(1_700_000_000)), Some(expected));
        assert_eq!(from_json(&serde_json::json!(1_700_000_000_000_i64)), Some(expected));
        assert_eq!(from_json(&serde_json::json!("1700000000000")), Some(expected));
        assert_eq!(from_json(&serde_json::json!("2023-11-14T22:13:20Z")), Some(expected));
        assert_eq!(from_json(&serde_json::json!(null)), None);
        assert_eq!(from_json(&serde_json::json!(true)), None);
    }
}
