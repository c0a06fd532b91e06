//! Timestamp helpers shared by the store and the queue fabric.
//!
//! Records keep RFC 3339 strings (readable in the database); broker timing
//! columns keep unix milliseconds (cheap comparisons in SQL).

use chrono::{DateTime, Utc};

/// Current time as unix milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current time as an RFC 3339 string.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Parse an RFC 3339 string back into a UTC timestamp.
pub fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3339_round_trip() {
        let s = now_rfc3339();
        let parsed = parse_rfc3339(&s).expect("should parse");
        assert!((Utc::now() - parsed).num_seconds().abs() < 5);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_rfc3339("not a timestamp").is_none());
    }
}
