//! Timestamp helpers.
//!
//! All timestamps are stored as RFC 3339 TEXT with fixed microsecond
//! precision so that string comparison in SQL matches chronological order.

use chrono::{DateTime, SecondsFormat, Utc};

/// Format a timestamp for storage.
pub fn to_db(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time in storage format.
pub fn now_db() -> String {
    to_db(Utc::now())
}

/// Parse a stored timestamp.
pub fn from_db(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_round_trip() {
        let now = Utc::now();
        let parsed = from_db(&to_db(now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn test_string_order_matches_time_order() {
        let base = Utc::now();
        let earlier = to_db(base - Duration::milliseconds(1));
        let later = to_db(base);
        assert!(earlier < later);
    }
}
