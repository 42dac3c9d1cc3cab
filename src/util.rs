//! Small shared helpers.

use chrono::{DateTime, Utc};

/// Parse a stored or upstream timestamp into `DateTime<Utc>`.
///
/// Accepts RFC 3339 with a `Z` suffix or an explicit offset, plus the bare
/// `YYYY-MM-DD HH:MM:SS` form SQLite's `datetime()` emits. Anything else is
/// `None`.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(&s.replace('Z', "+00:00"))
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// Current time as an RFC 3339 string, the storage format for all timestamps.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_timestamp_rfc3339() {
        let dt = parse_timestamp("2026-03-02T09:00:00-05:00").unwrap();
        assert_eq!(dt.hour(), 14);
    }

    #[test]
    fn test_parse_timestamp_z_suffix() {
        let dt = parse_timestamp("2026-03-02T14:00:00Z").unwrap();
        assert_eq!(dt.hour(), 14);
    }

    #[test]
    fn test_parse_timestamp_sqlite_form() {
        let dt = parse_timestamp("2026-03-02 14:30:00").unwrap();
        assert_eq!(dt.hour(), 14);
        assert_eq!(dt.minute(), 30);
    }

    #[test]
    fn test_parse_timestamp_garbage() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("not a date").is_none());
    }
}
