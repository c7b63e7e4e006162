//! Time utility functions

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

/// Parse an RFC 3339 timestamp, rejecting anything malformed rather than
/// silently falling back to the epoch.
pub fn parse_iso_timestamp(ts: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid RFC 3339 timestamp: {ts}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn parses_valid_timestamp() {
        let dt = parse_iso_timestamp("2024-01-15T10:30:00Z").unwrap();
        assert_eq!(dt.year(), 2024);
        assert_eq!(dt.month(), 1);
        assert_eq!(dt.day(), 15);
        assert_eq!(dt.hour(), 10);
        assert_eq!(dt.minute(), 30);
    }

    #[test]
    fn converts_offset_to_utc() {
        let dt = parse_iso_timestamp("2024-01-15T10:30:00+05:00").unwrap();
        assert_eq!(dt.hour(), 5);
        assert_eq!(dt.minute(), 30);
    }

    #[test]
    fn rejects_malformed_timestamp() {
        assert!(parse_iso_timestamp("not-a-timestamp").is_err());
    }
}
