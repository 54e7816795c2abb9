//! General utilities shared across the application.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns the current wall-clock time as an ISO-8601 / RFC 3339 string.
///
/// All wire-protocol `timestamp` fields use this format.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Converts a Unix-millisecond timestamp to an ISO-8601 string.
///
/// Out-of-range values fall back to the epoch rather than panicking.
#[must_use]
pub fn iso_from_millis(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_from_millis_round_trips_through_chrono() {
        let ts = iso_from_millis(1_700_000_000_000);
        let parsed = DateTime::parse_from_rfc3339(&ts).expect("valid RFC 3339");
        assert_eq!(parsed.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn iso_timestamp_is_parseable() {
        let ts = iso_timestamp();
        assert!(DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
