//! RFC3339 UTC timestamp codec.
//!
//! Every timestamp persists as RFC3339 in UTC with up-to-nanosecond
//! precision, and `parse_time(format_time(t)) == t` for any value produced
//! here.

use chrono::{DateTime, SecondsFormat, Utc};

/// Current instant in UTC.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp for persistence. Sub-second digits are emitted only
/// as precise as the value requires.
#[must_use]
pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse a persisted timestamp back into UTC.
pub fn parse_time(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parse_round_trip() {
        let now = now();
        let text = format_time(now);
        assert_eq!(parse_time(&text).expect("round trip"), now);
    }

    #[test]
    fn parse_accepts_nanosecond_strings() {
        let text = "2025-01-02T03:04:05.123456789Z";
        let parsed = parse_time(text).expect("nanosecond timestamp");
        assert_eq!(format_time(parsed), text);
    }

    #[test]
    fn parse_normalizes_offsets_to_utc() {
        let parsed = parse_time("2025-06-01T12:00:00+08:00").expect("offset timestamp");
        assert_eq!(format_time(parsed), "2025-06-01T04:00:00Z");
    }
}
