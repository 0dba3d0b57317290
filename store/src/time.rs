//! Wall-clock timestamps for last-write-wins ordering.
//!
//! All replicated rows carry an `updated_at` ISO-8601 UTC string written by
//! whichever side mutated the row. Comparison parses both sides so that
//! differing sub-second precision or offset spellings still order correctly;
//! unparseable values fall back to lexicographic order, which is correct for
//! uniformly formatted UTC strings.

use chrono::{DateTime, SecondsFormat, Utc};
use std::cmp::Ordering;

/// Current wall-clock time as an ISO-8601 UTC string with millisecond
/// precision, e.g. `2025-02-01T10:00:00.000Z`.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an ISO-8601 timestamp into UTC.
pub fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Compare two `updated_at` values for last-write-wins resolution.
pub fn cmp_timestamps(a: &str, b: &str) -> Ordering {
    match (parse_iso(a), parse_iso(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}
