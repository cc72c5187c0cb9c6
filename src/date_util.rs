use chrono::{DateTime, SecondsFormat, Utc};

/// Fixed-width RFC 3339 (millisecond precision, `Z`) so lexical order in
/// SQLite matches chronological order.
pub fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp. Accepts RFC 3339 and SQLite's `datetime('now')` form.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Compact day stamp used inside temporary reference numbers.
pub fn day_stamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%d").to_string()
}
