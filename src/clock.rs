//! Timestamp helpers.
//!
//! Log entries arrive with timestamps written by different producers: RFC 3339 from this
//! client, naive ISO-8601 local time from the remote log store, and locale-formatted strings
//! from older browser clients. All of them are normalised to `OffsetDateTime` here.

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Current time in the local offset, falling back to UTC when the offset cannot be determined.
pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn local_offset() -> UtcOffset {
    UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC)
}

/// Format a timestamp the way newly created log entries carry it.
pub fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| "now".into())
}

pub fn timestamp_now() -> String {
    format_timestamp(now())
}

/// Parse any timestamp shape the log store is known to hold. Naive values are read as local time.
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(t) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(t);
    }
    // A trailing 'Z' on an otherwise naive value marks UTC.
    let naive = raw.trim_end_matches('Z');

    let iso_fraction =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
    let iso = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    let iso_space = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let locale = format_description!(
        "[month padding:none]/[day padding:none]/[year], [hour repr:12 padding:none]:[minute]:[second] [period]"
    );

    let parsed = PrimitiveDateTime::parse(naive, &iso_fraction)
        .or_else(|_| PrimitiveDateTime::parse(naive, &iso))
        .or_else(|_| PrimitiveDateTime::parse(naive, &iso_space))
        .or_else(|_| PrimitiveDateTime::parse(naive, &locale))
        .ok()?;

    let offset = if raw.ends_with('Z') {
        UtcOffset::UTC
    } else {
        local_offset()
    };
    Some(parsed.assume_offset(offset))
}

/// Unix nanoseconds for ordering; unparsable timestamps sort as the oldest possible value.
pub fn sort_key(raw: &str) -> i128 {
    parse_timestamp(raw)
        .map(|t| t.unix_timestamp_nanos())
        .unwrap_or(i128::MIN)
}

/// True when `raw` parses and lies within `window` before `now`.
pub fn within(raw: &str, window: Duration, now: OffsetDateTime) -> bool {
    match parse_timestamp(raw) {
        Some(t) => t >= now - window,
        None => false,
    }
}
