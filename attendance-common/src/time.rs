use chrono::{DateTime, NaiveDateTime, Utc};

/// Parse a vendor-reported timestamp.
///
/// Devices usually report RFC 3339 with an offset, but older firmware sends
/// naive timestamps; those are taken as UTC. Returns None when the string
/// is absent or unparseable, letting callers fall back to the wall clock.
pub fn parse_vendor_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }

    None
}
