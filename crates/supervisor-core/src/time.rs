use chrono::{DateTime, NaiveDateTime, Utc};

/// Parses a persisted timestamp column tolerating the formats legacy rows
/// may carry: RFC3339, RFC3339 with nanoseconds, and a bare
/// "YYYY-MM-DD HH:MM:SS[.fffffffff]" with no offset (assumed UTC).
pub fn parse_legacy_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
        }
    }
    None
}

pub fn to_rfc3339_nanos(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339() {
        assert!(parse_legacy_timestamp("2026-01-02T03:04:05Z").is_some());
        assert!(parse_legacy_timestamp("2026-01-02T03:04:05.123456789Z").is_some());
    }

    #[test]
    fn parses_legacy_space_separated() {
        assert!(parse_legacy_timestamp("2026-01-02 03:04:05").is_some());
        assert!(parse_legacy_timestamp("2026-01-02 03:04:05.123").is_some());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_legacy_timestamp("not a timestamp").is_none());
    }
}
