use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};

/// Current instant rendered RFC 3339 UTC with second precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Current instant rendered RFC 3339 UTC with millisecond precision.
pub fn now_rfc3339_millis() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 timestamp, tolerating a missing zone designator.
/// Naive timestamps are interpreted as UTC.
pub fn parse_rfc3339_lenient(input: &str) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Utc.from_local_datetime(&naive).single();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn now_is_round_trippable() {
        let rendered = now_rfc3339();
        assert!(parse_rfc3339_lenient(&rendered).is_some());
        let rendered = now_rfc3339_millis();
        assert!(parse_rfc3339_lenient(&rendered).is_some());
    }

    #[test]
    fn lenient_parse_accepts_zoned_and_naive() {
        let zoned = parse_rfc3339_lenient("2035-01-02T03:04:05Z").expect("zoned");
        assert_eq!(zoned.hour(), 3);
        let offset = parse_rfc3339_lenient("2035-01-02T03:04:05+02:00").expect("offset");
        assert_eq!(offset.hour(), 1);
        let naive = parse_rfc3339_lenient("2035-01-02T03:04:05").expect("naive");
        assert_eq!(naive, zoned);
        let spaced = parse_rfc3339_lenient("2035-01-02 03:04:05").expect("spaced");
        assert_eq!(spaced, zoned);
    }

    #[test]
    fn lenient_parse_rejects_garbage() {
        assert!(parse_rfc3339_lenient("").is_none());
        assert!(parse_rfc3339_lenient("soon").is_none());
        assert!(parse_rfc3339_lenient("2035-99-99T00:00:00Z").is_none());
    }
}
