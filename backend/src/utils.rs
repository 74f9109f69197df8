use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::time::Duration;

/// Parse an ISO8601 publish timestamp as reported by the catalog.
pub fn parse_published_at(date_str: &str) -> Result<DateTime<Utc>> {
    date_str
        .parse::<DateTime<Utc>>()
        .map_err(|e| Error::validation(format!("bad publish time '{date_str}': {e}")))
}

/// Parse an ISO8601 duration string (P1DT1H2M3S) to total seconds.
pub fn parse_iso8601_duration_to_seconds(duration_str: &str) -> Option<i64> {
    let rest = duration_str.strip_prefix('P')?;

    let mut total_seconds = 0.0;
    let mut current_number = String::new();
    let mut in_time = false;

    for ch in rest.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            current_number.push(ch);
            continue;
        }
        if ch == 'T' {
            in_time = true;
            continue;
        }
        let num = current_number.parse::<f64>().ok()?;
        match (ch, in_time) {
            ('W', false) => total_seconds += num * 604800.0,
            ('D', false) => total_seconds += num * 86400.0,
            ('H', true) => total_seconds += num * 3600.0,
            ('M', true) => total_seconds += num * 60.0,
            ('S', true) => total_seconds += num,
            _ => return None,
        }
        current_number.clear();
    }

    if !current_number.is_empty() {
        return None;
    }
    Some(total_seconds as i64)
}

/// True when more than `period` has passed between `since` and `now`.
pub fn is_older_than(since: DateTime<Utc>, now: DateTime<Utc>, period: Duration) -> bool {
    (now - since)
        .to_std()
        .map(|elapsed| elapsed > period)
        .unwrap_or(false)
}

/// True when less than `period` has passed between `since` and `now`.
/// A `since` in the future counts as within.
pub fn is_within(since: DateTime<Utc>, now: DateTime<Utc>, period: Duration) -> bool {
    (now - since)
        .to_std()
        .map(|elapsed| elapsed < period)
        .unwrap_or(true)
}

/// Parse a metrics range bound: RFC3339, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD`.
pub fn parse_range_bound(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc());
        }
    }
    Err(Error::validation(format!("bad date '{value}'")))
}

/// Accepts a raw collection id or a YouTube channel/playlist URL.
pub fn extract_collection_id(input: &str) -> Option<String> {
    let input = input.trim();
    if let Some(captures) = regex::Regex::new(
        r"(?:youtube\.com/channel/|[?&]list=)([a-zA-Z0-9_-]{10,64})",
    )
    .ok()?
    .captures(input)
    {
        return captures.get(1).map(|m| m.as_str().to_string());
    }

    let is_raw_id = !input.is_empty()
        && input
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    is_raw_id.then(|| input.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_iso8601_duration_to_seconds("PT1H2M3S"), Some(3723));
        assert_eq!(parse_iso8601_duration_to_seconds("PT45S"), Some(45));
        assert_eq!(parse_iso8601_duration_to_seconds("P1DT1S"), Some(86401));
        assert_eq!(parse_iso8601_duration_to_seconds("P0D"), Some(0));
        assert_eq!(parse_iso8601_duration_to_seconds(""), None);
        assert_eq!(parse_iso8601_duration_to_seconds("1H"), None);
        assert_eq!(parse_iso8601_duration_to_seconds("PT5"), None);
    }

    #[test]
    fn elapsed_helpers() {
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap();
        assert!(is_older_than(since, now, Duration::from_secs(60)));
        assert!(!is_older_than(since, now, Duration::from_secs(3600)));
        assert!(is_within(since, now, Duration::from_secs(3600)));
        assert!(!is_within(since, now, Duration::from_secs(60)));
        // clock skew: a timestamp ahead of now is never "older"
        assert!(!is_older_than(now, since, Duration::from_secs(1)));
        assert!(is_within(now, since, Duration::from_secs(1)));
    }

    #[test]
    fn range_bounds() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
        assert_eq!(parse_range_bound("2024-03-05").unwrap(), expected);
        assert_eq!(parse_range_bound("2024-03-05 00:00:00").unwrap(), expected);
        assert_eq!(parse_range_bound("2024-03-05T00:00:00Z").unwrap(), expected);
        assert!(matches!(
            parse_range_bound("yesterday"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn collection_ids_from_urls() {
        assert_eq!(
            extract_collection_id("https://www.youtube.com/channel/UCRzL8jf39oEWyrPnjmhBa2w"),
            Some("UCRzL8jf39oEWyrPnjmhBa2w".to_string())
        );
        assert_eq!(
            extract_collection_id("https://www.youtube.com/playlist?list=PLx0sYbCqOb8TBPRdmBHs5Iftvv9TPboYG"),
            Some("PLx0sYbCqOb8TBPRdmBHs5Iftvv9TPboYG".to_string())
        );
        assert_eq!(
            extract_collection_id("UUabc123"),
            Some("UUabc123".to_string())
        );
        assert_eq!(extract_collection_id("not an id"), None);
        assert_eq!(extract_collection_id(""), None);
    }
}
