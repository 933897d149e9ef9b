//! Timestamp and calendar-day utilities
//!
//! Date keys are `YYYY-MM-DD` strings derived from the UTC calendar date of a
//! check-in timestamp. They compare lexicographically in date order.

use chrono::{DateTime, Datelike, NaiveDate, Utc};

/// UTC calendar day of `timestamp` as a date key
pub fn date_key_for(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d").to_string()
}

/// Parse a strict `YYYY-MM-DD` date key
pub fn parse_date_key(key: &str) -> Option<NaiveDate> {
    if key.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(key, "%Y-%m-%d").ok()
}

/// Date-key range covering the calendar month of `at`
///
/// The upper bound is always day 31; lexicographic comparison makes that an
/// inclusive bound for every month length.
pub fn month_range(at: &DateTime<Utc>) -> (String, String) {
    let prefix = month_label(at);
    (format!("{}-01", prefix), format!("{}-31", prefix))
}

/// `YYYY-MM` label for the month of `at`
pub fn month_label(at: &DateTime<Utc>) -> String {
    format!("{:04}-{:02}", at.year(), at.month())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_date_key_uses_utc_calendar_day() {
        let late = Utc.with_ymd_and_hms(2026, 1, 31, 23, 59, 59).unwrap();
        assert_eq!(date_key_for(&late), "2026-01-31");

        let early = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(date_key_for(&early), "2026-02-01");
    }

    #[test]
    fn test_parse_date_key_is_strict() {
        assert!(parse_date_key("2026-02-28").is_some());
        assert!(parse_date_key("2026-02-30").is_none());
        assert!(parse_date_key("2026-2-8").is_none());
        assert!(parse_date_key("28/02/2026").is_none());
        assert!(parse_date_key("").is_none());
    }

    #[test]
    fn test_month_range_bounds() {
        let at = Utc.with_ymd_and_hms(2026, 2, 14, 12, 0, 0).unwrap();
        let (start, end) = month_range(&at);
        assert_eq!(start, "2026-02-01");
        assert_eq!(end, "2026-02-31");

        // Lexicographic bounds cover the whole month and nothing else
        assert!("2026-02-28" >= start.as_str() && "2026-02-28" <= end.as_str());
        assert!("2026-03-01" > end.as_str());
        assert!("2026-01-31" < start.as_str());
    }

    #[test]
    fn test_month_label_zero_pads() {
        let at = Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap();
        assert_eq!(month_label(&at), "2026-07");
    }
}
