//! Date-windowed fetch planning: splits a date range into non-overlapping
//! sub-ranges sized by an increment token such as `5d` or `2w`.
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, NaiveDate};

/// One fetch window. Both bounds are inclusive: the start is stamped at
/// 00:00:00 and the end at 23:59:59.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn start_stamp(&self) -> String {
        format!("{}T00:00:00", self.start.format("%Y-%m-%d"))
    }

    pub fn end_stamp(&self) -> String {
        format!("{}T23:59:59", self.end.format("%Y-%m-%d"))
    }
}

/// Parse an increment token `<n><unit>` with unit ∈ {d, w, m, y} into a span
/// in days. Months and years are approximate (30 and 365 days).
pub fn parse_increment(token: &str) -> Option<i64> {
    let token = token.trim();
    if token.len() < 2 {
        return None;
    }
    let (count, unit) = token.split_at(token.len() - 1);
    let count: i64 = count.parse().ok()?;
    if count <= 0 {
        return None;
    }
    let per_unit = match unit {
        "d" => 1,
        "w" => 7,
        "m" => 30,
        "y" => 365,
        _ => return None,
    };
    Some(count * per_unit)
}

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid date '{s}', expected YYYY-MM-DD"))
}

/// Plan the window sequence covering `[start, finish]`. Windows are
/// contiguous and strictly increasing; the first starts at `start` and the
/// last ends at `finish`. `finish < start` yields an empty plan.
pub fn plan(start: &str, finish: &str, inc: &str) -> Result<Vec<DateWindow>> {
    let start = parse_date(start)?;
    let finish = parse_date(finish)?;
    let span = parse_increment(inc).ok_or_else(|| anyhow!("invalid increment token '{inc}'"))?;

    let mut windows = Vec::new();
    if finish < start {
        return Ok(windows);
    }

    let mut cursor = start;
    while cursor <= finish {
        let end = (cursor + Duration::days(span)).min(finish);
        windows.push(DateWindow { start: cursor, end });
        cursor = end + Duration::days(1);
    }
    Ok(windows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn parse_increment_units() {
        assert_eq!(parse_increment("1d"), Some(1));
        assert_eq!(parse_increment("5d"), Some(5));
        assert_eq!(parse_increment("2w"), Some(14));
        assert_eq!(parse_increment("3m"), Some(90));
        assert_eq!(parse_increment("1y"), Some(365));
        assert_eq!(parse_increment("10d"), Some(10));
    }

    #[test]
    fn parse_increment_rejects_garbage() {
        assert_eq!(parse_increment("d"), None);
        assert_eq!(parse_increment("5"), None);
        assert_eq!(parse_increment("-2d"), None);
        assert_eq!(parse_increment("0d"), None);
        assert_eq!(parse_increment("5 days"), None);
        assert_eq!(parse_increment(""), None);
    }

    #[test]
    fn period_scenario_two_windows() {
        let windows = plan("2024-01-01", "2024-01-10", "5d").unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].start_stamp(), "2024-01-01T00:00:00");
        assert_eq!(windows[0].end_stamp(), "2024-01-06T23:59:59");
        assert_eq!(windows[1].start_stamp(), "2024-01-07T00:00:00");
        assert_eq!(windows[1].end_stamp(), "2024-01-10T23:59:59");
    }

    #[test]
    fn windows_are_contiguous_and_cover_the_range() {
        let windows = plan("2023-11-20", "2024-03-05", "1w").unwrap();
        assert_eq!(windows.first().unwrap().start, d("2023-11-20"));
        assert_eq!(windows.last().unwrap().end, d("2024-03-05"));
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end + Duration::days(1), pair[1].start);
            assert!(pair[0].start < pair[1].start);
        }
        for w in &windows {
            assert!(w.start <= w.end);
            assert!(w.end <= d("2024-03-05"));
        }
    }

    #[test]
    fn single_day_range_yields_one_window() {
        let windows = plan("2024-06-01", "2024-06-01", "1d").unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start, windows[0].end);
    }

    #[test]
    fn inverted_range_is_empty() {
        let windows = plan("2024-06-02", "2024-06-01", "1d").unwrap();
        assert!(windows.is_empty());
    }

    #[test]
    fn bad_date_is_an_error() {
        assert!(plan("01.06.2024", "2024-06-05", "1d").is_err());
    }
}
