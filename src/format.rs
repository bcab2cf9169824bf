//! Canonical day-precision date formatting and display rounding.
//!
//! Dates are rendered as `1.2.2023` (no zero padding) everywhere: the entry
//! form, the events table, and the stats captions. Parsing accepts the same
//! pattern with or without padding.

use chrono::NaiveDate;

const DAY_PATTERN: &str = "%d.%m.%Y";

pub fn parse_day(input: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(input.trim(), DAY_PATTERN).ok()
}

pub fn format_day(date: NaiveDate) -> String {
    date.format("%-d.%-m.%Y").to_string()
}

/// Short form for date-range captions, e.g. `1.2.`
pub fn format_day_short(date: NaiveDate) -> String {
    date.format("%-d.%-m.").to_string()
}

pub fn round0(value: f64) -> f64 {
    value.round()
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod test {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_unpadded_and_padded_days() {
        assert_eq!(parse_day("1.2.2023"), Some(day(2023, 2, 1)));
        assert_eq!(parse_day("01.02.2023"), Some(day(2023, 2, 1)));
        assert_eq!(parse_day(" 11.10.2022 "), Some(day(2022, 10, 11)));
    }

    #[test]
    fn rejects_garbage_and_other_patterns() {
        assert_eq!(parse_day(""), None);
        assert_eq!(parse_day("2023-02-01"), None);
        assert_eq!(parse_day("32.1.2023"), None);
    }

    #[test]
    fn formats_without_padding() {
        assert_eq!(format_day(day(2023, 2, 1)), "1.2.2023");
        assert_eq!(format_day(day(2022, 10, 11)), "11.10.2022");
        assert_eq!(format_day_short(day(2023, 2, 1)), "1.2.");
    }

    #[test]
    fn round_trips_the_canonical_pattern() {
        let d = day(2024, 12, 31);
        assert_eq!(parse_day(&format_day(d)), Some(d));
    }

    #[test]
    fn rounds_to_display_precision() {
        assert_eq!(round2(1.004), 1.0);
        assert_eq!(round2(0.125), 0.13); // exact binary half, away from zero
        assert_eq!(round2(-0.125), -0.13);
        assert_eq!(round1(13.44), 13.4);
        assert_eq!(round1(0.25), 0.3);
        assert_eq!(round0(89.6), 90.0);
        assert_eq!(round0(179.2), 179.0);
    }
}
