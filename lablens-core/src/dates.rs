use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Accepted raw encodings, in trial order. The order is a compatibility contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DateFormat {
    DayMonthYearSlash,
    IsoYearMonthDay,
    DayMonthYearDash,
}

pub const FORMAT_ORDER: [DateFormat; 3] = [
    DateFormat::DayMonthYearSlash,
    DateFormat::IsoYearMonthDay,
    DateFormat::DayMonthYearDash,
];

static RE_DMY_SLASH: OnceLock<Regex> = OnceLock::new();
static RE_ISO: OnceLock<Regex> = OnceLock::new();
static RE_DMY_DASH: OnceLock<Regex> = OnceLock::new();

fn re_dmy_slash() -> &'static Regex { RE_DMY_SLASH.get_or_init(|| Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{4})$").unwrap()) }
fn re_iso() -> &'static Regex { RE_ISO.get_or_init(|| Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})$").unwrap()) }
fn re_dmy_dash() -> &'static Regex { RE_DMY_DASH.get_or_init(|| Regex::new(r"^(\d{1,2})-(\d{1,2})-(\d{4})$").unwrap()) }

impl DateFormat {
    fn regex(self) -> &'static Regex {
        match self {
            DateFormat::DayMonthYearSlash => re_dmy_slash(),
            DateFormat::IsoYearMonthDay => re_iso(),
            DateFormat::DayMonthYearDash => re_dmy_dash(),
        }
    }

    // (year, month, day) capture positions
    fn field_order(self) -> (usize, usize, usize) {
        match self {
            DateFormat::IsoYearMonthDay => (1, 2, 3),
            DateFormat::DayMonthYearSlash | DateFormat::DayMonthYearDash => (3, 2, 1),
        }
    }
}

/// first format whose shape matches, regardless of calendar validity
pub fn detect_format(raw: &str) -> Option<DateFormat> {
    let s = raw.trim();
    FORMAT_ORDER.into_iter().find(|f| f.regex().is_match(s))
}

/// Normalize a raw date string to a canonical calendar date.
///
/// The first syntactically matching format decides the interpretation; an
/// impossible date under that format (e.g. `31/02/2024`) is `None`, it does not
/// fall through to the next format. Never panics.
pub fn normalize_date(raw: &str) -> Option<NaiveDate> {
    normalize_date_with_format(raw).map(|(d, _)| d)
}

pub fn normalize_date_with_format(raw: &str) -> Option<(NaiveDate, DateFormat)> {
    let s = raw.trim();
    let format = detect_format(s)?;
    let caps = format.regex().captures(s)?;
    let (yi, mi, di) = format.field_order();
    let year: i32 = caps.get(yi)?.as_str().parse().ok()?;
    let month: u32 = caps.get(mi)?.as_str().parse().ok()?;
    let day: u32 = caps.get(di)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day).map(|d| (d, format))
}

// days from 0001-01-01 (CE) to 1970-01-01
const UNIX_EPOCH_FROM_CE: i32 = 719_163;

/// arrow Date32 representation (days since unix epoch)
pub fn to_epoch_days(d: NaiveDate) -> i32 {
    d.num_days_from_ce() - UNIX_EPOCH_FROM_CE
}

pub fn from_epoch_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_FROM_CE)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate { NaiveDate::from_ymd_opt(y, m, d).unwrap() }

    #[test] fn slash_day_first() { assert_eq!(normalize_date("01/05/2024"), Some(ymd(2024, 5, 1))); }
    #[test] fn iso() { assert_eq!(normalize_date("2024-05-02"), Some(ymd(2024, 5, 2))); }
    #[test] fn dash_day_first() { assert_eq!(normalize_date("15-03-2023"), Some(ymd(2023, 3, 15))); }
    #[test] fn single_digit_fields() { assert_eq!(normalize_date("1/5/2024"), Some(ymd(2024, 5, 1))); }
    #[test] fn surrounding_whitespace() { assert_eq!(normalize_date("  2024-05-02\n"), Some(ymd(2024, 5, 2))); }

    #[test]
    fn impossible_dates_are_missing() {
        assert_eq!(normalize_date("31/02/2024"), None);
        assert_eq!(normalize_date("2024-13-01"), None);
        assert_eq!(normalize_date("00-01-2024"), None);
    }

    #[test]
    fn unsupported_encodings_are_missing() {
        for s in ["", "   ", "2024/05/01", "05.01.2024", "May 1 2024", "2024-05-01T10:00:00", "01/05/24", "abc"] {
            assert_eq!(normalize_date(s), None, "{s:?}");
        }
    }

    #[test]
    fn deterministic() {
        for s in ["01/05/2024", "2024-05-02", "junk", "29/02/2024"] {
            assert_eq!(normalize_date(s), normalize_date(s));
        }
        assert_eq!(normalize_date("29/02/2024"), Some(ymd(2024, 2, 29)));
    }

    #[test]
    fn detect_reports_first_shape() {
        assert_eq!(detect_format("31/02/2024"), Some(DateFormat::DayMonthYearSlash));
        assert_eq!(detect_format("2024-1-9"), Some(DateFormat::IsoYearMonthDay));
        assert_eq!(detect_format("9-1-2024"), Some(DateFormat::DayMonthYearDash));
        assert_eq!(detect_format("x"), None);
    }

    #[test]
    fn epoch_days_roundtrip_points() {
        assert_eq!(to_epoch_days(ymd(1970, 1, 1)), 0);
        assert_eq!(to_epoch_days(ymd(1970, 1, 2)), 1);
        assert_eq!(to_epoch_days(ymd(1969, 12, 31)), -1);
        assert_eq!(from_epoch_days(19_844), Some(ymd(2024, 5, 1)));
    }
}
