//! Text cleanup and date inference shared by every source extractor.
//!
//! Listing pages rarely state machine-readable dates. The scan order is
//! ISO token, then month-name token (with year borrowing from trailing
//! context and roll-forward inference), then a numeric `M/D/YYYY` token.
//! Functions with an `_on` suffix take `today` explicitly so callers and
//! tests never depend on the wall clock.

use std::sync::LazyLock;

use chrono::{Datelike, Local, NaiveDate};
use regex::{Captures, Regex};

const MONTH_TOKEN: &str = "jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec";

/// How far past a month-day token a bare year may sit and still apply.
const YEAR_BORROW_WINDOW: usize = 80;

const MULTIWEEK_MIN_SPAN_DAYS: i64 = 8;

static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static CTA_WORDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(register|details|learn more|click here)\b").unwrap());

static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(20\d{2})\b").unwrap());

// The `T` alternative admits `2025-09-06T08:00:00` timestamps, which turn
// up in structured-data blocks and API payloads.
static ISO_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(20\d{2}-\d{2}-\d{2})(?:\b|T)").unwrap());

static SLASH_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(20\d{2})\b").unwrap());

static MONTH_DAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?P<month>{MONTH_TOKEN})[a-z]*\.?\s+(?P<day>\d{{1,2}})(?:st|nd|rd|th)?(?:,?\s+(?P<year>\d{{4}}))?\b"
    ))
    .unwrap()
});

static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?P<start_month>{MONTH_TOKEN})[a-z]*\.?\s+(?P<start_day>\d{{1,2}})(?:st|nd|rd|th)?\s*(?:-|–|—|\bto\b)\s*(?:(?P<end_month>{MONTH_TOKEN})[a-z]*\.?\s+)?(?P<end_day>\d{{1,2}})(?:st|nd|rd|th)?(?:,?\s+(?P<year>20\d{{2}}))?"
    ))
    .unwrap()
});

/// Collapses every whitespace run to a single space and trims the ends.
pub fn normalize_ws(text: &str) -> String {
    WS_RE.replace_all(text, " ").trim().to_string()
}

/// Normalizes a raw title: whitespace collapse, call-to-action words
/// removed, pipe separators turned into spaces.
pub fn tidy_title(text: &str) -> String {
    let cleaned = normalize_ws(text);
    let cleaned = CTA_WORDS_RE.replace_all(&cleaned, "");
    let cleaned = cleaned.replace('|', " ");
    normalize_ws(&cleaned)
}

/// Finds the first recognizable date in free text, relative to the local
/// calendar day. See [`extract_first_date_on`].
pub fn extract_first_date(text: &str) -> Option<NaiveDate> {
    extract_first_date_on(text, Local::now().date_naive())
}

/// Finds the first recognizable date in free text.
///
/// Recognized forms, in precedence order: `YYYY-MM-DD` (a trailing time
/// part is ignored), a month-name token
/// (`June 14`, `Sept. 5th, 2025`), and `M/D/YYYY`. A month-day token with
/// no year borrows the last bare year within the following
/// [`YEAR_BORROW_WINDOW`] characters; failing that it is pinned to
/// `today`'s year and rolled to the next year when the result has already
/// passed. Returns `None` when no form matches or the fields do not make a
/// real calendar date.
pub fn extract_first_date_on(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    if text.is_empty() {
        return None;
    }
    if let Some(caps) = ISO_DATE_RE.captures(text) {
        if let Ok(parsed) = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d") {
            return Some(parsed);
        }
    }
    if let Some(caps) = MONTH_DAY_RE.captures(text) {
        return resolve_month_day(&caps, text, today);
    }
    if let Some(caps) = SLASH_DATE_RE.captures(text) {
        let month: u32 = caps[1].parse().ok()?;
        let day: u32 = caps[2].parse().ok()?;
        let year: i32 = caps[3].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }
    None
}

fn resolve_month_day(caps: &Captures<'_>, text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let whole = caps.get(0)?;
    let month = month_number(&caps["month"])?;
    let day: u32 = caps["day"].parse().ok()?;
    let token_year: Option<i32> = caps.name("year").and_then(|m| m.as_str().parse().ok());
    let token_has_recent_year = YEAR_RE.is_match(whole.as_str());

    if !token_has_recent_year {
        let window: String = text[whole.end()..].chars().take(YEAR_BORROW_WINDOW).collect();
        let context_year = YEAR_RE
            .captures_iter(&window)
            .filter_map(|c| c.get(1))
            .last()
            .and_then(|m| m.as_str().parse::<i32>().ok());
        if let Some(year) = context_year {
            // The token carrying its own off-range year plus a borrowed one
            // has no single reading.
            if token_year.is_some() {
                return None;
            }
            return NaiveDate::from_ymd_opt(year, month, day);
        }
    }

    let mut parsed = NaiveDate::from_ymd_opt(token_year.unwrap_or(today.year()), month, day)?;
    if !token_has_recent_year {
        parsed = parsed.with_year(today.year())?;
        if parsed < today {
            parsed = parsed.with_year(today.year() + 1)?;
        }
    }
    Some(parsed)
}

/// True when the text contains a month-day range such as `June 1 - June 20`.
pub fn has_date_range(text: &str) -> bool {
    RANGE_RE.is_match(text)
}

/// Span of the first date range in days, relative to the local calendar
/// day. See [`date_range_span_days_on`].
pub fn date_range_span_days(text: &str) -> Option<i64> {
    date_range_span_days_on(text, Local::now().date_naive())
}

/// Span of the first date range in the text, in days.
///
/// The end month defaults to the start month. The year comes from the range
/// itself, else the first bare year anywhere in the text, else `today`'s
/// year with roll-forward applied to the start date. Ranges that wrap the
/// year boundary (`Dec 28 - Jan 4`) push the end date into the next year.
pub fn date_range_span_days_on(text: &str, today: NaiveDate) -> Option<i64> {
    let caps = RANGE_RE.captures(text)?;
    let start_month = month_number(&caps["start_month"])?;
    let start_day: u32 = caps["start_day"].parse().ok()?;
    let end_month = match caps.name("end_month") {
        Some(m) => month_number(m.as_str())?,
        None => start_month,
    };
    let end_day: u32 = caps["end_day"].parse().ok()?;

    let year = if let Some(year) = caps.name("year").and_then(|m| m.as_str().parse::<i32>().ok()) {
        year
    } else if let Some(year) = YEAR_RE.captures(text).and_then(|c| c[1].parse::<i32>().ok()) {
        year
    } else {
        let mut anchor = NaiveDate::from_ymd_opt(today.year(), start_month, start_day)?;
        if anchor < today {
            anchor = anchor.with_year(today.year() + 1)?;
        }
        anchor.year()
    };

    let start = NaiveDate::from_ymd_opt(year, start_month, start_day)?;
    let mut end = NaiveDate::from_ymd_opt(year, end_month, end_day)?;
    if end < start {
        end = end.with_year(year + 1)?;
    }
    Some((end - start).num_days())
}

/// True when the text holds a date range spanning at least eight days,
/// relative to the local calendar day.
pub fn is_multiweek_date_range(text: &str) -> bool {
    is_multiweek_date_range_on(text, Local::now().date_naive())
}

/// True when the text holds a date range spanning at least eight days.
/// Multi-week spans mark recurring league play rather than a tournament.
pub fn is_multiweek_date_range_on(text: &str, today: NaiveDate) -> bool {
    date_range_span_days_on(text, today).is_some_and(|days| days >= MULTIWEEK_MIN_SPAN_DAYS)
}

fn month_number(token: &str) -> Option<u32> {
    let number = match token.to_ascii_lowercase().as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" | "sept" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(number)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn normalize_ws_collapses_runs() {
        assert_eq!(normalize_ws("  June \t 14\n2025 "), "June 14 2025");
        assert_eq!(normalize_ws(""), "");
    }

    #[test]
    fn tidy_title_strips_cta_words_and_pipes() {
        assert_eq!(tidy_title("Register | Summer Open | Details"), "Summer Open");
        assert_eq!(tidy_title("  Sand   Series  "), "Sand Series");
        assert_eq!(tidy_title("Learn more about the Fall Classic"), "about the Fall Classic");
    }

    #[test]
    fn iso_token_wins_regardless_of_today() {
        assert_eq!(
            extract_first_date_on("2024-06-10 is the date", day("2026-01-01")),
            Some(day("2024-06-10"))
        );
    }

    #[test]
    fn invalid_iso_token_falls_through_to_month_scan() {
        assert_eq!(
            extract_first_date_on("2024-13-40 kickoff is June 14, 2025", day("2025-01-01")),
            Some(day("2025-06-14"))
        );
    }

    #[test]
    fn iso_timestamp_sheds_its_time_part() {
        assert_eq!(
            extract_first_date_on("2025-09-06T08:00:00", day("2025-01-01")),
            Some(day("2025-09-06"))
        );
        assert_eq!(extract_first_date_on("2025-09-0612", day("2025-01-01")), None);
    }

    #[test]
    fn yearless_month_rolls_forward_when_passed() {
        assert_eq!(
            extract_first_date_on("Jan 5", day("2025-03-01")),
            Some(day("2026-01-05"))
        );
        assert_eq!(
            extract_first_date_on("Jan 5", day("2025-01-01")),
            Some(day("2025-01-05"))
        );
    }

    #[test]
    fn explicit_year_is_never_rolled() {
        assert_eq!(
            extract_first_date_on("June 14, 2025", day("2026-02-01")),
            Some(day("2025-06-14"))
        );
    }

    #[test]
    fn trailing_context_year_is_borrowed() {
        assert_eq!(
            extract_first_date_on("June 14 — Summer Kickoff (season 2024)", day("2026-01-01")),
            Some(day("2024-06-14"))
        );
    }

    #[test]
    fn context_year_beyond_window_is_ignored() {
        let text = format!("June 14 {} 2024", "x".repeat(YEAR_BORROW_WINDOW));
        assert_eq!(
            extract_first_date_on(&text, day("2025-01-01")),
            Some(day("2025-06-14"))
        );
    }

    #[test]
    fn ordinal_suffixes_and_abbreviations_parse() {
        assert_eq!(
            extract_first_date_on("Sept. 5th, 2025 bracket", day("2025-01-01")),
            Some(day("2025-09-05"))
        );
    }

    #[test]
    fn slash_dates_parse() {
        assert_eq!(
            extract_first_date_on("signups close 6/14/2025", day("2025-01-01")),
            Some(day("2025-06-14"))
        );
    }

    #[test]
    fn weekday_only_text_yields_nothing() {
        assert_eq!(extract_first_date_on("every Saturday", day("2025-01-01")), None);
        assert_eq!(extract_first_date_on("", day("2025-01-01")), None);
    }

    #[test]
    fn impossible_dates_yield_nothing() {
        assert_eq!(extract_first_date_on("June 32", day("2025-01-01")), None);
        assert_eq!(extract_first_date_on("Feb 29", day("2025-03-01")), None);
    }

    #[test]
    fn range_span_is_counted_in_days() {
        let today = day("2025-01-01");
        assert_eq!(date_range_span_days_on("June 1 - June 20, 2025", today), Some(19));
        assert_eq!(date_range_span_days_on("June 1 - June 3, 2025", today), Some(2));
        assert_eq!(date_range_span_days_on("June 1-8", today), Some(7));
        assert_eq!(date_range_span_days_on("no dates here", today), None);
    }

    #[test]
    fn range_wrapping_the_year_boundary_stays_short() {
        assert_eq!(
            date_range_span_days_on("Dec 28 - Jan 4", day("2025-06-01")),
            Some(7)
        );
    }

    #[test]
    fn multiweek_threshold_is_eight_days() {
        let today = day("2025-01-01");
        assert!(is_multiweek_date_range_on("June 1 - June 20, 2025", today));
        assert!(!is_multiweek_date_range_on("June 1 - June 3, 2025", today));
        assert!(is_multiweek_date_range_on("league runs June 1 to July 15", today));
    }

    #[test]
    fn has_date_range_detects_separators() {
        assert!(has_date_range("June 1 - June 3"));
        assert!(has_date_range("June 1 to June 3"));
        assert!(has_date_range("June 1 – 9"));
        assert!(!has_date_range("June 1"));
    }
}
