//! 210 Beach Sideliners (San Antonio). A schedule table like Third
//! Coast's, but self-hosted: rows never point at VolleyballLife, so no
//! detail lookups happen. A nameless row with a date still surfaces as a
//! placeholder for the aggregator to report.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use regex::Regex;
use scraper::{Html, Selector};
use tracing::info;

use sideout_core::textdate::{extract_first_date_on, tidy_title};
use sideout_core::Tournament;

use crate::{element_text, join_link, ExtractContext, ExtractError, SourceExtractor};

pub const KEY: &str = "beach210";
pub const SOURCE_NAME: &str = "210 Beach Sideliners";

const LISTING_URL: &str = "https://210beachsideliners.com/schedule";
const LOCATION: &str = "San Antonio, TX";
const PLACEHOLDER_TITLE: &str = "210 Beach Sideliners Tournament";

const PAST_SECTION_NEEDLES: &[&str] = &[
    "past tournament",
    "past event",
    "past result",
    "previous tournament",
];

static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(20\d{2})\b").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRow {
    pub date_text: String,
    pub name_text: String,
    pub link: String,
}

pub fn table_rows(html: &str) -> Vec<ScheduleRow> {
    let doc = Html::parse_document(html);
    let (Ok(row_selector), Ok(cell_selector), Ok(anchor_selector)) = (
        Selector::parse("tr"),
        Selector::parse("td, th"),
        Selector::parse("a[href]"),
    ) else {
        return Vec::new();
    };
    let mut rows = Vec::new();
    for row in doc.select(&row_selector) {
        let cells: Vec<_> = row.select(&cell_selector).collect();
        if cells.len() < 2 {
            continue;
        }
        let link = row
            .select(&anchor_selector)
            .find_map(|anchor| {
                let href = anchor.value().attr("href").unwrap_or("").trim();
                if href.is_empty() || href.starts_with('#') {
                    return None;
                }
                join_link(LISTING_URL, href)
            })
            .unwrap_or_else(|| LISTING_URL.to_string());
        rows.push(ScheduleRow {
            date_text: element_text(cells[0]),
            name_text: element_text(cells[1]),
            link,
        });
    }
    rows
}

fn is_header_row(date_text: &str, name_text: &str) -> bool {
    if date_text.is_empty() {
        return true;
    }
    date_text.eq_ignore_ascii_case("date")
        && (name_text.eq_ignore_ascii_case("name") || name_text.eq_ignore_ascii_case("event"))
}

fn is_past_section(date_text: &str, name_text: &str) -> bool {
    let combined = format!("{date_text} {name_text}").to_lowercase();
    PAST_SECTION_NEEDLES.iter().any(|needle| combined.contains(needle))
}

fn explicit_year(text: &str) -> Option<i32> {
    YEAR_RE.captures(text).and_then(|caps| caps[1].parse().ok())
}

/// Turns raw rows into tournaments: header and past-section handling,
/// explicit-past-year and past-date drops, title/date dedup.
pub fn rows_to_tournaments(rows: Vec<ScheduleRow>, today: NaiveDate) -> Vec<Tournament> {
    let mut tournaments = Vec::new();
    let mut seen: HashSet<(String, NaiveDate)> = HashSet::new();
    for row in rows {
        if is_header_row(&row.date_text, &row.name_text) {
            continue;
        }
        if is_past_section(&row.date_text, &row.name_text) {
            break;
        }
        let Some(event_date) = extract_first_date_on(&row.date_text, today) else {
            continue;
        };
        let row_text = format!("{} {}", row.date_text, row.name_text);
        if explicit_year(&row_text).is_some_and(|year| year < today.year()) {
            continue;
        }
        if event_date < today {
            continue;
        }
        let title = match tidy_title(&row.name_text) {
            title if title.is_empty() => PLACEHOLDER_TITLE.to_string(),
            title => title,
        };
        if !seen.insert((title.to_lowercase(), event_date)) {
            continue;
        }
        tournaments.push(Tournament {
            title,
            source: SOURCE_NAME.to_string(),
            link: row.link,
            date: Some(event_date),
            location: Some(LOCATION.to_string()),
        });
    }
    tournaments
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Beach210;

#[async_trait]
impl SourceExtractor for Beach210 {
    fn source_key(&self) -> &'static str {
        KEY
    }

    fn source_name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn scrape(&self, ctx: &ExtractContext) -> Result<Vec<Tournament>, ExtractError> {
        let page = ctx.http.fetch_text(ctx.run_id, KEY, LISTING_URL).await?;
        let tournaments = rows_to_tournaments(table_rows(&page.body), ctx.today);
        info!(tournaments = tournaments.len(), "scrape finished");
        Ok(tournaments)
    }
}
