//! Third Coast VB (Houston). A server-rendered schedule table: each row
//! carries a date cell and a name cell. Rows without an explicit year
//! are resolved against their VolleyballLife detail page, and rows that
//! cannot be resolved are skipped rather than guessed into the current
//! year. A dead listing endpoint is this source's hard failure.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::{info, warn};

use sideout_core::textdate::{extract_first_date_on, tidy_title};
use sideout_core::Tournament;

use crate::jsonmine;
use crate::{document_text, element_text, join_link, ExtractContext, ExtractError, SourceExtractor};

pub const KEY: &str = "thirdcoast";
pub const SOURCE_NAME: &str = "Third Coast VB";

const LISTING_URL: &str = "https://thirdcoastvolleyball.com/tournaments/tournament-schedule/";
const LOCATION: &str = "Houston, TX";

const PAST_SECTION_NEEDLES: &[&str] = &[
    "past tournament",
    "past event",
    "past result",
    "previous tournament",
];

/// JSON-LD keys checked on detail pages, in lookup order.
const DETAIL_DATE_KEYS: &[&str] = &["startDate", "date", "dateStart", "start_date"];

static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(20\d{2})\b").unwrap());
static ISO_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b20\d{2}-\d{2}-\d{2}\b").unwrap());
static LONG_DATE_WITH_YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]*\.?\s+\d{1,2}(?:st|nd|rd|th)?(?:\s*-\s*\d{1,2}(?:st|nd|rd|th)?)?,?\s+\d{4}\b",
    )
    .unwrap()
});

/// One schedule row before any filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRow {
    pub date_text: String,
    pub name_text: String,
    pub link: String,
}

/// Rows of every table on the page, in document order.
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
    if date_text.is_empty() || name_text.is_empty() {
        return true;
    }
    date_text.eq_ignore_ascii_case("date") && name_text.eq_ignore_ascii_case("name")
}

fn is_past_section(date_text: &str, name_text: &str) -> bool {
    let combined = format!("{date_text} {name_text}").to_lowercase();
    PAST_SECTION_NEEDLES.iter().any(|needle| combined.contains(needle))
}

fn explicit_year(text: &str) -> Option<i32> {
    YEAR_RE.captures(text).and_then(|caps| caps[1].parse().ok())
}

pub(crate) fn is_volleyballlife_event_link(link: &str) -> bool {
    let lower = link.to_lowercase();
    lower.contains("volleyballlife.com/event/") || lower.contains("volleyballlife.com/events/")
}

/// What to do with one row, before the shared date/dedup filters.
#[derive(Debug, PartialEq, Eq)]
pub enum RowDecision {
    Skip,
    /// A past-section marker; nothing below it is current.
    Stop,
    Keep { title: String, date: NaiveDate },
    /// Yearless row: trust the detail page over the inferred date.
    NeedsDetail { title: String, inferred: NaiveDate },
}

pub fn classify_row(row: &ScheduleRow, today: NaiveDate) -> RowDecision {
    if is_header_row(&row.date_text, &row.name_text) {
        return RowDecision::Skip;
    }
    if is_past_section(&row.date_text, &row.name_text) {
        return RowDecision::Stop;
    }
    let title = tidy_title(&row.name_text);
    if title.is_empty() {
        return RowDecision::Skip;
    }
    let Some(inferred) = extract_first_date_on(&row.date_text, today) else {
        return RowDecision::Skip;
    };
    let row_text = format!("{} {}", row.date_text, row.name_text);
    match explicit_year(&row_text) {
        Some(year) if year < today.year() => RowDecision::Skip,
        Some(_) => RowDecision::Keep { title, date: inferred },
        None => RowDecision::NeedsDetail { title, inferred },
    }
}

/// First parseable date on a VolleyballLife detail page: ISO and
/// long-form dates inside JSON-LD blocks, then top-level JSON-LD date
/// keys, then the page body.
pub fn date_from_detail_html(html: &str, today: NaiveDate) -> Option<NaiveDate> {
    let doc = Html::parse_document(html);
    let mut candidates: Vec<String> = Vec::new();
    for raw in jsonmine::json_ld_blocks(&doc) {
        candidates.extend(ISO_DATE_RE.find_iter(&raw).map(|m| m.as_str().to_string()));
        candidates.extend(LONG_DATE_WITH_YEAR_RE.find_iter(&raw).map(|m| m.as_str().to_string()));
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw.trim()) {
            for key in DETAIL_DATE_KEYS {
                if let Some(text) = map.get(*key).and_then(Value::as_str) {
                    candidates.push(text.to_string());
                }
            }
        }
    }
    let body = document_text(&doc);
    candidates.extend(ISO_DATE_RE.find_iter(&body).map(|m| m.as_str().to_string()));
    candidates.extend(LONG_DATE_WITH_YEAR_RE.find_iter(&body).map(|m| m.as_str().to_string()));
    candidates
        .into_iter()
        .find_map(|candidate| extract_first_date_on(&candidate, today))
}

async fn detail_date(ctx: &ExtractContext, link: &str) -> Option<NaiveDate> {
    if !is_volleyballlife_event_link(link) {
        return None;
    }
    let page = match ctx.http.fetch_text(ctx.run_id, KEY, link).await {
        Ok(page) => page,
        Err(err) => {
            warn!(url = link, error = %err, "detail lookup failed");
            return None;
        }
    };
    date_from_detail_html(&page.body, ctx.today)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThirdCoast;

#[async_trait]
impl SourceExtractor for ThirdCoast {
    fn source_key(&self) -> &'static str {
        KEY
    }

    fn source_name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn scrape(&self, ctx: &ExtractContext) -> Result<Vec<Tournament>, ExtractError> {
        let page = ctx.http.fetch_text(ctx.run_id, KEY, LISTING_URL).await?;
        let rows = table_rows(&page.body);

        let mut tournaments = Vec::new();
        let mut seen: HashSet<(String, NaiveDate)> = HashSet::new();
        let mut cache: HashMap<String, Option<NaiveDate>> = HashMap::new();
        for row in rows {
            let (title, event_date) = match classify_row(&row, ctx.today) {
                RowDecision::Skip => continue,
                RowDecision::Stop => break,
                RowDecision::Keep { title, date } => (title, date),
                RowDecision::NeedsDetail { title, inferred } => {
                    let resolved = match cache.get(&row.link) {
                        Some(cached) => *cached,
                        None => {
                            let fetched = detail_date(ctx, &row.link).await;
                            cache.insert(row.link.clone(), fetched);
                            fetched
                        }
                    };
                    match resolved {
                        Some(date) => (title, date),
                        // A yearless VolleyballLife row that cannot be
                        // resolved may be a historical event; drop it.
                        None if is_volleyballlife_event_link(&row.link) => continue,
                        None => (title, inferred),
                    }
                }
            };
            if event_date < ctx.today {
                continue;
            }
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

        info!(tournaments = tournaments.len(), "scrape finished");
        Ok(tournaments)
    }
}
