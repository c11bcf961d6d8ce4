//! ATX Beach (Austin). Same site family as 512 Beach, with a smaller
//! surface: anchor parsing plus a raw sweep for the listing, and plain
//! detail pages. When a detail page offers no acceptable title the event
//! is kept under a placeholder name so the aggregator can report it
//! instead of silently losing the link.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::{info, warn};

use sideout_core::textdate::extract_first_date_on;
use sideout_core::Tournament;

use crate::jsonmine;
use crate::titles::TitleRules;
use crate::{
    canonical_link, document_text, element_text, link_path, select_first_attr, select_first_text,
    sweep_links, ExtractContext, ExtractError, SourceExtractor,
};

pub const KEY: &str = "atxbeach";
pub const SOURCE_NAME: &str = "ATX Beach";

const LISTING_URL: &str = "https://atxbeach.com/events";
const LOCATION: &str = "Austin, TX";
/// Reported by the aggregator as a missing-name event rather than shown.
const PLACEHOLDER_TITLE: &str = "ATX Beach Tournament";

static EVENT_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^/events/(\d+)$").unwrap());
static CTA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(register|more details|details|learn more)\b").unwrap());
static LINK_SWEEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)https?://atxbeach\.com/events/\d+\b|/events/\d+\b").unwrap());

static TITLE_RULES: LazyLock<TitleRules> = LazyLock::new(|| TitleRules {
    generic_phrases: &["atx beach volleyball", "beach volleyball in austin"],
    strip_patterns: vec![
        Regex::new(r"(?i)\s*[-|•]\s*ATX Beach.*$").unwrap(),
        Regex::new(r"(?i)^\s*tournament:\s*").unwrap(),
    ],
    non_title: Regex::new(
        r"(?i)\b(view event|register|more details|details|learn more|registration|pricing|deadline|ticket)\b",
    )
    .unwrap(),
    non_title_penalty: -200,
    hints: Regex::new(
        r"(?i)\b(men'?s|women'?s|coed|avp|blind draw|byo|stop|series|tournament|spring|summer|fall)\b",
    )
    .unwrap(),
    hint_bonus: 40,
    tournament_prefix_bonus: 0,
    league_mismatch_penalty: 0,
    max_length: 100,
    length_bonus: 10,
    date_like_penalty: -8,
    bare_year_penalty: -3,
});

fn is_event_link(link: &str) -> bool {
    link_path(link).is_some_and(|path| EVENT_PATH_RE.is_match(&path))
}

fn event_id(link: &str) -> u64 {
    link_path(link)
        .and_then(|path| EVENT_PATH_RE.captures(&path).and_then(|c| c[1].parse().ok()))
        .unwrap_or(0)
}

/// Event links from the listing page.
pub fn listing_links(html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    let mut push = |link: String, seen: &mut HashSet<String>, links: &mut Vec<String>| {
        if is_event_link(&link) && seen.insert(link.clone()) {
            links.push(link);
        }
    };
    if let Ok(selector) = Selector::parse("a[href]") {
        for anchor in doc.select(&selector) {
            let href = anchor.value().attr("href").unwrap_or("");
            let Some(link) = canonical_link(LISTING_URL, href) else {
                continue;
            };
            let text = element_text(anchor);
            if is_event_link(&link) || CTA_RE.is_match(&text) {
                push(link, &mut seen, &mut links);
            }
        }
    }
    for link in sweep_links(html, &LINK_SWEEP_RE, LISTING_URL) {
        push(link, &mut seen, &mut links);
    }
    links
}

fn detail_title(doc: &Html) -> Option<String> {
    let mut candidates: Vec<String> = Vec::new();
    let selectors: &[(&str, Option<&str>)] = &[
        (r#"meta[property="og:title"]"#, Some("content")),
        (r#"meta[name="twitter:title"]"#, Some("content")),
        ("h1", None),
        ("h2", None),
        ("h3", None),
        ("title", None),
    ];
    for (selector, attr) in selectors {
        let candidate = match attr {
            Some(attr) => select_first_attr(doc, selector, attr),
            None => select_first_text(doc, selector),
        };
        if let Some(candidate) = candidate {
            candidates.push(candidate);
        }
    }
    let values = jsonmine::parse_blocks(&jsonmine::json_ld_blocks(doc));
    candidates.extend(jsonmine::top_level_names(&values));
    TITLE_RULES.select_best(candidates)
}

fn detail_date(doc: &Html, today: NaiveDate) -> Option<NaiveDate> {
    let values = jsonmine::parse_blocks(&jsonmine::json_ld_blocks(doc));
    for obj in jsonmine::top_level_objects(&values) {
        for key in jsonmine::START_DATE_KEYS {
            if let Some(text) = obj.get(*key).and_then(Value::as_str) {
                if let Some(date) = extract_first_date_on(text, today) {
                    return Some(date);
                }
            }
        }
    }
    extract_first_date_on(&document_text(doc), today)
}

/// Parses a detail page. Always yields a record; an unusable title turns
/// into the placeholder.
pub fn parse_detail(html: &str, link: &str, today: NaiveDate) -> Tournament {
    let doc = Html::parse_document(html);
    let title = detail_title(&doc).unwrap_or_else(|| PLACEHOLDER_TITLE.to_string());
    Tournament {
        title,
        source: SOURCE_NAME.to_string(),
        link: link.to_string(),
        date: detail_date(&doc, today),
        location: Some(LOCATION.to_string()),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AtxBeach;

#[async_trait]
impl SourceExtractor for AtxBeach {
    fn source_key(&self) -> &'static str {
        KEY
    }

    fn source_name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn scrape(&self, ctx: &ExtractContext) -> Result<Vec<Tournament>, ExtractError> {
        let page = ctx.http.fetch_text(ctx.run_id, KEY, LISTING_URL).await?;
        let mut links = listing_links(&page.body);
        links.sort_by_key(|link| std::cmp::Reverse(event_id(link)));

        let mut tournaments = Vec::new();
        for link in &links {
            let page = match ctx.http.fetch_text(ctx.run_id, KEY, link).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(url = link.as_str(), error = %err, "detail fetch failed");
                    continue;
                }
            };
            tournaments.push(parse_detail(&page.body, link, ctx.today));
        }

        info!(links = links.len(), tournaments = tournaments.len(), "scrape finished");
        Ok(tournaments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    }

    #[test]
    fn listing_links_dedup_and_keep_event_shape() {
        let html = r#"
            <a href="/events/12">June Open</a>
            <a href="https://atxbeach.com/events/12?s=1">Details</a>
            <a href="/contact">Contact</a>
        "#;
        assert_eq!(listing_links(html), vec!["https://atxbeach.com/events/12".to_string()]);
    }

    #[test]
    fn detail_with_a_real_title_keeps_it() {
        let html = r#"<html><head>
            <meta property="og:title" content="Coed Quads Open - ATX Beach">
            <script type="application/ld+json">{"startDate":"2025-07-12"}</script>
            </head></html>"#;
        let tournament = parse_detail(html, "https://atxbeach.com/events/12", today());
        assert_eq!(tournament.title, "Coed Quads Open");
        assert_eq!(tournament.date, NaiveDate::from_ymd_opt(2025, 7, 12));
    }

    #[test]
    fn chrome_only_detail_falls_back_to_the_placeholder() {
        let html = r#"<html><head><title>ATX Beach Volleyball</title></head>
            <body><p>Next up: July 12, 2025</p></body></html>"#;
        let tournament = parse_detail(html, "https://atxbeach.com/events/9", today());
        assert_eq!(tournament.title, PLACEHOLDER_TITLE);
        assert_eq!(tournament.date, NaiveDate::from_ymd_opt(2025, 7, 12));
    }
}
