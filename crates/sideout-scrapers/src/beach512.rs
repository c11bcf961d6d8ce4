//! 512 Beach (Austin). A static site with numbered event pages. Listing
//! discovery degrades in stages: anchor parsing, a raw-HTML sweep, the
//! sitemaps, and finally a rendered pass when everything else came up
//! empty. Detail pages are plain HTML, with a rendered fallback for the
//! case where links exist but none of them parsed.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use serde_json::Value;
use tracing::{info, warn};

use sideout_core::textdate::{extract_first_date_on, normalize_ws};
use sideout_core::Tournament;
use sideout_storage::render::{RenderError, RenderSessionOptions};

use crate::jsonmine;
use crate::titles::TitleRules;
use crate::{
    canonical_link, document_text, element_text, link_path, select_first_attr, select_first_text,
    sweep_links, ExtractContext, ExtractError, SourceExtractor,
};

pub const KEY: &str = "beach512";
pub const SOURCE_NAME: &str = "512 Beach";

const LISTING_URL: &str = "https://512beach.com/events";
const LOCATION: &str = "Austin, TX";
const SITEMAP_URLS: &[&str] = &[
    "https://512beach.com/sitemap.xml",
    "https://512beach.com/sitemap_index.xml",
];
const RENDER_TIMEOUT_MS: u64 = 30_000;

static EVENT_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^/events/(\d+)$").unwrap());
static CTA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(register|more details|details|learn more)\b").unwrap());
static LINK_SWEEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)https?://512beach\.com/events/\d+\b|/events/\d+\b").unwrap());
static LOC_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<loc>(.*?)</loc>").unwrap());
static DATE_WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bdate\b").unwrap());

static TITLE_RULES: LazyLock<TitleRules> = LazyLock::new(|| TitleRules {
    generic_phrases: &[
        "fiveonetwo beach",
        "512 beach volleyball",
        "all things beach volleyball in austin",
        "austin beach volleyball",
    ],
    strip_patterns: vec![
        Regex::new(r"(?i)\s*[-|•]\s*512 Beach.*$").unwrap(),
        Regex::new(r"(?i)^\s*tournament:\s*").unwrap(),
    ],
    non_title: Regex::new(
        r"(?i)\b(view event|register|more details|details|learn more|early\s*,?\s*regular\s*,?\s*&?\s*late\s*registration|registration|pricing|deadline|ticket)\b",
    )
    .unwrap(),
    non_title_penalty: -200,
    hints: Regex::new(
        r"(?i)\b(men'?s|women'?s|coed|avp|blind draw|byo|stop|series|tournament|triple crown|revco|spring|summer|fall)\b",
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

fn push_if_event(link: Option<String>, seen: &mut HashSet<String>, links: &mut Vec<String>) {
    if let Some(link) = link {
        if is_event_link(&link) && seen.insert(link.clone()) {
            links.push(link);
        }
    }
}

/// Event links from the listing page: event-shaped anchors, anchors with
/// call-to-action text, and a raw sweep for links hiding in scripts.
pub fn listing_links(html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    if let Ok(selector) = Selector::parse("a[href]") {
        for anchor in doc.select(&selector) {
            let href = anchor.value().attr("href").unwrap_or("");
            let Some(link) = canonical_link(LISTING_URL, href) else {
                continue;
            };
            let text = element_text(anchor);
            if !(is_event_link(&link) || CTA_RE.is_match(&text)) {
                continue;
            }
            push_if_event(Some(link), &mut seen, &mut links);
        }
    }
    for link in sweep_links(html, &LINK_SWEEP_RE, LISTING_URL) {
        push_if_event(Some(link), &mut seen, &mut links);
    }
    links
}

fn unescape_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Event links pulled out of sitemap XML without parsing it as XML: a
/// link sweep plus every `<loc>` entry.
pub fn sitemap_links_from_text(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for link in sweep_links(text, &LINK_SWEEP_RE, LISTING_URL) {
        push_if_event(Some(link), &mut seen, &mut links);
    }
    for caps in LOC_TAG_RE.captures_iter(text) {
        let loc = normalize_ws(&unescape_entities(caps[1].trim()));
        push_if_event(canonical_link(LISTING_URL, &loc), &mut seen, &mut links);
    }
    links
}

async fn sitemap_links(ctx: &ExtractContext) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for sitemap_url in SITEMAP_URLS {
        let page = match ctx.http.fetch_text(ctx.run_id, KEY, sitemap_url).await {
            Ok(page) => page,
            Err(err) => {
                warn!(url = sitemap_url, error = %err, "sitemap fetch failed");
                continue;
            }
        };
        for link in sitemap_links_from_text(&page.body) {
            push_if_event(Some(link), &mut seen, &mut links);
        }
    }
    links
}

async fn rendered_listing_links(ctx: &ExtractContext) -> Vec<String> {
    let attempt: Result<Vec<String>, RenderError> = async {
        let options = RenderSessionOptions {
            api_url_tokens: Vec::new(),
            block_media: true,
            default_timeout_ms: RENDER_TIMEOUT_MS,
        };
        let mut session = ctx.renderer.open(options).await?;
        let found = session.goto(LISTING_URL, Some(r#"a[href*="/events/"]"#)).await?;
        if !found {
            session.wait_millis(2500).await?;
        }
        let mut seen = HashSet::new();
        let mut links = Vec::new();
        for href in session.hrefs().await? {
            push_if_event(canonical_link(LISTING_URL, &href), &mut seen, &mut links);
        }
        let html = session.page_html().await?;
        for link in sweep_links(&html, &LINK_SWEEP_RE, LISTING_URL) {
            push_if_event(Some(link), &mut seen, &mut links);
        }
        Ok(links)
    }
    .await;
    match attempt {
        Ok(links) => links,
        Err(err) => {
            warn!(error = %err, "rendered listing fallback failed");
            Vec::new()
        }
    }
}

fn detail_title(doc: &Html) -> Option<String> {
    let mut candidates: Vec<String> = Vec::new();
    let selectors: &[(&str, Option<&str>)] = &[
        (r#"meta[property="og:title"]"#, Some("content")),
        (r#"meta[name="twitter:title"]"#, Some("content")),
        ("h1", None),
        ("h2", None),
        ("h3", None),
        ("h4", None),
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

/// Elements whose own text mentions "date" and stays short enough to be
/// a heading-plus-value pair.
fn date_near_heading(doc: &Html, today: NaiveDate) -> Option<NaiveDate> {
    for element in doc.root_element().descendants().filter_map(ElementRef::wrap) {
        let mentions_date = element.children().any(|child| match child.value() {
            Node::Text(text) => DATE_WORD_RE.is_match(&text.text),
            _ => false,
        });
        if !mentions_date {
            continue;
        }
        let snippet = element_text(element);
        if snippet.is_empty() || snippet.chars().count() > 220 {
            continue;
        }
        if let Some(date) = extract_first_date_on(&snippet, today) {
            return Some(date);
        }
    }
    None
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
    if let Some(date) = date_near_heading(doc, today) {
        return Some(date);
    }
    extract_first_date_on(&document_text(doc), today)
}

/// Parses one event detail page. `None` when no candidate clears the
/// title threshold.
pub fn parse_detail(html: &str, link: &str, today: NaiveDate) -> Option<Tournament> {
    let doc = Html::parse_document(html);
    let title = detail_title(&doc)?;
    let date = detail_date(&doc, today);
    Some(Tournament {
        title,
        source: SOURCE_NAME.to_string(),
        link: link.to_string(),
        date,
        location: Some(LOCATION.to_string()),
    })
}

async fn rendered_details(ctx: &ExtractContext, links: &[String]) -> Vec<Tournament> {
    let attempt: Result<Vec<Tournament>, RenderError> = async {
        let options = RenderSessionOptions {
            api_url_tokens: Vec::new(),
            block_media: true,
            default_timeout_ms: RENDER_TIMEOUT_MS,
        };
        let mut session = ctx.renderer.open(options).await?;
        let mut tournaments = Vec::new();
        for link in links {
            if session.goto(link, None).await.is_err() {
                continue;
            }
            if session.wait_millis(1000).await.is_err() {
                continue;
            }
            let Ok(detail) = session.detail_snapshot().await else {
                continue;
            };
            let mut candidates = detail.title_candidates;
            for value in jsonmine::parse_blocks(&detail.json_ld) {
                if let Value::Object(map) = &value {
                    if let Some(name) = map.get("name").and_then(Value::as_str) {
                        candidates.push(name.to_string());
                    }
                }
            }
            let Some(title) = TITLE_RULES.select_best(candidates) else {
                continue;
            };
            let body = normalize_ws(&detail.body);
            tournaments.push(Tournament {
                title,
                source: SOURCE_NAME.to_string(),
                link: link.clone(),
                date: extract_first_date_on(&body, ctx.today),
                location: Some(LOCATION.to_string()),
            });
        }
        Ok(tournaments)
    }
    .await;
    match attempt {
        Ok(tournaments) => tournaments,
        Err(err) => {
            warn!(error = %err, "rendered detail fallback failed");
            Vec::new()
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Beach512;

#[async_trait]
impl SourceExtractor for Beach512 {
    fn source_key(&self) -> &'static str {
        KEY
    }

    fn source_name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn scrape(&self, ctx: &ExtractContext) -> Result<Vec<Tournament>, ExtractError> {
        let mut links = match ctx.http.fetch_text(ctx.run_id, KEY, LISTING_URL).await {
            Ok(page) => listing_links(&page.body),
            Err(err) => {
                warn!(error = %err, "listing fetch failed");
                Vec::new()
            }
        };
        if links.is_empty() {
            links = sitemap_links(ctx).await;
        }
        if links.is_empty() {
            links = rendered_listing_links(ctx).await;
        }
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
            if let Some(tournament) = parse_detail(&page.body, link, ctx.today) {
                tournaments.push(tournament);
            }
        }

        if tournaments.is_empty() && !links.is_empty() {
            tournaments = rendered_details(ctx, &links).await;
        }

        info!(links = links.len(), tournaments = tournaments.len(), "scrape finished");
        Ok(tournaments)
    }
}
