//! VolleyballLife statewide listing. The public site renders the same
//! client-side UI as the org subdomains, so the crawl, API mining, and
//! caption plumbing come from the shared platform module. Attribution is
//! the hard part here: events belong to many different hosts, recovered
//! from caption labels, venue addresses, or a curated overrides file.
//! Disabled in the default registry because the dedicated sources
//! already cover most of what it finds.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use sideout_core::textdate::{extract_first_date_on, normalize_ws};
use sideout_core::Tournament;
use sideout_storage::render::{RenderError, RenderSessionOptions};

use crate::jsonmine;
use crate::titles::TitleRules;
use crate::vlife::{self, ApiMineRules, ClassificationSignals, CrawlPolicy};
use crate::{canonical_link, link_path, ExtractContext, ExtractError, SourceExtractor};

pub const KEY: &str = "volleyballlife";
pub const SOURCE_NAME: &str = "VolleyballLife";

const LISTING_URL: &str = "https://volleyballlife.com/events";
const SYNTH_HOST: &str = "volleyballlife.com";
const RENDER_TIMEOUT_MS: u64 = 30_000;

const CRAWL: CrawlPolicy = CrawlPolicy {
    max_rounds: 60,
    wants: vlife::PAGINATION_WANTS,
    match_next_class: false,
};

static EVENT_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^/events?/(\d+)$").unwrap());

/// `City, ST` pairs pulled out of page text when no address block exists.
/// Case-sensitive on the state code to avoid prose false positives.
static CITY_STATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z .'-]+,\s*[A-Z]{2})(?:\s+\d{5})?\b").unwrap());

static TITLE_RULES: LazyLock<TitleRules> = LazyLock::new(|| TitleRules {
    generic_phrases: &[],
    strip_patterns: vec![
        Regex::new(r"(?i)\s*[-|•]\s*VolleyballLife.*$").unwrap(),
        Regex::new(r"(?i)\s*[-|•]\s*\w+\s*\|\s*Adult.*$").unwrap(),
    ],
    non_title: Regex::new(
        r"(?i)\b(view event|view tournament|register|details|more details|learn more|information|pricing|deadline|league)\b",
    )
    .unwrap(),
    non_title_penalty: -220,
    hints: Regex::new(
        r"(?i)\b(tournament|men'?s|women'?s|coed|avp|blind draw|byo|revco|stop|series|triple crown|purse|spring|summer|fall|open|classic)\b",
    )
    .unwrap(),
    hint_bonus: 35,
    tournament_prefix_bonus: 10,
    league_mismatch_penalty: 0,
    max_length: 140,
    length_bonus: 8,
    date_like_penalty: -7,
    bare_year_penalty: 0,
});

/// Statewide listing, so any host qualifies; only the `/event/<id>` path
/// shape matters.
fn is_event_link(link: &str) -> bool {
    link_path(link).is_some_and(|path| EVENT_PATH_RE.is_match(&path))
}

fn mine_rules() -> ApiMineRules<'static> {
    ApiMineRules {
        base_url: LISTING_URL,
        synth_host: SYNTH_HOST,
        min_indicators: 0,
        expected_org_username: None,
        include_city_state: true,
        is_event: is_event_link,
    }
}

/// Folds caption spelling variants onto the names the dedicated
/// extractors report, so cross-source dedup collapses them.
pub fn normalize_host(host: &str) -> String {
    let clean = normalize_ws(host);
    let low = clean.to_lowercase();
    if low.contains("210 beach") {
        return "210 Beach Sideliners".to_string();
    }
    if low.contains("sports garden dfw") {
        return "Sports Garden DFW".to_string();
    }
    if low.contains("atx beach") {
        return "ATX Beach".to_string();
    }
    if low.contains("third coast") {
        return "Third Coast VB".to_string();
    }
    clean
}

/// First usable address block, else a `City, ST` pair scraped from the
/// body text.
fn location_from(addresses: &[String], body: &str) -> Option<String> {
    for value in addresses {
        let cleaned = normalize_ws(value);
        if cleaned.chars().count() >= 6 {
            return Some(cleaned);
        }
    }
    CITY_STATE_RE.captures(body).map(|caps| normalize_ws(&caps[1]))
}

/// Known venue cities imply the host when no caption names one.
fn host_from_location(location: Option<&str>) -> Option<String> {
    let low = location?.to_lowercase();
    if low.contains("coppell") {
        return Some("Sports Garden DFW".to_string());
    }
    if low.contains("austin") {
        return Some("ATX Beach".to_string());
    }
    if low.contains("houston") {
        return Some("Houston Volleyball".to_string());
    }
    if low.contains("san antonio") {
        return Some("210 Beach Sideliners".to_string());
    }
    None
}

/// Curated `link -> host` corrections for events the captions misfile.
/// The payload is an object whose values are either plain host strings or
/// `{"host": ...}` records; anything else is skipped.
pub fn parse_host_overrides(text: &str) -> HashMap<String, String> {
    let Ok(Value::Object(payload)) = serde_json::from_str::<Value>(text) else {
        return HashMap::new();
    };
    let mut overrides = HashMap::new();
    for (raw_key, raw_value) in payload {
        let Some(link) = canonical_link(LISTING_URL, &raw_key) else {
            continue;
        };
        let host = match &raw_value {
            Value::String(host) => host.as_str(),
            Value::Object(record) => record.get("host").and_then(Value::as_str).unwrap_or(""),
            _ => "",
        };
        let host = normalize_host(host);
        if !host.is_empty() {
            overrides.insert(link, host);
        }
    }
    overrides
}

/// A missing or malformed overrides file is not an error; the scrape just
/// runs without corrections.
async fn load_host_overrides(path: Option<&Path>) -> HashMap<String, String> {
    let Some(path) = path else {
        return HashMap::new();
    };
    match tokio::fs::read_to_string(path).await {
        Ok(text) => parse_host_overrides(&text),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "no host overrides loaded");
            HashMap::new()
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct VolleyballLife;

#[async_trait]
impl SourceExtractor for VolleyballLife {
    fn source_key(&self) -> &'static str {
        KEY
    }

    fn source_name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn scrape(&self, ctx: &ExtractContext) -> Result<Vec<Tournament>, ExtractError> {
        let options = RenderSessionOptions {
            api_url_tokens: vlife::API_URL_TOKENS.iter().map(|t| t.to_string()).collect(),
            block_media: true,
            default_timeout_ms: RENDER_TIMEOUT_MS,
        };
        let mut session = match ctx.renderer.open(options).await {
            Ok(session) => session,
            Err(RenderError::Unavailable(reason)) => {
                return Err(ExtractError::CapabilityUnavailable(format!(
                    "{SOURCE_NAME} scraping requires the rendering helper: {reason}"
                )));
            }
            Err(err) => return Err(err.into()),
        };

        let rules = mine_rules();
        let items =
            vlife::collect_rendered_listing(session.as_mut(), LISTING_URL, &CRAWL, &rules).await?;
        info!(items = items.len(), "listing collected");

        let host_overrides = load_host_overrides(ctx.host_overrides_path.as_deref()).await;

        let mut tournaments = Vec::new();
        let mut seen_links: HashSet<String> = HashSet::new();
        for item in items {
            if !seen_links.insert(item.link.clone()) {
                continue;
            }
            let list_context = normalize_ws(&item.context);
            let list_label = normalize_ws(&item.label);
            let list_title = TITLE_RULES.select_best(vec![item.text.clone(), list_context.clone()]);

            let detail = match vlife::rendered_detail(session.as_mut(), &item.link).await {
                Ok(detail) => detail,
                Err(err) => {
                    warn!(link = item.link.as_str(), error = %err, "detail snapshot failed");
                    Default::default()
                }
            };
            let detail_body = normalize_ws(&detail.body);
            let labels = vlife::assemble_labels(
                &list_label,
                &detail.labels,
                &list_context,
                &detail_body,
                true,
            );
            let json_ld = jsonmine::parse_blocks(&detail.json_ld);

            let mut title_candidates: Vec<String> = Vec::new();
            title_candidates.extend(list_title.clone());
            title_candidates.extend(detail.title_candidates.iter().cloned());
            title_candidates.extend(jsonmine::all_names(&json_ld));
            let Some(title) = TITLE_RULES.select_best(title_candidates.clone()) else {
                continue;
            };

            let signals = ClassificationSignals {
                tournament_label: labels.iter().any(|l| vlife::is_tournament_label(l)),
                league_label: labels.iter().any(|l| vlife::is_league_label(l)),
                tournament_title: vlife::is_tournament_title(&title)
                    || title_candidates.iter().any(|c| vlife::is_tournament_title(c)),
                override_present: host_overrides.contains_key(&item.link),
            };
            if vlife::should_skip_as_league(signals, &title, &detail_body) {
                continue;
            }

            let date = jsonmine::first_start_date(&json_ld, ctx.today)
                .or_else(|| extract_first_date_on(&list_context, ctx.today))
                .or_else(|| {
                    (!detail_body.is_empty())
                        .then(|| extract_first_date_on(&detail_body, ctx.today))
                        .flatten()
                });

            let location = location_from(&detail.addresses, &detail_body);
            let mut host = labels.iter().find_map(|l| vlife::host_from_label(l));
            if host.is_none() {
                host = host_from_location(location.as_deref());
            }
            if let Some(correction) = host_overrides.get(&item.link) {
                host = Some(correction.clone());
            }
            let source = host
                .map(|h| normalize_host(&h))
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| SOURCE_NAME.to_string());

            tournaments.push(Tournament {
                title,
                source,
                link: item.link,
                date,
                location: Some(location.unwrap_or_else(|| "N/A".to_string())),
            });
        }

        info!(tournaments = tournaments.len(), "scrape finished");
        Ok(tournaments)
    }
}
