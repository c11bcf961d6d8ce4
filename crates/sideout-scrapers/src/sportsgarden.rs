//! Sports Garden DFW (Coppell). An organization subdomain on the
//! VolleyballLife platform, so everything renders client-side: the
//! listing needs the helper, API payloads are mined for event rows, and
//! each detail page is snapshotted for labels and dates. Multi-week date
//! ranges mark leagues and are dropped.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use sideout_core::textdate::{extract_first_date_on, is_multiweek_date_range_on, normalize_ws};
use sideout_core::Tournament;
use sideout_storage::render::{RenderError, RenderSessionOptions};

use crate::jsonmine;
use crate::titles::TitleRules;
use crate::vlife::{self, ApiMineRules, ClassificationSignals, CrawlPolicy};
use crate::{link_host, link_path, ExtractContext, ExtractError, SourceExtractor};

pub const KEY: &str = "sportsgarden";
pub const SOURCE_NAME: &str = "Sports Garden DFW";

const LISTING_URL: &str = "https://cvb.volleyballlife.com/events";
const LOCATION: &str = "Dallas-Fort Worth, TX";
const HOST: &str = "cvb.volleyballlife.com";
const ORG_USERNAME: &str = "cvb";
const RENDER_TIMEOUT_MS: u64 = 30_000;

/// The org API also serves roster/summary endpoints worth mining.
const API_URL_TOKENS: &[&str] = &[
    "/event",
    "/events",
    "graphql",
    "search",
    "calendar",
    "list",
    "summary",
    "summaries",
];

const CRAWL: CrawlPolicy = CrawlPolicy {
    max_rounds: 50,
    wants: vlife::PAGINATION_WANTS,
    match_next_class: true,
};

static EVENT_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^/events?/(\d+)$").unwrap());

static TITLE_RULES: LazyLock<TitleRules> = LazyLock::new(|| TitleRules {
    generic_phrases: &[],
    strip_patterns: vec![
        Regex::new(r"(?i)\s*[-|•]\s*VolleyballLife.*$").unwrap(),
        Regex::new(r"(?i)\s*[-|•]\s*Sports Garden DFW.*$").unwrap(),
    ],
    non_title: Regex::new(
        r"(?i)\b(view event|view tournament|register|details|more details|learn more|information|pricing|deadline)\b",
    )
    .unwrap(),
    non_title_penalty: -220,
    hints: Regex::new(
        r"(?i)\b(tournament|men'?s|women'?s|coed|avp|blind draw|byo|revco|stop|series|triple crown|purse|spring|summer|fall|open|classic)\b",
    )
    .unwrap(),
    hint_bonus: 35,
    tournament_prefix_bonus: 10,
    league_mismatch_penalty: -120,
    max_length: 140,
    length_bonus: 8,
    date_like_penalty: -7,
    bare_year_penalty: 0,
});

fn is_event_link(link: &str) -> bool {
    link_host(link).is_some_and(|host| host == HOST)
        && link_path(link).is_some_and(|path| EVENT_PATH_RE.is_match(&path))
}

fn mine_rules() -> ApiMineRules<'static> {
    ApiMineRules {
        base_url: LISTING_URL,
        synth_host: HOST,
        min_indicators: 2,
        expected_org_username: Some(ORG_USERNAME),
        include_city_state: false,
        is_event: is_event_link,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SportsGarden;

#[async_trait]
impl SourceExtractor for SportsGarden {
    fn source_key(&self) -> &'static str {
        KEY
    }

    fn source_name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn scrape(&self, ctx: &ExtractContext) -> Result<Vec<Tournament>, ExtractError> {
        let options = RenderSessionOptions {
            api_url_tokens: API_URL_TOKENS.iter().map(|t| t.to_string()).collect(),
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
                false,
            );
            let json_ld = jsonmine::parse_blocks(&detail.json_ld);

            // Multi-week ranges are leagues here, not tournaments.
            if is_multiweek_date_range_on(&list_context, ctx.today)
                || is_multiweek_date_range_on(&detail_body, ctx.today)
                || jsonmine::has_multiweek_range(&json_ld, ctx.today)
            {
                continue;
            }

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
                override_present: false,
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

            tournaments.push(Tournament {
                title,
                source: SOURCE_NAME.to_string(),
                link: item.link,
                date,
                location: Some(LOCATION.to_string()),
            });
        }

        info!(tournaments = tournaments.len(), "scrape finished");
        Ok(tournaments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use sideout_storage::render::RenderedDetail;
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::testutil::{context, listing_item, ScriptedRenderer, UnavailableRenderer};

    #[test]
    fn event_links_are_bound_to_the_org_host() {
        assert!(is_event_link("https://cvb.volleyballlife.com/event/4101"));
        assert!(is_event_link("https://cvb.volleyballlife.com/events/4101"));
        assert!(!is_event_link("https://volleyballlife.com/event/4101"));
        assert!(!is_event_link("https://cvb.volleyballlife.com/events/4101/roster"));
    }

    #[test]
    fn scoring_penalizes_league_only_wording() {
        assert!(TITLE_RULES.score("Wednesday League Session") < 0);
        assert!(TITLE_RULES.score("Tournament: Spring Fling") > 0);
    }

    #[tokio::test]
    async fn missing_helper_is_a_capability_error() {
        let ctx = context(Arc::new(UnavailableRenderer), None);
        let err = SportsGarden.scrape(&ctx).await.err().expect("must fail");
        match err {
            ExtractError::CapabilityUnavailable(message) => {
                assert!(message.contains("Sports Garden DFW"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn tournaments_keep_dates_and_leagues_are_dropped() {
        let tournament_link = "https://cvb.volleyballlife.com/event/4101";
        let league_link = "https://cvb.volleyballlife.com/event/4102";
        let mut details = HashMap::new();
        details.insert(
            tournament_link.to_string(),
            RenderedDetail {
                title_candidates: vec!["Coed Quads Open | VolleyballLife".to_string()],
                labels: vec!["Tournament | Sports Garden DFW | Adult".to_string()],
                body: "Coed Quads Open June 14, 2025".to_string(),
                json_ld: vec![r#"{"name":"Coed Quads Open","startDate":"2025-06-14"}"#.to_string()],
                addresses: Vec::new(),
            },
        );
        details.insert(
            league_link.to_string(),
            RenderedDetail {
                title_candidates: vec!["Wednesday Sand Session".to_string()],
                labels: vec!["League | Sports Garden DFW | Adult".to_string()],
                body: String::new(),
                json_ld: Vec::new(),
                addresses: Vec::new(),
            },
        );
        let renderer = ScriptedRenderer {
            items: vec![
                listing_item(tournament_link, "Coed Quads Open", "", ""),
                listing_item(league_link, "Wednesday Sand Session", "", ""),
            ],
            details,
            ..Default::default()
        };
        let ctx = context(Arc::new(renderer), None);
        let tournaments = SportsGarden.scrape(&ctx).await.unwrap();
        assert_eq!(tournaments.len(), 1);
        assert_eq!(tournaments[0].title, "Coed Quads Open");
        assert_eq!(tournaments[0].date, NaiveDate::from_ymd_opt(2025, 6, 14));
        assert_eq!(tournaments[0].location.as_deref(), Some(LOCATION));
    }

    #[tokio::test]
    async fn multiweek_listings_are_dropped_as_leagues() {
        let link = "https://cvb.volleyballlife.com/event/4200";
        let mut details = HashMap::new();
        details.insert(
            link.to_string(),
            RenderedDetail {
                title_candidates: vec!["Tournament: Summer Session".to_string()],
                labels: Vec::new(),
                body: "Runs June 3 - August 5, 2025 every week".to_string(),
                json_ld: Vec::new(),
                addresses: Vec::new(),
            },
        );
        let renderer = ScriptedRenderer {
            items: vec![listing_item(link, "Summer Session", "", "")],
            details,
            ..Default::default()
        };
        let ctx = context(Arc::new(renderer), None);
        let tournaments = SportsGarden.scrape(&ctx).await.unwrap();
        assert!(tournaments.is_empty());
    }
}
