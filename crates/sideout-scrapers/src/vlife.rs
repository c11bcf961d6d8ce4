//! Shared machinery for VolleyballLife-platform listings. The public
//! site and per-organization subdomains render the same event UI, so the
//! pagination crawl, API payload mining, caption labels, and the
//! tournament/league classification all live here.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use sideout_core::textdate::normalize_ws;
use sideout_storage::render::{RenderError, RenderSession, RenderedDetail, RenderedItem};

use crate::jsonmine::{collect_objects, first_str};
use crate::{canonical_link, dedup_case_insensitive};

/// Anchor-href substrings that mark event links in the rendered DOM.
pub const EVENT_HREF_TOKENS: &[&str] = &["/event/", "/events/"];

/// Selector the helper waits on after navigating to a listing.
pub const LISTING_WAIT_SELECTOR: &str = r#"a[href*="/event/"], a[href*="/events/"]"#;

/// Request-URL substrings whose JSON responses are worth mining.
pub const API_URL_TOKENS: &[&str] = &["/event", "/events", "graphql", "search", "calendar", "list"];

/// Button texts the pagination clicker looks for.
pub const PAGINATION_WANTS: &[&str] = &["load more", "show more", "more events", "next", "older"];

/// Keys whose presence marks an event-shaped API object.
pub const EVENT_INDICATOR_KEYS: &[&str] = &[
    "startDate",
    "endDate",
    "teamCount",
    "divisionNames",
    "statusId",
    "urlTag",
    "locations",
    "dates",
    "sanctionedBy",
    "ibvl",
    "isPublic",
    "coordinates",
];

const API_URL_KEYS: &[&str] = &["url", "eventUrl", "event_url", "link", "permalink", "href", "publicUrl"];
const API_ID_KEYS: &[&str] = &["eventId", "event_id", "id"];
const API_TITLE_KEYS: &[&str] = &["name", "title", "eventName", "eventTitle"];
const API_LABEL_KEYS: &[&str] = &["category", "type", "eventType", "listingType", "classification", "kind"];
const API_HOST_KEYS: &[&str] = &["host", "organization", "club", "orgName", "eventHost"];
const API_CITY_KEYS: &[&str] = &["city", "addressCity"];
const API_STATE_KEYS: &[&str] = &["state", "addressState", "stateCode"];
const API_START_KEYS: &[&str] = &["startDate", "start_date", "date", "eventDate"];

const STABLE_ROUNDS_TO_STOP: u32 = 8;
const CLICK_SETTLE_MS: u64 = 1000;
const SCROLL_DELTA: i64 = 5000;
const SCROLL_SETTLE_MS: u64 = 700;
const MISSED_SELECTOR_WAIT_MS: u64 = 3000;
const DETAIL_SETTLE_MS: u64 = 1200;

static HREF_SWEEP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^"']+/events?/\d+[^"'#? ]*|/events?/\d+[^"'#? ]*"#).unwrap()
});
static LABEL_FORM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:Tournament|League)\s*\|\s*[^|\n]{2,90}\s*\|\s*(?:Adult|Adults|Junior|Juniors)\b")
        .unwrap()
});
static GENERIC_LABEL_FORM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[0-9A-Za-z &'()./\-]{2,90}\s*\|\s*(?:Adult|Adults|Junior|Juniors)\b").unwrap()
});
static LEAGUE_WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bleague\b").unwrap());

/// One merged listing row keyed by canonical link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingItem {
    pub link: String,
    pub text: String,
    pub context: String,
    pub label: String,
}

/// Knobs for mining intercepted API payloads.
pub struct ApiMineRules<'a> {
    /// Join base for relative URLs found in payloads.
    pub base_url: &'a str,
    /// Host used to synthesize `/event/<id>` links from bare ids.
    pub synth_host: &'a str,
    /// Objects need at least this many indicator keys to count.
    pub min_indicators: usize,
    /// Reject objects attributed to a different organization.
    pub expected_org_username: Option<&'a str>,
    /// Include city/state fields in the assembled context line.
    pub include_city_state: bool,
    pub is_event: fn(&str) -> bool,
}

/// Pagination behavior for one listing crawl.
pub struct CrawlPolicy {
    pub max_rounds: u32,
    pub wants: &'static [&'static str],
    pub match_next_class: bool,
}

/// Drives load-more clicks and scrolling until the distinct event-link
/// count stops growing and nothing else is clickable.
pub async fn crawl_listing(
    session: &mut dyn RenderSession,
    policy: &CrawlPolicy,
) -> Result<(), RenderError> {
    let mut previous = 0usize;
    let mut stable_rounds = 0u32;
    for round in 0..policy.max_rounds {
        let current = session.event_link_count(EVENT_HREF_TOKENS).await?;
        let clicked = session
            .click_pagination(policy.wants, policy.match_next_class)
            .await?;
        if clicked {
            session.wait_millis(CLICK_SETTLE_MS).await?;
        }
        session.scroll(SCROLL_DELTA).await?;
        session.wait_millis(SCROLL_SETTLE_MS).await?;
        if current > previous {
            previous = current;
            stable_rounds = 0;
        } else {
            stable_rounds += 1;
        }
        debug!(round, links = current, clicked, "listing crawl round");
        if stable_rounds >= STABLE_ROUNDS_TO_STOP && !clicked {
            break;
        }
    }
    Ok(())
}

/// Mines one intercepted payload for event rows.
pub fn mine_api_items(payload: &Value, rules: &ApiMineRules<'_>) -> Vec<RenderedItem> {
    let mut rows = Vec::new();
    for obj in collect_objects(payload) {
        let indicators = EVENT_INDICATOR_KEYS
            .iter()
            .filter(|key| obj.contains_key(**key))
            .count();
        if indicators < rules.min_indicators {
            continue;
        }

        if let Some(expected) = rules.expected_org_username {
            if let Some(org) = obj.get("organization").and_then(Value::as_object) {
                let username = org
                    .get("username")
                    .map(|value| match value {
                        Value::String(s) => normalize_ws(s).to_lowercase(),
                        other => normalize_ws(&other.to_string()).to_lowercase(),
                    })
                    .unwrap_or_default();
                if !username.is_empty() && username != expected {
                    continue;
                }
            }
        }

        let raw_url = first_str(obj, API_URL_KEYS).unwrap_or_default();
        let raw_id = API_ID_KEYS.iter().find_map(|key| obj.get(*key));
        let candidate = if !raw_url.is_empty()
            && (raw_url.contains("/event/") || raw_url.contains("/events/"))
        {
            Some(raw_url)
        } else if let Some(id) = raw_id.and_then(Value::as_i64).filter(|id| *id > 100) {
            Some(format!("https://{}/event/{}", rules.synth_host, id))
        } else if let Some(id) = raw_id
            .and_then(Value::as_str)
            .filter(|id| id.len() >= 3 && id.chars().all(|c| c.is_ascii_digit()))
        {
            Some(format!("https://{}/event/{}", rules.synth_host, id))
        } else {
            None
        };
        let Some(candidate) = candidate else { continue };
        let Some(link) = canonical_link(rules.base_url, &candidate) else {
            continue;
        };
        if !(rules.is_event)(&link) {
            continue;
        }

        let title = first_str(obj, API_TITLE_KEYS).unwrap_or_default();
        let label = first_str(obj, API_LABEL_KEYS).unwrap_or_default();
        let host = first_str(obj, API_HOST_KEYS).unwrap_or_default();
        let start = first_str(obj, API_START_KEYS).unwrap_or_default();
        let mut parts: Vec<String> = vec![title.clone(), start, host];
        if rules.include_city_state {
            parts.push(first_str(obj, API_CITY_KEYS).unwrap_or_default());
            parts.push(first_str(obj, API_STATE_KEYS).unwrap_or_default());
        }
        parts.push(label.clone());
        let context = parts.into_iter().filter(|p| !p.is_empty()).collect::<Vec<_>>().join(" | ");

        rows.push(RenderedItem { href: link, text: title, context, label });
    }
    rows
}

/// Distinct event-looking hrefs swept straight out of raw HTML. Used as
/// a last-resort listing group with no text or label attached.
pub fn sweep_href_items(html: &str) -> Vec<RenderedItem> {
    let mut seen = HashSet::new();
    HREF_SWEEP_RE
        .find_iter(html)
        .filter_map(|m| {
            let href = m.as_str().to_string();
            seen.insert(href.clone()).then_some(RenderedItem {
                href,
                text: String::new(),
                context: String::new(),
                label: String::new(),
            })
        })
        .collect()
}

fn richness(text: &str) -> usize {
    normalize_ws(text).chars().count()
}

/// Merges row groups by canonical link, first-seen order. Later groups
/// fill in whichever of text/context/label they saw better.
pub fn merge_listing_items(
    groups: Vec<Vec<RenderedItem>>,
    base_url: &str,
    is_event: fn(&str) -> bool,
) -> Vec<ListingItem> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, ListingItem> = HashMap::new();
    for group in groups {
        for item in group {
            if item.href.is_empty() {
                continue;
            }
            let Some(link) = canonical_link(base_url, &item.href) else {
                continue;
            };
            if !is_event(&link) {
                continue;
            }
            match merged.get_mut(&link) {
                None => {
                    order.push(link.clone());
                    merged.insert(
                        link.clone(),
                        ListingItem {
                            link,
                            text: item.text,
                            context: item.context,
                            label: item.label,
                        },
                    );
                }
                Some(existing) => {
                    if richness(&item.text) > richness(&existing.text) {
                        existing.text = item.text;
                    }
                    if richness(&item.context) > richness(&existing.context) {
                        existing.context = item.context;
                    }
                    if richness(&item.label) > richness(&existing.label) {
                        existing.label = item.label;
                    }
                }
            }
        }
    }
    order.into_iter().filter_map(|link| merged.remove(&link)).collect()
}

/// Full listing pass: navigate, crawl, then merge DOM rows, mined API
/// payloads, and a raw-href sweep of the final page.
pub async fn collect_rendered_listing(
    session: &mut dyn RenderSession,
    listing_url: &str,
    policy: &CrawlPolicy,
    rules: &ApiMineRules<'_>,
) -> Result<Vec<ListingItem>, RenderError> {
    let found = session.goto(listing_url, Some(LISTING_WAIT_SELECTOR)).await?;
    if !found {
        session.wait_millis(MISSED_SELECTOR_WAIT_MS).await?;
    }
    crawl_listing(session, policy).await?;
    let dom_items = session.listing_items(EVENT_HREF_TOKENS).await?;
    let html = session.page_html().await?;
    let fallback_items = sweep_href_items(&html);
    let api_items: Vec<RenderedItem> = session
        .drain_api_payloads()
        .await?
        .iter()
        .flat_map(|payload| mine_api_items(payload, rules))
        .collect();
    Ok(merge_listing_items(
        vec![dom_items, api_items, fallback_items],
        rules.base_url,
        rules.is_event,
    ))
}

/// Navigates to a detail page and snapshots it after the UI settles.
pub async fn rendered_detail(
    session: &mut dyn RenderSession,
    link: &str,
) -> Result<RenderedDetail, RenderError> {
    session.goto(link, None).await?;
    session.wait_millis(DETAIL_SETTLE_MS).await?;
    session.detail_snapshot().await
}

/// Caption labels recovered from free text, in the
/// `Tournament | <host> | Adult` form. The generic form additionally
/// accepts captions with no leading Tournament/League word.
pub fn labels_from_text(text: &str, include_generic_form: bool) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut labels: Vec<String> = LABEL_FORM_RE
        .find_iter(text)
        .map(|m| normalize_ws(m.as_str()))
        .collect();
    if include_generic_form {
        labels.extend(GENERIC_LABEL_FORM_RE.find_iter(text).map(|m| normalize_ws(m.as_str())));
    }
    dedup_case_insensitive(labels)
}

/// Listing label, detail labels, and caption labels mined from both
/// context lines, deduped in discovery order.
pub fn assemble_labels(
    list_label: &str,
    detail_labels: &[String],
    list_context: &str,
    detail_body: &str,
    include_generic_form: bool,
) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for raw in std::iter::once(list_label).chain(detail_labels.iter().map(String::as_str)) {
        let cleaned = normalize_ws(raw);
        if !cleaned.is_empty() {
            labels.push(cleaned);
        }
    }
    labels.extend(labels_from_text(list_context, include_generic_form));
    labels.extend(labels_from_text(detail_body, include_generic_form));
    dedup_case_insensitive(labels)
}

pub fn is_tournament_label(label: &str) -> bool {
    let normalized = normalize_ws(label).to_lowercase();
    normalized.starts_with("tournament |") || normalized == "tournament"
}

pub fn is_league_label(label: &str) -> bool {
    let normalized = normalize_ws(label).to_lowercase();
    normalized.starts_with("league |") || normalized == "league"
}

pub fn is_tournament_title(value: &str) -> bool {
    normalize_ws(value).to_lowercase().starts_with("tournament:")
}

/// Host from a caption label: `Tournament | <host> | Adult`, or the
/// shorter `<host> | Adult` generic form.
pub fn host_from_label(label: &str) -> Option<String> {
    let parts: Vec<String> = label.split('|').map(|part| normalize_ws(part)).collect();
    if parts.len() >= 2 && parts[0].eq_ignore_ascii_case("tournament") {
        return (!parts[1].is_empty()).then(|| parts[1].clone());
    }
    if parts.len() >= 2 {
        let audience = parts[1].to_lowercase();
        if ["adult", "adults", "junior", "juniors"].contains(&audience.as_str()) {
            return (!parts[0].is_empty()).then(|| parts[0].clone());
        }
    }
    None
}

/// Signals feeding the tournament/league decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassificationSignals {
    pub tournament_label: bool,
    pub league_label: bool,
    pub tournament_title: bool,
    pub override_present: bool,
}

/// Layered league filter: explicit labels outrank title wording, which
/// outranks body keyword presence. Deliberately fuzzy; curated overrides
/// and tournament labels always keep a listing.
pub fn should_skip_as_league(
    signals: ClassificationSignals,
    title: &str,
    detail_body: &str,
) -> bool {
    let positive =
        signals.tournament_label || signals.tournament_title || signals.override_present;
    if signals.league_label && !positive {
        return true;
    }
    if !positive {
        if LEAGUE_WORD_RE.is_match(title) {
            return true;
        }
        let body = detail_body.to_lowercase();
        if body.contains("league |") && !body.contains("tournament |") {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    fn event_link(link: &str) -> bool {
        link.contains("/event/") || link.contains("/events/")
    }

    fn mine_rules() -> ApiMineRules<'static> {
        ApiMineRules {
            base_url: "https://site.test/events",
            synth_host: "site.test",
            min_indicators: 0,
            expected_org_username: None,
            include_city_state: false,
            is_event: event_link,
        }
    }

    #[test]
    fn mining_reads_urls_and_synthesizes_links_from_ids() {
        let payload = json!({
            "results": [
                {"url": "/event/4101", "name": "Spring Open", "startDate": "2025-04-05"},
                {"eventId": 7321, "title": "Bracket Bash", "type": "Tournament | Host | Adult"},
                {"id": "12", "name": "too-short id"},
            ]
        });
        let rows = mine_api_items(&payload, &mine_rules());
        let links: Vec<&str> = rows.iter().map(|r| r.href.as_str()).collect();
        assert_eq!(
            links,
            vec!["https://site.test/event/4101", "https://site.test/event/7321"]
        );
        assert_eq!(rows[0].context, "Spring Open | 2025-04-05");
        assert_eq!(rows[1].label, "Tournament | Host | Adult");
    }

    #[test]
    fn mining_requires_indicator_keys_when_asked() {
        let payload = json!({"items": [
            {"url": "/event/11", "name": "Bare"},
            {"url": "/event/12", "name": "Shaped", "startDate": "2025-05-01", "teamCount": 32},
        ]});
        let rules = ApiMineRules { min_indicators: 2, ..mine_rules() };
        let rows = mine_api_items(&payload, &rules);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].href, "https://site.test/event/12");
    }

    #[test]
    fn mining_rejects_foreign_organizations() {
        let payload = json!({"items": [
            {"url": "/event/21", "name": "Ours", "organization": {"username": "CVB"}},
            {"url": "/event/22", "name": "Theirs", "organization": {"username": "other"}},
            {"url": "/event/23", "name": "Unattributed"},
        ]});
        let rules = ApiMineRules { expected_org_username: Some("cvb"), ..mine_rules() };
        let links: Vec<String> =
            mine_api_items(&payload, &rules).into_iter().map(|r| r.href).collect();
        assert_eq!(
            links,
            vec!["https://site.test/event/21", "https://site.test/event/23"]
        );
    }

    #[test]
    fn city_and_state_join_the_context_line_when_enabled() {
        let payload = json!({"url": "/event/300", "name": "Open", "city": "Austin", "state": "TX"});
        let rules = ApiMineRules { include_city_state: true, ..mine_rules() };
        let rows = mine_api_items(&payload, &rules);
        assert_eq!(rows[0].context, "Open | Austin | TX");
    }

    fn item(href: &str, text: &str, context: &str, label: &str) -> RenderedItem {
        RenderedItem {
            href: href.to_string(),
            text: text.to_string(),
            context: context.to_string(),
            label: label.to_string(),
        }
    }

    #[test]
    fn merge_prefers_richer_fields_and_keeps_first_seen_order() {
        let dom = vec![
            item("/event/1", "Open", "Open", ""),
            item("/event/2", "Bash", "Bash", ""),
        ];
        let api = vec![item(
            "https://site.test/event/1",
            "Spring Open Championship",
            "Spring Open Championship | 2025-04-05",
            "Tournament | Host | Adult",
        )];
        let merged = merge_listing_items(vec![dom, api], "https://site.test/events", event_link);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].link, "https://site.test/event/1");
        assert_eq!(merged[0].text, "Spring Open Championship");
        assert_eq!(merged[0].label, "Tournament | Host | Adult");
        assert_eq!(merged[1].text, "Bash");
    }

    #[test]
    fn sweep_finds_absolute_and_relative_event_hrefs() {
        let html = r#"<a href="https://site.test/event/99">x</a> var u="/events/100?page=2";"#;
        let hrefs: Vec<String> = sweep_href_items(html).into_iter().map(|i| i.href).collect();
        assert_eq!(hrefs, vec!["https://site.test/event/99", "/events/100"]);
    }

    #[test]
    fn caption_labels_are_recovered_from_free_text() {
        let text = "Tournament | Sports Garden DFW | Adult some prose League | Club X | Juniors";
        let labels = labels_from_text(text, false);
        assert_eq!(
            labels,
            vec![
                "Tournament | Sports Garden DFW | Adult",
                "League | Club X | Juniors"
            ]
        );
    }

    #[test]
    fn generic_caption_form_needs_opting_in() {
        let text = "ATX Beach | Adult";
        assert!(labels_from_text(text, false).is_empty());
        assert_eq!(labels_from_text(text, true), vec!["ATX Beach | Adult"]);
    }

    #[test]
    fn host_comes_from_either_label_form() {
        assert_eq!(
            host_from_label("Tournament | Sports Garden DFW | Adult").as_deref(),
            Some("Sports Garden DFW")
        );
        assert_eq!(host_from_label("ATX Beach | Adults").as_deref(), Some("ATX Beach"));
        assert_eq!(host_from_label("Tournament |  | Adult"), None);
        assert_eq!(host_from_label("Something else entirely"), None);
    }

    #[test]
    fn league_label_skips_unless_a_tournament_signal_wins() {
        let league_only = ClassificationSignals { league_label: true, ..Default::default() };
        assert!(should_skip_as_league(league_only, "Sand Social", ""));

        let overridden = ClassificationSignals {
            league_label: true,
            override_present: true,
            ..Default::default()
        };
        assert!(!should_skip_as_league(overridden, "Sand Social", ""));

        let labeled = ClassificationSignals {
            league_label: true,
            tournament_label: true,
            ..Default::default()
        };
        assert!(!should_skip_as_league(labeled, "Sand Social", ""));
    }

    #[test]
    fn league_wording_in_title_or_body_skips_without_positive_signals() {
        let none = ClassificationSignals::default();
        assert!(should_skip_as_league(none, "Monday League Night", ""));
        assert!(should_skip_as_league(none, "Sand Social", "join our League | Club | Adult"));
        assert!(!should_skip_as_league(
            none,
            "Sand Social",
            "League | x | Adult and Tournament | y | Adult"
        ));
        let titled = ClassificationSignals { tournament_title: true, ..Default::default() };
        assert!(!should_skip_as_league(titled, "Monday League Night", ""));
    }

    struct FakeSession {
        counts: Vec<usize>,
        rounds_seen: usize,
        items: Vec<RenderedItem>,
        html: String,
        payloads: Vec<serde_json::Value>,
    }

    #[async_trait]
    impl RenderSession for FakeSession {
        async fn goto(&mut self, _url: &str, _wait_selector: Option<&str>) -> Result<bool, RenderError> {
            Ok(true)
        }
        async fn event_link_count(&mut self, _href_tokens: &[&str]) -> Result<usize, RenderError> {
            let count = self.counts.get(self.rounds_seen).copied().unwrap_or_else(|| {
                self.counts.last().copied().unwrap_or(0)
            });
            self.rounds_seen += 1;
            Ok(count)
        }
        async fn click_pagination(
            &mut self,
            _wants: &[&str],
            _match_next_class: bool,
        ) -> Result<bool, RenderError> {
            Ok(false)
        }
        async fn scroll(&mut self, _delta_y: i64) -> Result<(), RenderError> {
            Ok(())
        }
        async fn wait_millis(&mut self, _ms: u64) -> Result<(), RenderError> {
            Ok(())
        }
        async fn listing_items(&mut self, _href_tokens: &[&str]) -> Result<Vec<RenderedItem>, RenderError> {
            Ok(self.items.clone())
        }
        async fn page_html(&mut self) -> Result<String, RenderError> {
            Ok(self.html.clone())
        }
        async fn detail_snapshot(&mut self) -> Result<RenderedDetail, RenderError> {
            Ok(RenderedDetail::default())
        }
        async fn drain_api_payloads(&mut self) -> Result<Vec<serde_json::Value>, RenderError> {
            Ok(std::mem::take(&mut self.payloads))
        }
        async fn hrefs(&mut self) -> Result<Vec<String>, RenderError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn crawl_stops_once_the_link_count_is_stable() {
        let mut session = FakeSession {
            counts: vec![5, 12, 12],
            rounds_seen: 0,
            items: Vec::new(),
            html: String::new(),
            payloads: Vec::new(),
        };
        let policy = CrawlPolicy { max_rounds: 50, wants: PAGINATION_WANTS, match_next_class: false };
        crawl_listing(&mut session, &policy).await.unwrap();
        // Two growth rounds plus eight stable rounds, well under the cap.
        assert_eq!(session.rounds_seen, 10);
    }

    #[tokio::test]
    async fn listing_collection_merges_dom_api_and_sweep_groups() {
        let mut session = FakeSession {
            counts: vec![2],
            rounds_seen: 0,
            items: vec![item("/event/1", "Open", "Open", "")],
            html: r#"href="/event/2""#.to_string(),
            payloads: vec![json!({"url": "/event/1", "name": "Grand Open", "startDate": "2025-05-01"})],
        };
        let policy = CrawlPolicy { max_rounds: 12, wants: PAGINATION_WANTS, match_next_class: false };
        let rules = mine_rules();
        let items = collect_rendered_listing(&mut session, "https://site.test/events", &policy, &rules)
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].link, "https://site.test/event/1");
        assert_eq!(items[0].text, "Grand Open");
        assert_eq!(items[1].link, "https://site.test/event/2");
        assert!(items[1].text.is_empty());
    }
}
