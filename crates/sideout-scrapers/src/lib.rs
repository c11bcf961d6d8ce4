//! Per-source tournament extractors.
//!
//! Every source implements [`SourceExtractor`] and is reached through the
//! key registry, so the aggregator, the subprocess runner, and the CLI all
//! share one lookup path. Extractors treat markup drift as a soft
//! condition (fewer or zero tournaments); they return an error only when
//! the source cannot be scraped at all, such as a dead listing endpoint or
//! a missing rendering helper.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use sideout_core::textdate::normalize_ws;
use sideout_core::Tournament;
use sideout_storage::render::PageRenderer;
use sideout_storage::HttpFetcher;

pub mod atxbeach;
pub mod beach210;
pub mod beach512;
pub mod jsonmine;
pub mod sportsgarden;
#[cfg(test)]
mod testutil;
pub mod thirdcoast;
pub mod titles;
pub mod vlife;
pub mod volleyballlife;

/// Registry keys in canonical aggregation order. `volleyballlife` ships
/// disabled by default; it rediscovers events the dedicated sources
/// already cover.
pub const SOURCE_KEYS: &[&str] = &[
    beach512::KEY,
    atxbeach::KEY,
    beach210::KEY,
    sportsgarden::KEY,
    thirdcoast::KEY,
    volleyballlife::KEY,
];

/// Services and run facts shared by every extractor.
pub struct ExtractContext {
    pub run_id: Uuid,
    /// Calendar day all year inference is relative to.
    pub today: NaiveDate,
    pub http: Arc<HttpFetcher>,
    pub renderer: Arc<dyn PageRenderer>,
    /// Curated link-to-host override table for VolleyballLife attribution.
    pub host_overrides_path: Option<PathBuf>,
}

/// Hard failures from an extractor.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{0}")]
    CapabilityUnavailable(String),
    #[error(transparent)]
    Fetch(#[from] sideout_storage::FetchError),
    #[error(transparent)]
    Render(#[from] sideout_storage::render::RenderError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceExtractor: Send + Sync {
    /// Stable registry and subprocess key, e.g. `"beach512"`.
    fn source_key(&self) -> &'static str;

    /// Display name used in snapshots and diagnostics.
    fn source_name(&self) -> &'static str;

    async fn scrape(&self, ctx: &ExtractContext) -> Result<Vec<Tournament>, ExtractError>;
}

/// Looks up an extractor by registry key.
pub fn extractor_for_key(key: &str) -> Option<Box<dyn SourceExtractor>> {
    match key {
        beach512::KEY => Some(Box::new(beach512::Beach512)),
        atxbeach::KEY => Some(Box::new(atxbeach::AtxBeach)),
        beach210::KEY => Some(Box::new(beach210::Beach210)),
        sportsgarden::KEY => Some(Box::new(sportsgarden::SportsGarden)),
        thirdcoast::KEY => Some(Box::new(thirdcoast::ThirdCoast)),
        volleyballlife::KEY => Some(Box::new(volleyballlife::VolleyballLife)),
        _ => None,
    }
}

/// Joins an href against a base URL without canonicalizing it.
pub fn join_link(base: &str, href: &str) -> Option<String> {
    match Url::parse(base) {
        Ok(base_url) => base_url.join(href.trim()).ok().map(|u| u.to_string()),
        Err(_) => Url::parse(href.trim()).ok().map(|u| u.to_string()),
    }
}

/// Joins and canonicalizes an href: query and fragment dropped, trailing
/// slashes trimmed from the path. Dedup and override lookups key on this
/// form.
pub fn canonical_link(base: &str, href: &str) -> Option<String> {
    let mut url = match Url::parse(base) {
        Ok(base_url) => base_url.join(href.trim()).ok()?,
        Err(_) => Url::parse(href.trim()).ok()?,
    };
    url.set_query(None);
    url.set_fragment(None);
    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&path);
    Some(url.to_string())
}

/// Path component of an absolute link, trailing slashes trimmed.
pub fn link_path(link: &str) -> Option<String> {
    Url::parse(link)
        .ok()
        .map(|u| u.path().trim_end_matches('/').to_string())
}

/// Lowercased host of an absolute link.
pub fn link_host(link: &str) -> Option<String> {
    Url::parse(link).ok()?.host_str().map(str::to_lowercase)
}

/// Canonical links for every pattern match in raw HTML. Sources use this
/// to sweep scripts and templates that anchor parsing misses.
pub fn sweep_links(html: &str, pattern: &Regex, base: &str) -> Vec<String> {
    pattern
        .find_iter(html)
        .filter_map(|m| canonical_link(base, m.as_str()))
        .collect()
}

/// Normalized text of one element, descendants included.
pub fn element_text(el: ElementRef<'_>) -> String {
    normalize_ws(&el.text().collect::<Vec<_>>().join(" "))
}

/// Normalized text of the whole document.
pub fn document_text(doc: &Html) -> String {
    element_text(doc.root_element())
}

/// Text of the first selector match with non-empty normalized text.
pub fn select_first_text(doc: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    doc.select(&selector).find_map(|el| {
        let text = element_text(el);
        (!text.is_empty()).then_some(text)
    })
}

/// First non-empty value of `attr` across selector matches.
pub fn select_first_attr(doc: &Html, selector: &str, attr: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    doc.select(&selector).find_map(|el| {
        el.value()
            .attr(attr)
            .map(normalize_ws)
            .filter(|value| !value.is_empty())
    })
}

/// Case-insensitive order-preserving dedup.
pub fn dedup_case_insensitive(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.to_lowercase()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_links_drop_query_fragment_and_trailing_slash() {
        assert_eq!(
            canonical_link("https://512beach.com/events", "/events/41/?utm=x#top").as_deref(),
            Some("https://512beach.com/events/41")
        );
        assert_eq!(
            canonical_link("https://512beach.com/events", "https://other.test/events/7").as_deref(),
            Some("https://other.test/events/7")
        );
        assert_eq!(canonical_link("", "/events/41"), None);
    }

    #[test]
    fn join_link_keeps_queries() {
        assert_eq!(
            join_link("https://site.test/schedule/", "detail?id=9").as_deref(),
            Some("https://site.test/schedule/detail?id=9")
        );
    }

    #[test]
    fn link_parts_come_from_the_parsed_url() {
        assert_eq!(
            link_path("https://512beach.com/events/41/").as_deref(),
            Some("/events/41")
        );
        assert_eq!(link_host("https://CVB.VolleyballLife.com/event/2").as_deref(), Some("cvb.volleyballlife.com"));
        assert_eq!(link_path("no scheme"), None);
    }

    #[test]
    fn selector_helpers_normalize_whitespace() {
        let doc = Html::parse_document(
            r#"<html><head><meta property="og:title" content="  Summer   Open "></head>
            <body><h1>  Sand  <b>Series</b>  </h1><h1>Second</h1></body></html>"#,
        );
        assert_eq!(
            select_first_attr(&doc, r#"meta[property="og:title"]"#, "content").as_deref(),
            Some("Summer Open")
        );
        assert_eq!(select_first_text(&doc, "h1").as_deref(), Some("Sand Series"));
        assert_eq!(select_first_text(&doc, "h4"), None);
    }

    #[test]
    fn dedup_is_case_insensitive_and_keeps_order() {
        let values = vec!["Open".to_string(), "OPEN".to_string(), "Bash".to_string()];
        assert_eq!(dedup_case_insensitive(values), vec!["Open", "Bash"]);
    }
}
