//! Scripted renderer fakes shared by the rendered-source tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use uuid::Uuid;

use sideout_storage::render::{
    PageRenderer, RenderError, RenderSession, RenderSessionOptions, RenderedDetail, RenderedItem,
};
use sideout_storage::{HttpFetcher, HttpFetcherConfig};

use crate::ExtractContext;

/// Session replaying fixed listing rows; detail snapshots are keyed on
/// the last navigated URL.
pub(crate) struct ScriptedSession {
    items: Vec<RenderedItem>,
    details: HashMap<String, RenderedDetail>,
    payloads: Vec<Value>,
    current: String,
}

#[async_trait]
impl RenderSession for ScriptedSession {
    async fn goto(&mut self, url: &str, _wait_selector: Option<&str>) -> Result<bool, RenderError> {
        self.current = url.to_string();
        Ok(true)
    }

    async fn event_link_count(&mut self, _href_tokens: &[&str]) -> Result<usize, RenderError> {
        Ok(self.items.len())
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
        Ok(String::new())
    }

    async fn detail_snapshot(&mut self) -> Result<RenderedDetail, RenderError> {
        Ok(self.details.get(&self.current).cloned().unwrap_or_default())
    }

    async fn drain_api_payloads(&mut self) -> Result<Vec<Value>, RenderError> {
        Ok(std::mem::take(&mut self.payloads))
    }

    async fn hrefs(&mut self) -> Result<Vec<String>, RenderError> {
        Ok(Vec::new())
    }
}

/// Renderer handing out [`ScriptedSession`]s over the same fixtures.
#[derive(Default)]
pub(crate) struct ScriptedRenderer {
    pub(crate) items: Vec<RenderedItem>,
    pub(crate) details: HashMap<String, RenderedDetail>,
    pub(crate) payloads: Vec<Value>,
}

#[async_trait]
impl PageRenderer for ScriptedRenderer {
    async fn open(
        &self,
        _options: RenderSessionOptions,
    ) -> Result<Box<dyn RenderSession>, RenderError> {
        Ok(Box::new(ScriptedSession {
            items: self.items.clone(),
            details: self.details.clone(),
            payloads: self.payloads.clone(),
            current: String::new(),
        }))
    }
}

/// Renderer that reports the helper as missing.
pub(crate) struct UnavailableRenderer;

#[async_trait]
impl PageRenderer for UnavailableRenderer {
    async fn open(
        &self,
        _options: RenderSessionOptions,
    ) -> Result<Box<dyn RenderSession>, RenderError> {
        Err(RenderError::Unavailable("no helper command configured".into()))
    }
}

/// Context pinned to a fixed calendar day so year inference is stable.
pub(crate) fn context(
    renderer: Arc<dyn PageRenderer>,
    host_overrides_path: Option<PathBuf>,
) -> ExtractContext {
    ExtractContext {
        run_id: Uuid::new_v4(),
        today: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        http: Arc::new(HttpFetcher::new(HttpFetcherConfig::default()).unwrap()),
        renderer,
        host_overrides_path,
    }
}

pub(crate) fn listing_item(href: &str, text: &str, context: &str, label: &str) -> RenderedItem {
    RenderedItem {
        href: href.to_string(),
        text: text.to_string(),
        context: context.to_string(),
        label: label.to_string(),
    }
}
