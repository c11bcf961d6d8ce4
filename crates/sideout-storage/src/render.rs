//! Seam to an external page-rendering helper.
//!
//! Nothing in this workspace runs a browser. Sources that only work with a
//! rendered DOM talk to a helper program through [`PageRenderer`] /
//! [`RenderSession`]; the command-backed client spawns the configured
//! helper once per session and exchanges one JSON object per line on its
//! stdin/stdout. All crawling policy (pagination rounds, merging,
//! classification) stays with the caller; the helper only executes
//! primitives. An unconfigured or unspawnable helper is reported as
//! [`RenderError::Unavailable`], which renderer-dependent sources surface
//! as their one hard failure.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

/// Failure modes of the rendering capability.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The capability is absent entirely (no helper configured, or the
    /// helper binary cannot start).
    #[error("rendering helper unavailable: {0}")]
    Unavailable(String),
    /// The helper ran but reported a failure for one operation.
    #[error("rendering helper failed: {0}")]
    Helper(String),
    #[error("rendering helper i/o: {0}")]
    Io(#[from] std::io::Error),
    /// The helper replied with something outside the line-JSON contract.
    #[error("rendering helper protocol: {0}")]
    Protocol(String),
    #[error("rendering helper timed out after {0:?}")]
    Timeout(Duration),
}

/// One listing row as seen in the rendered DOM: the anchor href, the
/// anchor text, the surrounding card text, and any caption label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderedItem {
    pub href: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub label: String,
}

/// Everything a rendered detail page offers before field extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderedDetail {
    #[serde(default)]
    pub title_candidates: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub json_ld: Vec<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Session-wide knobs handed to the helper on startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderSessionOptions {
    /// Substrings of request URLs whose xhr/fetch responses the helper
    /// should capture for [`RenderSession::drain_api_payloads`].
    pub api_url_tokens: Vec<String>,
    /// Ask the helper to skip image/media/font requests.
    pub block_media: bool,
    pub default_timeout_ms: u64,
}

/// Primitives over one live page. Callers own every decision; each method
/// is a single round trip to the helper.
#[async_trait]
pub trait RenderSession: Send {
    /// Navigates and optionally waits for a selector. Waiting is best
    /// effort; the return value says whether the selector appeared.
    async fn goto(&mut self, url: &str, wait_selector: Option<&str>) -> Result<bool, RenderError>;

    /// Count of anchors whose href contains any of the tokens.
    async fn event_link_count(&mut self, href_tokens: &[&str]) -> Result<usize, RenderError>;

    /// Clicks the first visible, enabled pagination control whose text or
    /// aria-label contains one of `wants` (or, when `match_next_class` is
    /// set, whose class list contains `next`). Returns whether anything
    /// was clicked.
    async fn click_pagination(
        &mut self,
        wants: &[&str],
        match_next_class: bool,
    ) -> Result<bool, RenderError>;

    async fn scroll(&mut self, delta_y: i64) -> Result<(), RenderError>;

    async fn wait_millis(&mut self, ms: u64) -> Result<(), RenderError>;

    /// Listing rows for anchors whose href contains any of the tokens.
    async fn listing_items(&mut self, href_tokens: &[&str])
        -> Result<Vec<RenderedItem>, RenderError>;

    async fn page_html(&mut self) -> Result<String, RenderError>;

    async fn detail_snapshot(&mut self) -> Result<RenderedDetail, RenderError>;

    /// Captured API response bodies since the last drain.
    async fn drain_api_payloads(&mut self) -> Result<Vec<Value>, RenderError>;

    /// Every anchor href on the page.
    async fn hrefs(&mut self) -> Result<Vec<String>, RenderError>;
}

/// Opens rendering sessions. Implemented by [`CommandRenderer`] and by
/// scripted fakes in tests.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn open(
        &self,
        options: RenderSessionOptions,
    ) -> Result<Box<dyn RenderSession>, RenderError>;
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum HelperRequest<'a> {
    Open {
        options: &'a RenderSessionOptions,
    },
    Goto {
        url: &'a str,
        wait_selector: Option<&'a str>,
    },
    EventLinkCount {
        href_tokens: &'a [&'a str],
    },
    ClickPagination {
        wants: &'a [&'a str],
        match_next_class: bool,
    },
    Scroll {
        delta_y: i64,
    },
    Wait {
        ms: u64,
    },
    ListingItems {
        href_tokens: &'a [&'a str],
    },
    PageHtml,
    Detail,
    DrainApi,
    Hrefs,
}

#[derive(Debug, Deserialize)]
struct HelperReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    value: Value,
}

/// Client for a helper program speaking the line-JSON protocol.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandRenderer {
    /// `command` is the helper argv. `None` or empty means the capability
    /// is absent; `open` then reports it unavailable.
    pub fn from_command(command: Option<Vec<String>>, timeout: Duration) -> Self {
        Self {
            command: command.unwrap_or_default(),
            timeout,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.command.is_empty()
    }
}

#[async_trait]
impl PageRenderer for CommandRenderer {
    async fn open(
        &self,
        options: RenderSessionOptions,
    ) -> Result<Box<dyn RenderSession>, RenderError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(RenderError::Unavailable(
                "no helper command configured (set SIDEOUT_RENDER_HELPER)".into(),
            ));
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| RenderError::Unavailable(format!("spawning {program}: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RenderError::Protocol("helper stdin missing".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RenderError::Protocol("helper stdout missing".into()))?;
        let mut session = HelperSession {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout),
            timeout: self.timeout,
        };
        session.call(&HelperRequest::Open { options: &options }).await?;
        Ok(Box::new(session))
    }
}

struct HelperSession {
    // Held so kill_on_drop reaps the helper with the session.
    _child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    timeout: Duration,
}

impl HelperSession {
    async fn call(&mut self, request: &HelperRequest<'_>) -> Result<Value, RenderError> {
        let mut line = serde_json::to_string(request)
            .map_err(|err| RenderError::Protocol(err.to_string()))?;
        debug!(request = %line, "render helper call");
        line.push('\n');
        let exchange = async {
            self.stdin.write_all(line.as_bytes()).await?;
            self.stdin.flush().await?;
            let mut reply = String::new();
            let read = self.stdout.read_line(&mut reply).await?;
            Ok::<_, std::io::Error>((read, reply))
        };
        let (read, reply) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| RenderError::Timeout(self.timeout))??;
        if read == 0 {
            return Err(RenderError::Helper("helper closed its output".into()));
        }
        let reply: HelperReply = serde_json::from_str(reply.trim())
            .map_err(|err| RenderError::Protocol(format!("bad reply: {err}")))?;
        if !reply.ok {
            return Err(RenderError::Helper(
                reply.error.unwrap_or_else(|| "unspecified helper failure".into()),
            ));
        }
        Ok(reply.value)
    }

    fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, RenderError> {
        serde_json::from_value(value)
            .map_err(|err| RenderError::Protocol(format!("bad reply value: {err}")))
    }
}

#[async_trait]
impl RenderSession for HelperSession {
    async fn goto(&mut self, url: &str, wait_selector: Option<&str>) -> Result<bool, RenderError> {
        let value = self.call(&HelperRequest::Goto { url, wait_selector }).await?;
        // Older helpers reply null; treat that as "selector not confirmed".
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn event_link_count(&mut self, href_tokens: &[&str]) -> Result<usize, RenderError> {
        let value = self.call(&HelperRequest::EventLinkCount { href_tokens }).await?;
        Self::decode(value)
    }

    async fn click_pagination(
        &mut self,
        wants: &[&str],
        match_next_class: bool,
    ) -> Result<bool, RenderError> {
        let value = self
            .call(&HelperRequest::ClickPagination {
                wants,
                match_next_class,
            })
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn scroll(&mut self, delta_y: i64) -> Result<(), RenderError> {
        self.call(&HelperRequest::Scroll { delta_y }).await.map(|_| ())
    }

    async fn wait_millis(&mut self, ms: u64) -> Result<(), RenderError> {
        self.call(&HelperRequest::Wait { ms }).await.map(|_| ())
    }

    async fn listing_items(
        &mut self,
        href_tokens: &[&str],
    ) -> Result<Vec<RenderedItem>, RenderError> {
        let value = self.call(&HelperRequest::ListingItems { href_tokens }).await?;
        Self::decode(value)
    }

    async fn page_html(&mut self) -> Result<String, RenderError> {
        let value = self.call(&HelperRequest::PageHtml).await?;
        Self::decode(value)
    }

    async fn detail_snapshot(&mut self) -> Result<RenderedDetail, RenderError> {
        let value = self.call(&HelperRequest::Detail).await?;
        Self::decode(value)
    }

    async fn drain_api_payloads(&mut self) -> Result<Vec<Value>, RenderError> {
        let value = self.call(&HelperRequest::DrainApi).await?;
        Self::decode(value)
    }

    async fn hrefs(&mut self) -> Result<Vec<String>, RenderError> {
        let value = self.call(&HelperRequest::Hrefs).await?;
        Self::decode(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_renderer_reports_unavailable() {
        let renderer = CommandRenderer::from_command(None, Duration::from_secs(5));
        assert!(!renderer.is_configured());
        let err = renderer
            .open(RenderSessionOptions::default())
            .await
            .err()
            .expect("open must fail");
        assert!(matches!(err, RenderError::Unavailable(_)));
    }

    #[test]
    fn requests_serialize_with_an_op_tag() {
        let request = HelperRequest::Goto {
            url: "https://cvb.volleyballlife.com/events",
            wait_selector: Some("a[href*='/event']"),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["op"], "goto");
        assert_eq!(json["url"], "https://cvb.volleyballlife.com/events");

        let json = serde_json::to_value(HelperRequest::PageHtml).unwrap();
        assert_eq!(json["op"], "page_html");
    }

    #[test]
    fn replies_tolerate_missing_fields() {
        let reply: HelperReply = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert!(reply.ok);
        assert!(reply.error.is_none());
        assert!(reply.value.is_null());
    }
}
