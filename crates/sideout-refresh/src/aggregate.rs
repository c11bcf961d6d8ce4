//! Merges every enabled source into one tournament list.
//!
//! Sources run sequentially in registry order, either in-process or in a
//! per-source subprocess when isolation is configured. A source failure
//! never aborts the run; it becomes a diagnostic string alongside the
//! results the other sources produced. After collection the list is
//! filtered (placeholder or dateless records drop out), deduplicated on
//! the composite identity key with the last occurrence winning, and
//! ordered by date then case-folded title.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use sideout_core::Tournament;
use sideout_scrapers::{extractor_for_key, ExtractContext};
use sideout_storage::render::{CommandRenderer, PageRenderer};
use sideout_storage::{HttpFetcher, HttpFetcherConfig};

use crate::{RefreshConfig, SourceConfig, SourceRegistry};

/// Placeholder titles some venues publish for unnamed events. Records
/// carrying one of these are dropped with a diagnostic, matched
/// case-insensitively after trimming.
const GENERIC_TITLES: &[&str] = &[
    "512 beach tournament",
    "atx beach tournament",
    "210 beach sideliners tournament",
    "sports garden dfw tournament",
];

/// Wire shape a source subprocess writes to stdout: one compact JSON
/// object holding the scraped tournaments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerPayload {
    pub tournaments: Vec<Tournament>,
}

/// Runs the enabled sources and folds their output into the merged,
/// display-ordered tournament list plus per-source diagnostics.
#[derive(Clone)]
pub struct Aggregator {
    config: RefreshConfig,
    registry: SourceRegistry,
    http: Arc<HttpFetcher>,
    renderer: Arc<dyn PageRenderer>,
}

/// Builds the HTTP and rendering services one extraction run shares.
/// The CLI `source` subcommand uses this too, so an isolated subprocess
/// scrapes with exactly the services an in-process run would get.
pub fn build_context(config: &RefreshConfig) -> Result<ExtractContext> {
    Ok(ExtractContext {
        run_id: Uuid::new_v4(),
        today: Local::now().date_naive(),
        http: build_http(config)?,
        renderer: build_renderer(config),
        host_overrides_path: Some(config.host_overrides_path.clone()),
    })
}

fn build_http(config: &RefreshConfig) -> Result<Arc<HttpFetcher>> {
    Ok(Arc::new(HttpFetcher::new(HttpFetcherConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: config.user_agent.clone(),
        ..HttpFetcherConfig::default()
    })?))
}

fn build_renderer(config: &RefreshConfig) -> Arc<dyn PageRenderer> {
    Arc::new(CommandRenderer::from_command(
        config.render_helper.clone(),
        Duration::from_secs(config.render_timeout_secs),
    ))
}

impl Aggregator {
    pub fn new(config: RefreshConfig, registry: SourceRegistry) -> Result<Self> {
        let http = build_http(&config)?;
        let renderer = build_renderer(&config);
        Ok(Self {
            config,
            registry,
            http,
            renderer,
        })
    }

    /// One full collection pass. Infallible by construction: every
    /// per-source failure is folded into the returned diagnostics.
    pub async fn collect(&self) -> (Vec<Tournament>, Vec<String>) {
        let run_id = Uuid::new_v4();
        let ctx = ExtractContext {
            run_id,
            today: Local::now().date_naive(),
            http: self.http.clone(),
            renderer: self.renderer.clone(),
            host_overrides_path: Some(self.config.host_overrides_path.clone()),
        };

        let mut raw: Vec<Tournament> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        for source in self.registry.enabled() {
            let span = info_span!("source", key = %source.source_key, %run_id);
            match self.scrape_source(&ctx, source).instrument(span).await {
                Ok(results) => {
                    if results.is_empty() {
                        errors.push(format!(
                            "{}: parsed 0 tournaments (source markup may have changed).",
                            source.display_name
                        ));
                    }
                    raw.extend(results);
                }
                Err(err) => errors.push(format!("{}: {err:#}", source.display_name)),
            }
        }

        let tournaments = postprocess(raw, &mut errors);
        info!(
            run_id = %run_id,
            tournaments = tournaments.len(),
            errors = errors.len(),
            "collection pass finished"
        );
        (tournaments, errors)
    }

    async fn scrape_source(
        &self,
        ctx: &ExtractContext,
        source: &SourceConfig,
    ) -> Result<Vec<Tournament>> {
        let extractor = extractor_for_key(&source.source_key)
            .with_context(|| format!("unknown source key \"{}\"", source.source_key))?;
        if self.config.isolate_sources {
            self.scrape_in_subprocess(&source.source_key).await
        } else {
            Ok(extractor.scrape(ctx).await?)
        }
    }

    /// Runs one source in a child process so a crash or leak in its
    /// parser cannot take down the whole refresh. The child is the CLI
    /// `source` subcommand; its stdout carries a [`RunnerPayload`].
    async fn scrape_in_subprocess(&self, key: &str) -> Result<Vec<Tournament>> {
        let runner = match &self.config.source_runner {
            Some(path) => path.clone(),
            None => std::env::current_exe().context("resolving current executable")?,
        };

        let child = Command::new(&runner)
            .arg("source")
            .arg(key)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {} source {key}", runner.display()))?;

        let timeout = Duration::from_secs(self.config.source_timeout_secs);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(done) => done.context("waiting for source process")?,
            Err(_) => bail!(
                "source process timed out after {}s",
                self.config.source_timeout_secs
            ),
        };

        if !output.status.success() {
            let detail = String::from_utf8_lossy(&output.stderr);
            let detail = last_line(&detail);
            if detail.is_empty() {
                bail!("source process exited with {}", output.status);
            }
            bail!("source process exited with {}: {detail}", output.status);
        }

        decode_runner_output(&String::from_utf8_lossy(&output.stdout))
    }
}

fn decode_runner_output(stdout: &str) -> Result<Vec<Tournament>> {
    let payload: RunnerPayload =
        serde_json::from_str(stdout.trim()).context("decoding source process output")?;
    Ok(payload.tournaments)
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
}

/// Filters, dedups, and orders the raw records. Placeholder and
/// empty-title records drop with a diagnostic; dateless records drop
/// silently because the display layer cannot place them. Duplicates on
/// (source, title, date), compared case-insensitively, keep the record
/// seen last.
fn postprocess(raw: Vec<Tournament>, errors: &mut Vec<String>) -> Vec<Tournament> {
    let mut merged: Vec<Tournament> = Vec::new();
    let mut slots: HashMap<(String, String, String), usize> = HashMap::new();

    for mut t in raw {
        let trimmed = t.title.trim().to_string();
        let lowered = trimmed.to_lowercase();
        if trimmed.is_empty() || GENERIC_TITLES.contains(&lowered.as_str()) {
            errors.push(format!("{}: missing tournament name for {}", t.source, t.link));
            continue;
        }
        if t.date.is_none() {
            continue;
        }
        t.title = trimmed;
        match slots.entry(t.dedup_key()) {
            Entry::Occupied(slot) => merged[*slot.get()] = t,
            Entry::Vacant(slot) => {
                slot.insert(merged.len());
                merged.push(t);
            }
        }
    }

    // Stable sort, so same-day same-title entries from different sources
    // keep their first-seen order.
    merged.sort_by_key(|t| (t.date, t.title.to_lowercase()));
    merged
}
