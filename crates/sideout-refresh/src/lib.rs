//! Refresh orchestration: environment configuration, the source registry,
//! and the optional cron scheduler that drives periodic refreshes.
//!
//! The pieces layer as registry -> [`aggregate::Aggregator`] ->
//! [`coordinator::RefreshCoordinator`]: the registry says which sources
//! run and in what order, the aggregator merges their output into one
//! list, and the coordinator wraps a locked aggregation run in the
//! snapshot write protocol.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use sideout_scrapers::{atxbeach, beach210, beach512, sportsgarden, thirdcoast, volleyballlife};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub mod aggregate;
pub mod coordinator;

pub use aggregate::{Aggregator, RunnerPayload};
pub use coordinator::{PushError, RefreshCoordinator, RefreshStatus, StatusReport};

/// Runtime settings for the refresh pipeline, read once at startup.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub cache_path: PathBuf,
    pub lock_path: PathBuf,
    /// Lock files older than this are treated as abandoned.
    pub lock_stale_secs: u64,
    pub error_log_path: PathBuf,
    /// Hand refresh requests to a background task instead of blocking.
    pub async_refresh: bool,
    /// Whether refresh requests outside the CLI `refresh` command are honored.
    pub runtime_refresh: bool,
    /// Run each source in its own subprocess instead of in-process.
    pub isolate_sources: bool,
    pub source_timeout_secs: u64,
    /// Executable spawned per source in isolation mode; `None` means the
    /// current executable.
    pub source_runner: Option<PathBuf>,
    /// Rendering helper command line, already split into argv parts.
    pub render_helper: Option<Vec<String>>,
    pub render_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub host_overrides_path: PathBuf,
    /// Cron expression for scheduled refreshes; `None` disables the scheduler.
    pub refresh_cron: Option<String>,
    pub workspace_root: PathBuf,
}

impl RefreshConfig {
    pub fn from_env() -> Self {
        Self {
            cache_path: std::env::var("SIDEOUT_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/tournaments.json")),
            lock_path: std::env::var("SIDEOUT_LOCK_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/refresh.lock")),
            lock_stale_secs: std::env::var("SIDEOUT_LOCK_STALE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1800),
            error_log_path: std::env::var("SIDEOUT_ERROR_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/refresh_error.log")),
            async_refresh: std::env::var("SIDEOUT_ASYNC_REFRESH")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            runtime_refresh: std::env::var("SIDEOUT_RUNTIME_REFRESH")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            isolate_sources: std::env::var("SIDEOUT_ISOLATE_SOURCES")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            source_timeout_secs: std::env::var("SIDEOUT_SOURCE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(360),
            source_runner: std::env::var("SIDEOUT_SOURCE_RUNNER")
                .ok()
                .map(PathBuf::from),
            render_helper: std::env::var("SIDEOUT_RENDER_HELPER")
                .ok()
                .map(|v| v.split_whitespace().map(str::to_string).collect::<Vec<_>>())
                .filter(|parts| !parts.is_empty()),
            render_timeout_secs: std::env::var("SIDEOUT_RENDER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            http_timeout_secs: std::env::var("SIDEOUT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: std::env::var("SIDEOUT_USER_AGENT")
                .unwrap_or_else(|_| sideout_storage::DEFAULT_USER_AGENT.to_string()),
            host_overrides_path: std::env::var("SIDEOUT_HOST_OVERRIDES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/volleyballlife_host_overrides.json")),
            refresh_cron: std::env::var("SIDEOUT_REFRESH_CRON")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            workspace_root: PathBuf::from("."),
        }
    }
}

/// The ordered list of sources a refresh runs, as declared in
/// `sources.yaml`. Order here is aggregation order.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_key: String,
    pub display_name: String,
    pub enabled: bool,
}

impl SourceRegistry {
    /// Registry used when no `sources.yaml` exists: the five Texas sources
    /// enabled, VolleyballLife off because it rediscovers events the
    /// dedicated sources already cover.
    pub fn builtin() -> Self {
        let entry = |key: &str, name: &str, enabled: bool| SourceConfig {
            source_key: key.to_string(),
            display_name: name.to_string(),
            enabled,
        };
        Self {
            sources: vec![
                entry(beach512::KEY, beach512::SOURCE_NAME, true),
                entry(atxbeach::KEY, atxbeach::SOURCE_NAME, true),
                entry(beach210::KEY, beach210::SOURCE_NAME, true),
                entry(sportsgarden::KEY, sportsgarden::SOURCE_NAME, true),
                entry(thirdcoast::KEY, thirdcoast::SOURCE_NAME, true),
                entry(volleyballlife::KEY, volleyballlife::SOURCE_NAME, false),
            ],
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Reads `sources.yaml` from the workspace root, falling back to the
    /// built-in registry when the file is absent.
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::builtin()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Builds a scheduler that runs a locked refresh on the configured cron.
/// Returns `None` when no cron expression is configured.
pub async fn maybe_build_scheduler(
    coordinator: Arc<RefreshCoordinator>,
) -> Result<Option<JobScheduler>> {
    let Some(cron) = coordinator.config().refresh_cron.clone() else {
        return Ok(None);
    };

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let worker = coordinator.clone();
        Box::pin(async move {
            match worker.refresh_sync().await {
                Ok(RefreshStatus::InProgress) => {
                    info!("scheduled refresh skipped; another attempt holds the lock");
                }
                Ok(_) => info!("scheduled refresh complete"),
                Err(err) => error!(error = ?err, "scheduled refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_keeps_aggregation_order() {
        let registry = SourceRegistry::builtin();
        let keys: Vec<&str> = registry
            .sources
            .iter()
            .map(|s| s.source_key.as_str())
            .collect();
        assert_eq!(
            keys,
            [
                "beach512",
                "atxbeach",
                "beach210",
                "sportsgarden",
                "thirdcoast",
                "volleyballlife"
            ]
        );
    }

    #[test]
    fn builtin_registry_ships_volleyballlife_disabled() {
        let registry = SourceRegistry::builtin();
        let enabled: Vec<&str> = registry.enabled().map(|s| s.source_key.as_str()).collect();
        assert_eq!(enabled.len(), 5);
        assert!(!enabled.contains(&"volleyballlife"));
    }

    #[tokio::test]
    async fn load_falls_back_to_builtin_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::load(dir.path()).await.unwrap();
        assert_eq!(registry.sources.len(), 6);
    }

    #[tokio::test]
    async fn load_reads_sources_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "\
sources:
  - source_key: beach512
    display_name: 512 Beach
    enabled: true
  - source_key: volleyballlife
    display_name: VolleyballLife
    enabled: false
";
        std::fs::write(dir.path().join("sources.yaml"), yaml).unwrap();

        let registry = SourceRegistry::load(dir.path()).await.unwrap();
        assert_eq!(registry.sources.len(), 2);
        let enabled: Vec<&str> = registry.enabled().map(|s| s.source_key.as_str()).collect();
        assert_eq!(enabled, ["beach512"]);
    }

    #[tokio::test]
    async fn load_reports_malformed_yaml_with_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sources.yaml"), "sources: [not a mapping").unwrap();

        let err = SourceRegistry::load(dir.path()).await.unwrap_err();
        assert!(format!("{err:#}").contains("sources.yaml"));
    }

    fn scheduler_coordinator(dir: &Path, cron: Option<&str>) -> Arc<RefreshCoordinator> {
        let mut config = RefreshConfig::from_env();
        config.cache_path = dir.join("tournaments.json");
        config.lock_path = dir.join("refresh.lock");
        config.error_log_path = dir.join("refresh_error.log");
        config.refresh_cron = cron.map(str::to_string);
        let registry = SourceRegistry {
            sources: Vec::new(),
        };
        Arc::new(RefreshCoordinator::new(config, registry).unwrap())
    }

    #[tokio::test]
    async fn scheduler_is_disabled_without_a_cron_expression() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = scheduler_coordinator(dir.path(), None);
        assert!(maybe_build_scheduler(coordinator).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scheduler_builds_for_a_valid_cron_expression() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = scheduler_coordinator(dir.path(), Some("0 30 5 * * *"));
        assert!(maybe_build_scheduler(coordinator).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn scheduler_rejects_a_malformed_cron_expression() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = scheduler_coordinator(dir.path(), Some("five-ish"));
        let err = maybe_build_scheduler(coordinator).await.err().unwrap();
        assert!(format!("{err:#}").contains("five-ish"));
    }
}
