//! The locked refresh protocol around the snapshot cache.
//!
//! Exactly one refresh attempt may own the cache at a time; ownership is
//! the lock file, nothing else. An attempt acquires the lock, collects,
//! writes the snapshot, and releases the lock as its final action whether
//! it succeeded or failed. Failures leave their error chain in a log file
//! next to the cache so a missing snapshot can be explained after the
//! fact. Observers judge progress only from the lock file, never from a
//! task handle, so in-process tasks, cron jobs, and external runs all
//! look the same.

use std::time::Duration;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, warn};

use sideout_core::{Snapshot, Tournament};
use sideout_storage::{RefreshLock, SnapshotStore};

use crate::aggregate::Aggregator;
use crate::{RefreshConfig, SourceRegistry};

/// What a refresh request resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStatus {
    /// The attempt ran in this call and wrote a fresh snapshot.
    Completed,
    /// The attempt was handed to a detached background task.
    Started,
    /// Another attempt already holds the lock.
    InProgress,
    /// Runtime refresh requests are switched off by configuration.
    Disabled,
}

/// Point-in-time view of the cache and the lock.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub refreshing: bool,
    pub updated_at: Option<String>,
    pub tournaments: usize,
    pub errors: Vec<String>,
}

/// Rejections for an externally built snapshot. The whole payload is
/// validated before anything is written; one bad field rejects all of it.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("field {field} {problem}")]
    Field {
        field: &'static str,
        problem: &'static str,
    },
    #[error("tournaments[{index}]: {problem}")]
    Entry { index: usize, problem: String },
    #[error("storing pushed snapshot")]
    Store(#[source] anyhow::Error),
}

/// Serializes refresh attempts against one snapshot cache.
#[derive(Clone)]
pub struct RefreshCoordinator {
    config: RefreshConfig,
    store: SnapshotStore,
    lock: RefreshLock,
    aggregator: Aggregator,
}

impl RefreshCoordinator {
    pub fn new(config: RefreshConfig, registry: SourceRegistry) -> Result<Self> {
        let store = SnapshotStore::new(config.cache_path.clone());
        let lock = RefreshLock::new(
            config.lock_path.clone(),
            Duration::from_secs(config.lock_stale_secs),
        );
        let aggregator = Aggregator::new(config.clone(), registry)?;
        Ok(Self {
            config,
            store,
            lock,
            aggregator,
        })
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Runs one locked refresh attempt, blocking until it finishes.
    /// Returns `InProgress` without touching the cache when another
    /// attempt holds the lock.
    pub async fn refresh_sync(&self) -> Result<RefreshStatus> {
        self.lock.clear_if_abandoned().await;
        let Some(guard) = self.lock.acquire().await? else {
            info!("refresh already in progress; skipping");
            return Ok(RefreshStatus::InProgress);
        };

        let outcome = self.run_attempt().await;
        if let Err(err) = &outcome {
            self.record_failure(err).await;
        }
        // Releasing is the final step of every attempt, failed or not.
        guard.release().await;
        outcome.map(|_| RefreshStatus::Completed)
    }

    /// Entry point for runtime refresh requests, i.e. anything other
    /// than the CLI `refresh` command or the scheduler. Honors the
    /// runtime gate and the async hand-off mode.
    pub async fn request_refresh(&self) -> Result<RefreshStatus> {
        if !self.config.runtime_refresh {
            return Ok(RefreshStatus::Disabled);
        }
        self.lock.clear_if_abandoned().await;
        if self.lock.in_progress().await {
            return Ok(RefreshStatus::InProgress);
        }
        if !self.config.async_refresh {
            return self.refresh_sync().await;
        }

        // Detached on purpose: progress is observed through the lock
        // file, never through a task handle.
        let worker = self.clone();
        tokio::spawn(async move {
            if let Err(err) = worker.refresh_sync().await {
                error!(error = ?err, "background refresh failed");
            }
        });
        Ok(RefreshStatus::Started)
    }

    /// Cache and lock view without side effects. A stale lock already
    /// reads as not-refreshing here; it is collapsed on the next attempt.
    pub async fn status(&self) -> Result<StatusReport> {
        let refreshing = self.lock.in_progress().await;
        let report = match self.store.load().await? {
            Some(snapshot) => StatusReport {
                refreshing,
                updated_at: Some(snapshot.updated_at),
                tournaments: snapshot.tournaments.len(),
                errors: snapshot.errors,
            },
            None => StatusReport {
                refreshing,
                updated_at: None,
                tournaments: 0,
                errors: Vec::new(),
            },
        };
        Ok(report)
    }

    /// Validates and applies a snapshot built by a trusted caller,
    /// bypassing the extractor pipeline. A rejected payload leaves the
    /// cache byte-for-byte unchanged.
    pub async fn push_snapshot(&self, payload: &Value) -> Result<Snapshot, PushError> {
        let snapshot = validate_push_payload(payload)?;
        self.store.write(&snapshot).await.map_err(PushError::Store)?;
        info!(
            tournaments = snapshot.tournaments.len(),
            errors = snapshot.errors.len(),
            "pushed snapshot applied"
        );
        Ok(snapshot)
    }

    async fn run_attempt(&self) -> Result<()> {
        let (tournaments, errors) = self.aggregator.collect().await;
        let snapshot = Snapshot::stamped(Utc::now(), errors, tournaments);
        self.store.write(&snapshot).await
    }

    /// Writes the failure chain where operators look for it. The lock
    /// still has to be released afterwards, so this never propagates.
    async fn record_failure(&self, err: &anyhow::Error) {
        error!(error = ?err, "refresh attempt failed");
        let path = &self.config.error_log_path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = fs::create_dir_all(parent).await;
            }
        }
        if let Err(write_err) = fs::write(path, format!("{err:?}\n")).await {
            warn!(
                path = %path.display(),
                error = %write_err,
                "could not write refresh error log"
            );
        }
    }
}

/// Checks an externally built snapshot payload, shape and values both.
/// Nothing may be written unless every field passes.
pub fn validate_push_payload(payload: &Value) -> Result<Snapshot, PushError> {
    let Some(object) = payload.as_object() else {
        return Err(PushError::NotAnObject);
    };

    let updated_at = match object.get("updated_at").and_then(Value::as_str) {
        Some(s) if is_snapshot_timestamp(s) => s.to_string(),
        _ => {
            return Err(PushError::Field {
                field: "updated_at",
                problem: "must be a Z-suffixed RFC 3339 timestamp",
            })
        }
    };

    let Some(error_items) = object.get("errors").and_then(Value::as_array) else {
        return Err(PushError::Field {
            field: "errors",
            problem: "must be an array",
        });
    };
    let mut errors = Vec::with_capacity(error_items.len());
    for item in error_items {
        let Some(text) = item.as_str() else {
            return Err(PushError::Field {
                field: "errors",
                problem: "must contain only strings",
            });
        };
        errors.push(text.to_string());
    }

    let Some(entries) = object.get("tournaments").and_then(Value::as_array) else {
        return Err(PushError::Field {
            field: "tournaments",
            problem: "must be an array",
        });
    };
    let mut tournaments = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        tournaments.push(validate_entry(index, entry)?);
    }

    Ok(Snapshot {
        updated_at,
        errors,
        tournaments,
    })
}

fn is_snapshot_timestamp(s: &str) -> bool {
    s.ends_with('Z') && chrono::DateTime::parse_from_rfc3339(s).is_ok()
}

fn validate_entry(index: usize, entry: &Value) -> Result<Tournament, PushError> {
    let Some(object) = entry.as_object() else {
        return Err(PushError::Entry {
            index,
            problem: "must be an object".to_string(),
        });
    };

    let title = required_text(object, index, "title")?;
    let source = required_text(object, index, "source")?;
    let link = required_text(object, index, "link")?;

    let date = match object.get("date") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => match NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            Ok(date) => Some(date),
            Err(_) => {
                return Err(PushError::Entry {
                    index,
                    problem: format!("date \"{s}\" must be YYYY-MM-DD"),
                })
            }
        },
        Some(_) => {
            return Err(PushError::Entry {
                index,
                problem: "date must be a string or null".to_string(),
            })
        }
    };

    let location = match object.get("location") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            return Err(PushError::Entry {
                index,
                problem: "location must be a string or null".to_string(),
            })
        }
    };

    Ok(Tournament {
        title,
        source,
        link,
        date,
        location,
    })
}

fn required_text(
    object: &Map<String, Value>,
    index: usize,
    field: &'static str,
) -> Result<String, PushError> {
    match object.get(field).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
        _ => Err(PushError::Entry {
            index,
            problem: format!("{field} must be a non-empty string"),
        }),
    }
}
