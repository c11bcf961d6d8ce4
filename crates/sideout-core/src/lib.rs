//! Core domain model for the Texas beach volleyball tournament finder.
//!
//! A [`Tournament`] is one upcoming event as published in the snapshot file;
//! a [`Snapshot`] is the whole cache payload the display layer reads. The
//! [`textdate`] module holds the text-normalization and date-inference
//! helpers every source extractor leans on.

pub mod textdate;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Crate-level name used in logs.
pub const CRATE_NAME: &str = "sideout-core";

/// One upcoming tournament, normalized to the snapshot schema.
///
/// `date` serializes as `YYYY-MM-DD` or `null`; `location` is free text such
/// as `"Austin, TX"` or `null` when the source never states one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tournament {
    pub title: String,
    pub source: String,
    pub link: String,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub location: Option<String>,
}

impl Tournament {
    /// Composite identity used for cross-source deduplication.
    ///
    /// Dateless records never reach the dedup step, so the empty-string date
    /// component only exists to keep the key total.
    pub fn dedup_key(&self) -> (String, String, String) {
        (
            self.source.to_lowercase(),
            self.title.to_lowercase(),
            self.date.map(|d| d.to_string()).unwrap_or_default(),
        )
    }
}

/// The cache payload: a timestamp, per-source diagnostics, and the merged
/// tournament list in display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub updated_at: String,
    pub errors: Vec<String>,
    pub tournaments: Vec<Tournament>,
}

impl Snapshot {
    /// Builds a snapshot stamped with the given instant.
    pub fn stamped(
        at: DateTime<Utc>,
        errors: Vec<String>,
        tournaments: Vec<Tournament>,
    ) -> Self {
        Self {
            updated_at: format_updated_at(at),
            errors,
            tournaments,
        }
    }
}

/// Formats a snapshot timestamp as Z-suffixed ISO-8601 with microseconds,
/// e.g. `2025-03-01T12:34:56.123456Z`.
pub fn format_updated_at(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
