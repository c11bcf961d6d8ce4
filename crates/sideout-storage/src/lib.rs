//! Persistence and transport plumbing: the JSON snapshot the display layer
//! reads, the single-flight refresh lock, and a rate-limited HTTP fetcher
//! with retry/backoff. The [`render`] module holds the seam to an external
//! page-rendering helper for sources that never serve usable static HTML.

pub mod render;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE};
use sideout_core::{format_updated_at, Snapshot};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Desktop browser identity presented to the scraped sites. Several of
/// them refuse or degrade responses to obvious bot user agents.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

/// Read/write access to the snapshot file the display layer consumes.
///
/// Writes go to a hidden temp file in the target directory and are renamed
/// over the destination, so a concurrent reader only ever sees a complete
/// payload.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot. A missing file is an empty cache, not an error.
    pub async fn load(&self) -> anyhow::Result<Option<Snapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading snapshot {}", self.path.display()))
            }
        };
        let snapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing snapshot {}", self.path.display()))?;
        Ok(Some(snapshot))
    }

    /// Atomically replaces the snapshot file.
    pub async fn write(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let body = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;
        let temp = parent.join(format!(".{}.snapshot.tmp", Uuid::new_v4()));
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .await
            .with_context(|| format!("creating temp snapshot {}", temp.display()))?;
        file.write_all(&body)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp.display()))?;
        drop(file);

        if let Err(err) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(err)
                .with_context(|| format!("replacing snapshot {}", self.path.display()));
        }
        info!(
            path = %self.path.display(),
            tournaments = snapshot.tournaments.len(),
            errors = snapshot.errors.len(),
            "snapshot written"
        );
        Ok(())
    }
}

/// Lifecycle of the refresh lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No lock file; no refresh attempt underway.
    Idle,
    /// A fresh lock file; a refresh attempt owns the cache.
    Refreshing,
    /// A lock file older than the stale threshold; the attempt that wrote
    /// it crashed or wedged without releasing.
    Abandoned,
}

/// Single-flight marker for refresh attempts.
///
/// Existence of the file is the whole contract. The `"<pid> <timestamp>Z"`
/// content is diagnostic only; staleness is judged from file mtime.
#[derive(Debug, Clone)]
pub struct RefreshLock {
    path: PathBuf,
    stale_after: Duration,
}

impl RefreshLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn state(&self) -> LockState {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(_) => return LockState::Idle,
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .unwrap_or(Duration::ZERO);
        if age > self.stale_after {
            LockState::Abandoned
        } else {
            LockState::Refreshing
        }
    }

    /// True while a live (non-stale) attempt holds the lock.
    pub async fn in_progress(&self) -> bool {
        self.state().await == LockState::Refreshing
    }

    /// Removes a leftover lock from an abandoned attempt. Returns whether
    /// a file was cleared.
    pub async fn clear_if_abandoned(&self) -> bool {
        if self.state().await != LockState::Abandoned {
            return false;
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                warn!(path = %self.path.display(), "cleared abandoned refresh lock");
                true
            }
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "could not clear abandoned refresh lock");
                false
            }
        }
    }

    /// Attempts the exclusive create. `Ok(None)` means another attempt
    /// already holds the lock.
    pub async fn acquire(&self) -> anyhow::Result<Option<RefreshLockGuard>> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating lock directory {}", parent.display()))?;
            }
        }
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("creating refresh lock {}", self.path.display()))
            }
        };
        let stamp = format!(
            "{} {}",
            std::process::id(),
            format_updated_at(chrono::Utc::now())
        );
        file.write_all(stamp.as_bytes())
            .await
            .with_context(|| format!("writing refresh lock {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing refresh lock {}", self.path.display()))?;
        info!(path = %self.path.display(), "refresh lock acquired");
        Ok(Some(RefreshLockGuard {
            path: self.path.clone(),
            released: false,
        }))
    }
}

/// Held for the duration of a refresh attempt. Releasing (or dropping)
/// removes the lock file no matter how the attempt ended.
#[derive(Debug)]
pub struct RefreshLockGuard {
    path: PathBuf,
    released: bool,
}

impl RefreshLockGuard {
    pub async fn release(mut self) {
        self.released = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => info!(path = %self.path.display(), "refresh lock released"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "could not remove refresh lock")
            }
        }
    }
}

impl Drop for RefreshLockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Whether a failed request is worth another try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    Fatal,
}

impl RetryDisposition {
    /// Server trouble and throttling retry; every other status is final.
    pub fn of_status(status: u16) -> Self {
        if status >= 500 || status == 429 {
            Self::Retryable
        } else {
            Self::Fatal
        }
    }

    /// Transport-level failures retry; anything else is final.
    pub fn of_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Retryable
        } else {
            Self::Fatal
        }
    }
}

/// Capped exponential backoff between retries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Optional pacing so a refresh never hammers one site.
#[derive(Debug, Clone)]
pub struct RequestPacing {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

struct PacerState {
    tokens: f64,
    last_refill: Instant,
}

struct RequestPacer {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<PacerState>,
}

impl RequestPacer {
    fn new(config: &RequestPacing) -> Self {
        Self {
            capacity: f64::from(config.capacity),
            refill_per_sec: config.refill_per_sec,
            state: Mutex::new(PacerState {
                tokens: f64::from(config.capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64(((1.0 - state.tokens) / self.refill_per_sec).max(0.01))
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Tuning for the shared HTTP fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub pacing: Option<RequestPacing>,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
            pacing: None,
        }
    }
}

/// Shared HTTP client with browser-shaped headers, per-source concurrency
/// limits, and retry with backoff for transient failures.
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    per_source_concurrency: usize,
    backoff: BackoffPolicy,
    pacer: Option<RequestPacer>,
}

impl HttpFetcher {
    pub fn new(config: HttpFetcherConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency)),
            per_source: Mutex::new(HashMap::new()),
            per_source_concurrency: config.per_source_concurrency,
            backoff: config.backoff,
            pacer: config.pacing.as_ref().map(RequestPacer::new),
        })
    }

    async fn source_limit(&self, source_key: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_concurrency)))
            .clone()
    }

    /// Fetches a URL, retrying transient failures per the backoff policy.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_key: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_key, url);
        let source_limit = self.source_limit(source_key).await;
        async move {
            // The semaphores are never closed, so acquire cannot fail.
            let _global = self.global_limit.acquire().await.expect("semaphore closed");
            let _source = source_limit.acquire().await.expect("semaphore closed");
            let mut attempt: u32 = 0;
            loop {
                if let Some(pacer) = &self.pacer {
                    pacer.acquire().await;
                }
                match self.client.get(url).send().await {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        if response.status().is_success() {
                            let final_url = response.url().to_string();
                            let body = response.bytes().await?.to_vec();
                            info!(status, bytes = body.len(), "fetched");
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }
                        if RetryDisposition::of_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            let delay = self.backoff.delay(attempt);
                            warn!(status, attempt, delay_ms = delay.as_millis() as u64, "retryable status");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::HttpStatus {
                            status,
                            url: url.to_string(),
                        });
                    }
                    Err(err) => {
                        if RetryDisposition::of_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            let delay = self.backoff.delay(attempt);
                            warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "retryable transport error");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Fetches a URL and decodes the body as text (lossy UTF-8).
    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        source_key: &str,
        url: &str,
    ) -> Result<FetchedPage, FetchError> {
        let response = self.fetch_bytes(run_id, source_key, url).await?;
        Ok(FetchedPage {
            status: response.status,
            final_url: response.final_url,
            body: String::from_utf8_lossy(&response.body).into_owned(),
        })
    }
}

/// Raw fetch result.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Text fetch result.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

/// Transport or protocol failure surfaced by the fetcher.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use sideout_core::Tournament;

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            updated_at: "2025-03-01T12:00:00.000000Z".into(),
            errors: vec!["Third Coast VB: timed out".into()],
            tournaments: vec![Tournament {
                title: "Summer Kickoff".into(),
                source: "512 Beach".into(),
                link: "https://512beach.com/events/42".into(),
                date: chrono::NaiveDate::from_ymd_opt(2025, 6, 14),
                location: Some("Austin, TX".into()),
            }],
        }
    }

    #[tokio::test]
    async fn snapshot_store_round_trips_and_treats_absence_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("data/tournaments.json"));

        assert!(store.load().await.unwrap().is_none());

        let snapshot = sample_snapshot();
        store.write(&snapshot).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);

        // No temp residue next to the cache file.
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("data"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("tournaments.json")]);
    }

    #[tokio::test]
    async fn snapshot_write_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("tournaments.json"));
        let mut snapshot = sample_snapshot();
        store.write(&snapshot).await.unwrap();

        snapshot.errors.clear();
        snapshot.updated_at = "2025-03-02T08:00:00.000000Z".into();
        store.write(&snapshot).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.updated_at, "2025-03-02T08:00:00.000000Z");
        assert!(loaded.errors.is_empty());
    }

    #[tokio::test]
    async fn lock_acquire_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RefreshLock::new(dir.path().join("refresh.lock"), Duration::from_secs(600));

        let guard = lock.acquire().await.unwrap().expect("first acquire");
        assert_eq!(lock.state().await, LockState::Refreshing);
        assert!(lock.acquire().await.unwrap().is_none());

        guard.release().await;
        assert_eq!(lock.state().await, LockState::Idle);
        assert!(lock.acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn abandoned_lock_collapses_and_acquire_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RefreshLock::new(dir.path().join("refresh.lock"), Duration::from_millis(1));

        let guard = lock.acquire().await.unwrap().expect("first acquire");
        // Simulate a crashed attempt that never ran the release path.
        std::mem::forget(guard);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(lock.state().await, LockState::Abandoned);
        assert!(lock.clear_if_abandoned().await);
        assert_eq!(lock.state().await, LockState::Idle);
        assert!(lock.acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dropping_the_guard_releases_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RefreshLock::new(dir.path().join("refresh.lock"), Duration::from_secs(600));
        {
            let _guard = lock.acquire().await.unwrap().expect("acquire");
        }
        assert_eq!(lock.state().await, LockState::Idle);
    }

    #[test]
    fn lock_stamp_is_pid_then_timestamp() {
        // Written content is diagnostic; shape check only.
        let stamp = format!(
            "{} {}",
            std::process::id(),
            format_updated_at(chrono::Utc::now())
        );
        let mut parts = stamp.splitn(2, ' ');
        assert!(parts.next().unwrap().parse::<u32>().is_ok());
        assert!(parts.next().unwrap().ends_with('Z'));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(250));
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(10), Duration::from_secs(5));
    }

    #[test]
    fn retry_classification_matches_policy() {
        assert_eq!(RetryDisposition::of_status(503), RetryDisposition::Retryable);
        assert_eq!(RetryDisposition::of_status(429), RetryDisposition::Retryable);
        assert_eq!(RetryDisposition::of_status(404), RetryDisposition::Fatal);
        assert_eq!(RetryDisposition::of_status(200), RetryDisposition::Fatal);
    }
}
