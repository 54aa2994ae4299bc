//! Quota throttling, best-effort avatar downloads and JSON result persistence for ghsift.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use ghsift_core::{Bin, Candidate, QuotaSignal, RunMetadata};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ghsift-storage";

pub const DEFAULT_LOW_WATER_MARK: u32 = 1;

/// Suspension point used for every enforced wait, so tests can observe waits without taking them.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested waits and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().map(|w| w.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut waits) = self.waits.lock() {
            waits.push(duration);
        }
    }
}

/// Blocks the caller until the quota window resets whenever the last observed remaining
/// count is at or below the low-water mark.
pub struct RateLimiter {
    low_water_mark: u32,
    state: Option<QuotaSignal>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("low_water_mark", &self.low_water_mark)
            .field("state", &self.state)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(low_water_mark: u32, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            low_water_mark,
            state: None,
            sleeper,
        }
    }

    pub fn low_water_mark(&self) -> u32 {
        self.low_water_mark
    }

    pub fn state(&self) -> Option<QuotaSignal> {
        self.state
    }

    /// Replace the quota state with the signal of the most recent call. `None` means the
    /// response carried no quota information and clears any constraint.
    pub fn observe(&mut self, signal: Option<QuotaSignal>) {
        self.state = signal;
    }

    /// Wait owed before the next call, as seen from `now`.
    ///
    /// The wait is `|reset - now|`, so a reset already in the past (clock skew) still
    /// yields a positive wait instead of zero.
    pub fn pending_wait(&self, now: DateTime<Utc>) -> Option<Duration> {
        let signal = self.state?;
        if signal.remaining > self.low_water_mark {
            return None;
        }
        let gap_ms = signal
            .reset_at
            .signed_duration_since(now)
            .num_milliseconds()
            .unsigned_abs();
        Some(Duration::from_millis(gap_ms))
    }

    /// Must run before every remote call. Returns the wait that was taken, if any.
    pub async fn throttle(&self) -> Option<Duration> {
        let wait = self.pending_wait(Utc::now())?;
        info!(
            wait_secs = wait.as_secs(),
            remaining = self.state.map(|s| s.remaining),
            "quota low; waiting for rate-limit window reset"
        );
        self.sleeper.sleep(wait).await;
        Some(wait)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("owner login {0:?} is not usable as a file name")]
    InvalidOwner(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Best-effort enrichment applied to each retained candidate. Implementations must
/// never fail the caller: the return value only reports whether the candidate changed.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn enrich(&self, candidate: &mut Candidate) -> bool;
}

#[derive(Debug, Default)]
pub struct NoopArtifactFetcher;

#[async_trait]
impl ArtifactFetcher for NoopArtifactFetcher {
    async fn enrich(&self, _candidate: &mut Candidate) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct AvatarFetcherConfig {
    pub images_dir: PathBuf,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for AvatarFetcherConfig {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from("images"),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Downloads owner avatars into a flat directory, one file per owner login.
#[derive(Debug)]
pub struct AvatarFetcher {
    client: reqwest::Client,
    images_dir: PathBuf,
    backoff: BackoffPolicy,
}

impl AvatarFetcher {
    pub fn new(config: AvatarFetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building avatar http client")?;
        Ok(Self {
            client,
            images_dir: config.images_dir,
            backoff: config.backoff,
        })
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Download `url` to `<images_dir>/<owner_login>` and return that path.
    ///
    /// The body is streamed into a temp file that is only renamed into place once fully
    /// written; on any failure the temp file is removed.
    pub async fn fetch_avatar(&self, owner_login: &str, url: &str) -> Result<PathBuf, ArtifactError> {
        if owner_login.is_empty()
            || owner_login.contains(|c| c == '/' || c == '\\')
            || owner_login.starts_with('.')
        {
            return Err(ArtifactError::InvalidOwner(owner_login.to_string()));
        }

        if let Err(err) = fs::create_dir_all(&self.images_dir).await {
            debug!(dir = %self.images_dir.display(), error = %err, "could not create images dir");
        }

        let response = self.get_with_retry(url).await?;
        let target = self.images_dir.join(owner_login);
        let temp = self
            .images_dir
            .join(format!(".{owner_login}.{}.tmp", Uuid::new_v4()));

        if let Err(err) = stream_to_file(response, &temp).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }

        if let Err(source) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(ArtifactError::Io {
                path: target,
                source,
            });
        }
        Ok(target)
    }

    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, ArtifactError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(ArtifactError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(ArtifactError::Request(err));
                }
            }
        }
    }
}

async fn stream_to_file(response: reqwest::Response, path: &Path) -> Result<(), ArtifactError> {
    let io_err = |source: std::io::Error| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .map_err(io_err)?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await.map_err(io_err)?;
    }
    file.flush().await.map_err(io_err)?;
    Ok(())
}

#[async_trait]
impl ArtifactFetcher for AvatarFetcher {
    async fn enrich(&self, candidate: &mut Candidate) -> bool {
        let Some(url) = candidate.owner.avatar_url.clone() else {
            debug!(repo = %candidate.full_name, "no avatar url; skipping download");
            return false;
        };
        let owner = candidate.owner_login().to_string();

        let span = info_span!("avatar_fetch", owner = %owner);
        match self.fetch_avatar(&owner, &url).instrument(span).await {
            Ok(path) => {
                candidate.set_local_avatar(path.display().to_string());
                true
            }
            Err(err) => {
                info!(owner = %owner, error = %err, "avatar download failed; keeping remote url");
                false
            }
        }
    }
}

/// Writes each bin as pretty-printed JSON under `<root>/<profile>/<bin>.json` and the run
/// metadata under `<root>/metadata.json`.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    root: PathBuf,
}

impl JsonFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bin_path(&self, profile: &str, bin_name: &str) -> PathBuf {
        self.root.join(profile).join(format!("{bin_name}.json"))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join("metadata.json")
    }

    pub async fn write_bin(&self, profile: &str, bin: &Bin) -> anyhow::Result<PathBuf> {
        let path = self.bin_path(profile, &bin.name);
        let bytes = serde_json::to_vec_pretty(&bin.records)
            .with_context(|| format!("serializing bin {}", bin.name))?;
        write_atomic(&path, &bytes).await?;
        info!(bin = %bin.name, records = bin.len(), path = %path.display(), "bin written");
        Ok(path)
    }

    pub async fn write_metadata(&self, metadata: &RunMetadata) -> anyhow::Result<PathBuf> {
        let path = self.metadata_path();
        let bytes = serde_json::to_vec_pretty(metadata).context("serializing run metadata")?;
        write_atomic(&path, &bytes).await?;
        Ok(path)
    }
}

/// Full buffer in hand, write it to a temp sibling and rename over the target.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::File::create(&temp_path)
        .await
        .with_context(|| format!("creating temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.write_all(b"\n")
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    Ok(())
}
