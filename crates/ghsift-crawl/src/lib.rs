//! Rate-limit-aware crawl: paginates the repository index, gates and classifies each
//! candidate with code-search predicates, bins the results and persists them.

pub mod predicate;
pub mod profile;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ghsift_core::{BinSet, Candidate, ClassificationResult, ClassifiedRecord, PageCursor, RunMetadata};
use ghsift_search::{
    ContentPage, EntityPage, EntityQuery, GithubSearch, GithubSearchConfig, SearchError,
    SearchOracle, DEFAULT_API_BASE_URL,
};
use ghsift_storage::{
    ArtifactFetcher, AvatarFetcher, AvatarFetcherConfig, JsonFileSink, NoopArtifactFetcher,
    RateLimiter, Sleeper, TokioSleeper, DEFAULT_LOW_WATER_MARK,
};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use predicate::{mentions_word, Pacing, Predicate, PredicateKind, PredicateSet};
pub use profile::{profile_by_name, CrawlProfile, Overlay, PrimaryBin, ProfileError, PROFILE_NAMES};

pub const CRATE_NAME: &str = "ghsift-crawl";

pub const DEFAULT_MIN_STARS: u32 = 200;
pub const DEFAULT_PROFILE: &str = "android";

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub profile: String,
    pub min_stars: u32,
    pub output_dir: PathBuf,
    pub images_dir: PathBuf,
    pub github_token: Option<String>,
    pub api_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub low_water_mark: u32,
    pub subquery_delay_ms: u64,
    pub candidate_delay_ms: u64,
}

impl CrawlConfig {
    pub fn from_env() -> Self {
        Self {
            profile: DEFAULT_PROFILE.to_string(),
            min_stars: DEFAULT_MIN_STARS,
            output_dir: std::env::var("GHSIFT_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            images_dir: std::env::var("GHSIFT_IMAGES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("images")),
            github_token: std::env::var("GITHUB_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            api_base_url: std::env::var("GHSIFT_API_URL")
                .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string()),
            user_agent: std::env::var("GHSIFT_USER_AGENT")
                .unwrap_or_else(|_| format!("ghsift/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: env_or("GHSIFT_HTTP_TIMEOUT_SECS", 30),
            low_water_mark: env_or("GHSIFT_LOW_WATER_MARK", DEFAULT_LOW_WATER_MARK),
            subquery_delay_ms: env_or("GHSIFT_SUBQUERY_DELAY_MS", 100),
            candidate_delay_ms: env_or("GHSIFT_CANDIDATE_DELAY_MS", 500),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            min_stars: self.min_stars,
            low_water_mark: self.low_water_mark,
            subquery_delay: Duration::from_millis(self.subquery_delay_ms),
            candidate_pause: Duration::from_millis(self.candidate_delay_ms),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Search oracle behind the rate limiter: every call is throttled against the latest
/// quota state first, and its quota signal is observed afterwards.
pub struct GuardedOracle {
    oracle: Box<dyn SearchOracle>,
    limiter: RateLimiter,
    calls: u64,
}

impl GuardedOracle {
    pub fn new(oracle: Box<dyn SearchOracle>, limiter: RateLimiter) -> Self {
        Self {
            oracle,
            limiter,
            calls: 0,
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn search_entities(
        &mut self,
        query: &EntityQuery,
        page: u32,
    ) -> Result<EntityPage, SearchError> {
        self.limiter.throttle().await;
        self.calls += 1;
        let result = self.oracle.search_entities(query, page).await?;
        self.limiter.observe(result.quota);
        Ok(result)
    }

    pub async fn search_content(&mut self, query: &str) -> Result<ContentPage, SearchError> {
        self.limiter.throttle().await;
        self.calls += 1;
        let result = self.oracle.search_content(query).await?;
        self.limiter.observe(result.quota);
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub min_stars: u32,
    pub low_water_mark: u32,
    pub subquery_delay: Duration,
    pub candidate_pause: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_stars: DEFAULT_MIN_STARS,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            subquery_delay: Duration::from_millis(100),
            candidate_pause: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlSummary {
    pub run_id: Uuid,
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: u32,
    pub candidates_seen: usize,
    pub candidates_retained: usize,
    pub gated_out: usize,
    pub duplicates_skipped: usize,
    pub avatars_fetched: usize,
    pub remote_calls: u64,
    pub bins: BTreeMap<String, usize>,
    pub bin_files: Vec<String>,
    pub metadata_file: String,
}

#[derive(Debug, Default)]
struct CrawlStats {
    pages_fetched: u32,
    candidates_seen: usize,
    candidates_retained: usize,
    gated_out: usize,
    duplicates_skipped: usize,
    avatars_fetched: usize,
}

/// One crawl run. All in-progress state (bins, cursor, quota) lives here and is dropped
/// with it; nothing is checkpointed.
pub struct ClassificationPipeline {
    profile: CrawlProfile,
    settings: PipelineSettings,
    oracle: Box<dyn SearchOracle>,
    sink: JsonFileSink,
    artifacts: Box<dyn ArtifactFetcher>,
    sleeper: Arc<dyn Sleeper>,
}

impl ClassificationPipeline {
    pub fn new(
        profile: CrawlProfile,
        settings: PipelineSettings,
        oracle: Box<dyn SearchOracle>,
        sink: JsonFileSink,
    ) -> Self {
        Self {
            profile,
            settings,
            oracle,
            sink,
            artifacts: Box::<NoopArtifactFetcher>::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_artifact_fetcher(mut self, artifacts: Box<dyn ArtifactFetcher>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub async fn run(self) -> Result<CrawlSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("crawl", %run_id, profile = self.profile.name);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(self, run_id: Uuid) -> Result<CrawlSummary> {
        let started_at = Utc::now();
        let Self {
            profile,
            settings,
            oracle,
            sink,
            artifacts,
            sleeper,
        } = self;

        let mut search = GuardedOracle::new(
            oracle,
            RateLimiter::new(settings.low_water_mark, sleeper.clone()),
        );
        let pacing = Pacing::new(sleeper, settings.subquery_delay);
        let query = profile.entity_query(settings.min_stars);
        let mut bins = BinSet::new(profile.bin_names());
        let mut cursor = PageCursor::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut stats = CrawlStats::default();

        info!(q = %query.render(), "crawl started");

        while cursor.has_more() {
            let page_no = cursor.page();
            let page = search
                .search_entities(&query, page_no)
                .await
                .with_context(|| format!("searching repositories, page {page_no}"))?;
            cursor.record_total(page.total_pages);
            stats.pages_fetched += 1;
            info!(
                "page: {}/{}, size: {}, total: {}",
                page_no,
                page.total_pages,
                page.items.len(),
                page.total_count
            );

            for candidate in page.items {
                stats.candidates_seen += 1;
                if !seen.insert(candidate.full_name.clone()) {
                    stats.duplicates_skipped += 1;
                    debug!(repo = %candidate.full_name, "already processed; skipping");
                    continue;
                }

                let Some(classification) =
                    classify_candidate(&profile, &candidate, &mut search, &pacing)
                        .await
                        .with_context(|| format!("classifying {}", candidate.full_name))?
                else {
                    stats.gated_out += 1;
                    debug!(repo = %candidate.full_name, gate = profile.gate.tag, "gated out");
                    continue;
                };

                let mut candidate = candidate;
                candidate.strip_auxiliary();
                if artifacts.enrich(&mut candidate).await {
                    stats.avatars_fetched += 1;
                }

                let targets = profile.bins_for(&classification);
                info!(repo = %candidate.full_name, bins = ?targets, "{}: {}", profile.name, candidate.full_name);
                let record = ClassifiedRecord::new(candidate, classification);
                for bin in targets {
                    bins.push(bin, record.clone());
                }
                stats.candidates_retained += 1;

                pacing.pause(settings.candidate_pause).await;
            }

            cursor.advance();
        }

        let mut bin_files = Vec::new();
        for bin in bins.bins() {
            let path = sink.write_bin(profile.name, bin).await?;
            bin_files.push(path.display().to_string());
        }

        let finished_at = Utc::now();
        let counts = bins.counts();
        let metadata = RunMetadata {
            last_modified: RunMetadata::human_timestamp(finished_at),
            run_id,
            profile: profile.name.to_string(),
            min_stars: settings.min_stars,
            started_at,
            finished_at,
            bins: counts.clone(),
        };
        let metadata_file = sink.write_metadata(&metadata).await?;

        if stats.pages_fetched > 0 && stats.candidates_seen == 0 {
            warn!("search returned no candidates");
        }

        Ok(CrawlSummary {
            run_id,
            profile: profile.name.to_string(),
            started_at,
            finished_at,
            pages_fetched: stats.pages_fetched,
            candidates_seen: stats.candidates_seen,
            candidates_retained: stats.candidates_retained,
            gated_out: stats.gated_out,
            duplicates_skipped: stats.duplicates_skipped,
            avatars_fetched: stats.avatars_fetched,
            remote_calls: search.calls(),
            bins: counts,
            bin_files,
            metadata_file: metadata_file.display().to_string(),
        })
    }
}

/// Gate first; only candidates passing it pay for the full predicate set.
async fn classify_candidate(
    profile: &CrawlProfile,
    candidate: &Candidate,
    search: &mut GuardedOracle,
    pacing: &Pacing,
) -> Result<Option<ClassificationResult>, SearchError> {
    if !profile.gate.evaluate(candidate, search, pacing).await? {
        return Ok(None);
    }
    profile
        .predicates
        .classify(candidate, search, pacing)
        .await
        .map(Some)
}

/// Resolve the profile, wire the GitHub client and avatar downloads, and run one crawl.
pub async fn run_crawl(config: CrawlConfig) -> Result<CrawlSummary> {
    let profile = profile_by_name(&config.profile)?;

    if config.github_token.is_none() {
        warn!("GITHUB_TOKEN is empty; crawling at the unauthenticated quota");
    }

    let timeout = Duration::from_secs(config.http_timeout_secs);
    let oracle = GithubSearch::new(GithubSearchConfig {
        api_base_url: config.api_base_url.clone(),
        token: config.github_token.clone(),
        user_agent: config.user_agent.clone(),
        timeout,
    })
    .context("building GitHub search client")?;
    let avatars = AvatarFetcher::new(AvatarFetcherConfig {
        images_dir: config.images_dir.clone(),
        timeout,
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;

    ClassificationPipeline::new(
        profile,
        config.pipeline_settings(),
        Box::new(oracle),
        JsonFileSink::new(config.output_dir.clone()),
    )
    .with_artifact_fetcher(Box::new(avatars))
    .run()
    .await
}
