//! Search oracle contract + GitHub REST implementation for the repository (entity) and
//! code (content) indexes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ghsift_core::{Candidate, QuotaSignal};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, LINK};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "ghsift-search";

pub const DEFAULT_API_BASE_URL: &str = "https://api.github.com";
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Free-text repository query with the qualifiers the crawler needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityQuery {
    pub term: String,
    pub include_forks: bool,
    pub min_stars: u32,
    pub language: Option<String>,
    pub sort: String,
    pub per_page: u32,
}

impl EntityQuery {
    pub fn new(term: impl Into<String>, min_stars: u32) -> Self {
        Self {
            term: term.into(),
            include_forks: true,
            min_stars,
            language: None,
            sort: "stars".to_string(),
            per_page: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn render(&self) -> String {
        let mut q = format!(
            "{} fork:{} stars:>={}",
            self.term, self.include_forks, self.min_stars
        );
        if let Some(language) = &self.language {
            q.push_str(&format!(" language:{language}"));
        }
        q
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Needle {
    /// Quoted, matched literally.
    Literal(String),
    Term(String),
}

/// Code-search query template; bound to one repository at render time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentQuery {
    needle: Needle,
    in_path: bool,
    extension: Option<String>,
    language: Option<String>,
}

impl ContentQuery {
    pub fn literal(text: impl Into<String>) -> Self {
        Self::with_needle(Needle::Literal(text.into()))
    }

    pub fn term(text: impl Into<String>) -> Self {
        Self::with_needle(Needle::Term(text.into()))
    }

    fn with_needle(needle: Needle) -> Self {
        Self {
            needle,
            in_path: false,
            extension: None,
            language: None,
        }
    }

    pub fn in_path(mut self) -> Self {
        self.in_path = true;
        self
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn render_for(&self, repo_full_name: &str) -> String {
        let mut parts = vec![match &self.needle {
            Needle::Literal(text) => format!("\"{text}\""),
            Needle::Term(text) => text.clone(),
        }];
        if self.in_path {
            parts.push("in:path".to_string());
        }
        if let Some(extension) = &self.extension {
            parts.push(format!("extension:{extension}"));
        }
        if let Some(language) = &self.language {
            parts.push(format!("language:{language}"));
        }
        parts.push(format!("repo:{repo_full_name}"));
        parts.join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct EntityPage {
    pub items: Vec<Candidate>,
    pub total_count: u64,
    pub total_pages: u32,
    pub quota: Option<QuotaSignal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct ContentPage {
    pub total_count: u64,
    pub items: Vec<ContentItem>,
    pub quota: Option<QuotaSignal>,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {message}")]
    HttpStatus {
        status: u16,
        url: String,
        message: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Remote search capability. Every error is fatal to a crawl.
#[async_trait]
pub trait SearchOracle: Send + Sync {
    async fn search_entities(&self, query: &EntityQuery, page: u32)
        -> Result<EntityPage, SearchError>;

    async fn search_content(&self, query: &str) -> Result<ContentPage, SearchError>;
}

#[derive(Debug, Clone)]
pub struct GithubSearchConfig {
    pub api_base_url: String,
    pub token: Option<String>,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for GithubSearchConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            token: None,
            user_agent: format!("ghsift/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RepositorySearchBody {
    total_count: u64,
    #[serde(default)]
    items: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct CodeSearchBody {
    total_count: u64,
    #[serde(default)]
    items: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug)]
pub struct GithubSearch {
    client: reqwest::Client,
    api_base_url: String,
    token: Option<String>,
}

impl GithubSearch {
    pub fn new(config: GithubSearchConfig) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: config.token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    async fn get(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<(HeaderMap, String, String), SearchError> {
        let url = format!("{}/{endpoint}", self.api_base_url);
        let mut request = self
            .client
            .get(&url)
            .header(ACCEPT, "application/vnd.github+json")
            .query(params);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("token {token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        let headers = response.headers().clone();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|e| e.message)
                .unwrap_or_else(|_| body.chars().take(200).collect());
            return Err(SearchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                message,
            });
        }
        Ok((headers, final_url, body))
    }
}

#[async_trait]
impl SearchOracle for GithubSearch {
    async fn search_entities(
        &self,
        query: &EntityQuery,
        page: u32,
    ) -> Result<EntityPage, SearchError> {
        let q = query.render();
        debug!(q = %q, page, "searching repositories");
        let params = [
            ("q", q),
            ("sort", query.sort.clone()),
            ("order", "desc".to_string()),
            ("per_page", query.per_page.to_string()),
            ("page", page.to_string()),
        ];
        let (headers, url, body) = self.get("search/repositories", &params).await?;
        let parsed: RepositorySearchBody =
            serde_json::from_str(&body).map_err(|source| SearchError::Decode { url, source })?;

        let total_pages = headers
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(last_page_from_link)
            .unwrap_or(page);

        Ok(EntityPage {
            items: parsed.items,
            total_count: parsed.total_count,
            total_pages,
            quota: quota_from_headers(&headers),
        })
    }

    async fn search_content(&self, query: &str) -> Result<ContentPage, SearchError> {
        debug!(q = %query, "searching code");
        let (headers, url, body) = self
            .get("search/code", &[("q", query.to_string())])
            .await?;
        let parsed: CodeSearchBody =
            serde_json::from_str(&body).map_err(|source| SearchError::Decode { url, source })?;

        Ok(ContentPage {
            total_count: parsed.total_count,
            items: parsed.items,
            quota: quota_from_headers(&headers),
        })
    }
}

/// Quota signal from `X-RateLimit-Remaining` / `X-RateLimit-Reset` (epoch seconds).
pub fn quota_from_headers(headers: &HeaderMap) -> Option<QuotaSignal> {
    let remaining = headers
        .get("x-ratelimit-remaining")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    let reset_epoch: i64 = headers
        .get("x-ratelimit-reset")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    let reset_at = DateTime::<Utc>::from_timestamp(reset_epoch, 0)?;
    Some(QuotaSignal {
        remaining,
        reset_at,
    })
}

/// Page number of the `rel="last"` entry of a GitHub `Link` header.
pub fn last_page_from_link(link: &str) -> Option<u32> {
    link.split(',').find_map(|entry| {
        let mut segments = entry.split(';');
        let target = segments
            .next()?
            .trim()
            .strip_prefix('<')?
            .strip_suffix('>')?;
        if !segments.any(|s| s.trim() == "rel=\"last\"") {
            return None;
        }
        let url = reqwest::Url::parse(target).ok()?;
        let page = url
            .query_pairs()
            .find(|(key, _)| key == "page")
            .map(|(_, value)| value.into_owned())?;
        page.parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn entity_query_renders_qualifiers() {
        let query = EntityQuery::new("android", 200);
        assert_eq!(query.render(), "android fork:true stars:>=200");

        let mut query = EntityQuery::new("polymer", 50);
        query.language = Some("html".to_string());
        assert_eq!(query.render(), "polymer fork:true stars:>=50 language:html");
    }

    #[test]
    fn content_query_binds_to_repo() {
        let marker = ContentQuery::term("androidmanifest.xml").in_path();
        assert_eq!(
            marker.render_for("square/picasso"),
            "androidmanifest.xml in:path repo:square/picasso"
        );

        let literal = ContentQuery::literal("android-library")
            .extension("gradle")
            .language("groovy");
        assert_eq!(
            literal.render_for("square/picasso"),
            "\"android-library\" extension:gradle language:groovy repo:square/picasso"
        );
    }

    #[test]
    fn link_header_last_page() {
        let link = "<https://api.github.com/search/repositories?q=android&page=2>; rel=\"next\", \
                    <https://api.github.com/search/repositories?q=android&page=10>; rel=\"last\"";
        assert_eq!(last_page_from_link(link), Some(10));

        let only_prev = "<https://api.github.com/search/repositories?q=android&page=9>; rel=\"prev\", \
                         <https://api.github.com/search/repositories?q=android&page=1>; rel=\"first\"";
        assert_eq!(last_page_from_link(only_prev), None);
        assert_eq!(last_page_from_link(""), None);
    }

    #[test]
    fn quota_headers_parse_and_tolerate_absence() {
        let mut headers = HeaderMap::new();
        assert_eq!(quota_from_headers(&headers), None);

        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("4"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1700000000"));
        let quota = quota_from_headers(&headers).expect("quota");
        assert_eq!(quota.remaining, 4);
        assert_eq!(quota.reset_at.timestamp(), 1_700_000_000);

        headers.insert("x-ratelimit-reset", HeaderValue::from_static("soon"));
        assert_eq!(quota_from_headers(&headers), None);
    }
}
