//! Core domain model for ghsift: candidates, classification tags, bins, quota and paging state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ghsift-core";

/// Repository owner as returned by the search API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Owner {
    pub login: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Every undeclared field (events_url, repos_url, ...).
    #[serde(flatten)]
    pub auxiliary: BTreeMap<String, JsonValue>,
}

/// A remote repository record as received from the entity index.
///
/// Declared fields form the persisted schema; anything else the API sends lands in
/// `auxiliary` and is dropped by [`Candidate::strip_auxiliary`] before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    pub owner: Owner,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub stargazers_count: u64,
    #[serde(default)]
    pub watchers_count: u64,
    #[serde(default)]
    pub forks_count: u64,
    #[serde(default)]
    pub open_issues_count: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pushed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub auxiliary: BTreeMap<String, JsonValue>,
}

impl Candidate {
    /// Allow-list projection: keep only the declared fields of repository and owner.
    pub fn strip_auxiliary(&mut self) {
        self.auxiliary.clear();
        self.owner.auxiliary.clear();
    }

    pub fn has_auxiliary(&self) -> bool {
        !self.auxiliary.is_empty() || !self.owner.auxiliary.is_empty()
    }

    /// Point the owner avatar at a locally stored copy.
    pub fn set_local_avatar(&mut self, path: impl Into<String>) {
        self.owner.avatar_url = Some(path.into());
    }

    pub fn owner_login(&self) -> &str {
        &self.owner.login
    }
}

/// Named boolean tags attached to one candidate, in stable (sorted) order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct ClassificationResult {
    tags: BTreeMap<String, bool>,
}

impl ClassificationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, tag: impl Into<String>, value: bool) {
        self.tags.insert(tag.into(), value);
    }

    pub fn get(&self, tag: &str) -> Option<bool> {
        self.tags.get(tag).copied()
    }

    pub fn is_true(&self, tag: &str) -> bool {
        self.get(tag).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Persisted record: tags first, then the candidate fields, in one flat object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedRecord {
    #[serde(flatten)]
    pub classification: ClassificationResult,
    #[serde(flatten)]
    pub candidate: Candidate,
}

impl ClassifiedRecord {
    pub fn new(candidate: Candidate, classification: ClassificationResult) -> Self {
        Self {
            classification,
            candidate,
        }
    }

    pub fn full_name(&self) -> &str {
        &self.candidate.full_name
    }
}

/// Named output partition of classified candidates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bin {
    pub name: String,
    pub records: Vec<ClassifiedRecord>,
}

impl Bin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Vec::new(),
        }
    }

    pub fn contains(&self, full_name: &str) -> bool {
        self.records.iter().any(|r| r.full_name() == full_name)
    }

    /// Appends unless a record with the same full name is already present.
    pub fn push(&mut self, record: ClassifiedRecord) -> bool {
        if self.contains(record.full_name()) {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Every bin of one run, kept in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BinSet {
    bins: Vec<Bin>,
}

impl BinSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::default();
        for name in names {
            let name = name.into();
            if set.get(&name).is_none() {
                set.bins.push(Bin::new(name));
            }
        }
        set
    }

    pub fn get(&self, name: &str) -> Option<&Bin> {
        self.bins.iter().find(|b| b.name == name)
    }

    /// Appends to the named bin, creating it at the end if it was never declared.
    pub fn push(&mut self, bin_name: &str, record: ClassifiedRecord) -> bool {
        if let Some(bin) = self.bins.iter_mut().find(|b| b.name == bin_name) {
            return bin.push(record);
        }
        let mut bin = Bin::new(bin_name);
        bin.push(record);
        self.bins.push(bin);
        true
    }

    pub fn bins(&self) -> &[Bin] {
        &self.bins
    }

    pub fn into_bins(self) -> Vec<Bin> {
        self.bins
    }

    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.bins.iter().map(|b| (b.name.clone(), b.len())).collect()
    }
}

/// Remaining call count and window reset time reported with a remote response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSignal {
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Position of the entity-index walk.
///
/// `total_pages` starts unknown, which counts as "at least one more page". It is
/// overwritten by every response, so a result set that shrinks mid-crawl still ends the
/// walk once `page` passes the latest total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    page: u32,
    total_pages: Option<u32>,
}

impl Default for PageCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl PageCursor {
    pub fn new() -> Self {
        Self {
            page: 1,
            total_pages: None,
        }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn total_pages(&self) -> Option<u32> {
        self.total_pages
    }

    pub fn record_total(&mut self, total_pages: u32) {
        self.total_pages = Some(total_pages);
    }

    pub fn advance(&mut self) {
        self.page = self.page.saturating_add(1);
    }

    pub fn has_more(&self) -> bool {
        match self.total_pages {
            Some(total) => self.page <= total,
            None => true,
        }
    }
}

/// Top-level run metadata written next to the profile directories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub last_modified: String,
    pub run_id: Uuid,
    pub profile: String,
    pub min_stars: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub bins: BTreeMap<String, usize>,
}

impl RunMetadata {
    pub fn human_timestamp(at: DateTime<Utc>) -> String {
        at.format("%b %-d, %Y at %-I:%M%P (UTC)").to_string()
    }
}
