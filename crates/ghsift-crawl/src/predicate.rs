//! Named boolean classifiers over a candidate, mostly backed by code-search queries.

use std::sync::Arc;
use std::time::Duration;

use ghsift_core::{Candidate, ClassificationResult};
use ghsift_search::{ContentQuery, SearchError};
use ghsift_storage::Sleeper;
use regex::Regex;
use tracing::debug;

use crate::GuardedOracle;

/// Fixed delays the content index needs on top of the advertised quota.
#[derive(Clone)]
pub struct Pacing {
    sleeper: Arc<dyn Sleeper>,
    subquery_delay: Duration,
}

impl Pacing {
    pub fn new(sleeper: Arc<dyn Sleeper>, subquery_delay: Duration) -> Self {
        Self {
            sleeper,
            subquery_delay,
        }
    }

    pub async fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            self.sleeper.sleep(duration).await;
        }
    }

    async fn before_subquery(&self) {
        self.pause(self.subquery_delay).await;
    }
}

#[derive(Debug, Clone)]
pub enum PredicateKind {
    /// True iff a file with this name exists anywhere in the repository.
    MarkerFile { file_name: String },
    /// True on the first query with a hit at most two path segments deep; otherwise
    /// falls back to a whole-word match on the description when a term is given.
    DeclarationLiteral {
        queries: Vec<ContentQuery>,
        description_term: Option<String>,
    },
    /// Local whole-word match on the description, no remote call.
    FreeText { term: String },
    SingleQuery(ContentQuery),
}

#[derive(Debug, Clone)]
pub struct Predicate {
    pub tag: &'static str,
    pub kind: PredicateKind,
}

impl Predicate {
    pub fn new(tag: &'static str, kind: PredicateKind) -> Self {
        Self { tag, kind }
    }

    pub async fn evaluate(
        &self,
        candidate: &Candidate,
        search: &mut GuardedOracle,
        pacing: &Pacing,
    ) -> Result<bool, SearchError> {
        let repo = candidate.full_name.as_str();
        let matched = match &self.kind {
            PredicateKind::MarkerFile { file_name } => {
                let query = ContentQuery::term(file_name.clone()).in_path();
                search.search_content(&query.render_for(repo)).await?.total_count > 0
            }
            PredicateKind::DeclarationLiteral {
                queries,
                description_term,
            } => {
                let mut hit = false;
                for query in queries {
                    pacing.before_subquery().await;
                    let page = search.search_content(&query.render_for(repo)).await?;
                    if page.total_count > 0
                        && page.items.iter().any(|item| is_shallow_path(&item.path))
                    {
                        hit = true;
                        break;
                    }
                }
                hit || description_term
                    .as_deref()
                    .is_some_and(|term| mentions_word(candidate.description.as_deref(), term))
            }
            PredicateKind::FreeText { term } => {
                mentions_word(candidate.description.as_deref(), term)
            }
            PredicateKind::SingleQuery(query) => {
                search.search_content(&query.render_for(repo)).await?.total_count > 0
            }
        };
        debug!(repo, tag = self.tag, matched, "predicate evaluated");
        Ok(matched)
    }
}

/// Ordered predicates; every one runs for every candidate that reaches classification.
#[derive(Debug, Clone, Default)]
pub struct PredicateSet {
    predicates: Vec<Predicate>,
}

impl PredicateSet {
    pub fn new(predicates: Vec<Predicate>) -> Self {
        Self { predicates }
    }

    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.predicates.iter().map(|p| p.tag)
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub async fn classify(
        &self,
        candidate: &Candidate,
        search: &mut GuardedOracle,
        pacing: &Pacing,
    ) -> Result<ClassificationResult, SearchError> {
        let mut result = ClassificationResult::new();
        for predicate in &self.predicates {
            let matched = predicate.evaluate(candidate, search, pacing).await?;
            result.set(predicate.tag, matched);
        }
        Ok(result)
    }
}

/// Case-insensitive whole-word match. A missing text never matches.
pub fn mentions_word(text: Option<&str>, term: &str) -> bool {
    let Some(text) = text else {
        return false;
    };
    match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term))) {
        Ok(re) => re.is_match(text),
        Err(_) => false,
    }
}

/// At most two `/`-separated segments, i.e. the root or one directory below it.
/// Deeper hits usually belong to vendored or sample subprojects.
pub fn is_shallow_path(path: &str) -> bool {
    path.split('/').count() <= 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_word_match() {
        assert!(mentions_word(Some("LIBRARY"), "library"));
        assert!(mentions_word(
            Some("An Asynchronous HTTP Library for Android"),
            "library"
        ));
        assert!(mentions_word(
            Some("A powerful image downloading and caching library for Android"),
            "library"
        ));
        assert!(!mentions_word(Some("librarybook"), "library"));
        assert!(!mentions_word(Some("a sub-libraryish thing"), "library"));
        assert!(mentions_word(Some("(library)"), "library"));
        assert!(!mentions_word(None, "library"));
        assert!(!mentions_word(Some(""), "library"));
    }

    #[test]
    fn shallow_paths() {
        assert!(is_shallow_path("build.gradle"));
        assert!(is_shallow_path("library/build.gradle"));
        assert!(!is_shallow_path("samples/app/build.gradle"));
        assert!(!is_shallow_path("third_party/lib/project.properties"));
    }
}
