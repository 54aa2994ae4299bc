//! Built-in crawl profiles: the repository query, the relevance gate, the predicates and
//! the bins they feed.

use ghsift_core::ClassificationResult;
use ghsift_search::{ContentQuery, EntityQuery};
use thiserror::Error;

use crate::predicate::{Predicate, PredicateKind, PredicateSet};

pub const PROFILE_NAMES: &[&str] = &["android", "polymer"];

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("unknown crawl profile {name:?} (supported: {supported})")]
    Unknown { name: String, supported: String },
}

/// How a retained candidate picks its single primary bin.
#[derive(Debug, Clone)]
pub enum PrimaryBin {
    Fixed(&'static str),
    Split {
        tag: &'static str,
        when_true: &'static str,
        when_false: &'static str,
    },
}

/// Extra bin joined whenever the tag is true.
#[derive(Debug, Clone)]
pub struct Overlay {
    pub tag: &'static str,
    pub bin: &'static str,
}

#[derive(Debug, Clone)]
pub struct CrawlProfile {
    pub name: &'static str,
    pub search_term: &'static str,
    pub gate: Predicate,
    pub predicates: PredicateSet,
    pub primary: PrimaryBin,
    pub overlays: Vec<Overlay>,
}

impl CrawlProfile {
    pub fn entity_query(&self, min_stars: u32) -> EntityQuery {
        EntityQuery::new(self.search_term, min_stars)
    }

    /// Every bin the profile can fill, in output order.
    pub fn bin_names(&self) -> Vec<&'static str> {
        let mut names = match &self.primary {
            PrimaryBin::Fixed(bin) => vec![*bin],
            PrimaryBin::Split {
                when_true,
                when_false,
                ..
            } => vec![*when_false, *when_true],
        };
        names.extend(self.overlays.iter().map(|o| o.bin));
        names
    }

    /// Exactly one primary bin, then one bin per true overlay tag.
    pub fn bins_for(&self, result: &ClassificationResult) -> Vec<&'static str> {
        let mut bins = vec![match &self.primary {
            PrimaryBin::Fixed(bin) => *bin,
            PrimaryBin::Split {
                tag,
                when_true,
                when_false,
            } => {
                if result.is_true(tag) {
                    *when_true
                } else {
                    *when_false
                }
            }
        }];
        for overlay in &self.overlays {
            if result.is_true(overlay.tag) && !bins.contains(&overlay.bin) {
                bins.push(overlay.bin);
            }
        }
        bins
    }
}

pub fn profile_by_name(name: &str) -> Result<CrawlProfile, ProfileError> {
    match name {
        "android" => Ok(android()),
        "polymer" => Ok(polymer()),
        other => Err(ProfileError::Unknown {
            name: other.to_string(),
            supported: PROFILE_NAMES.join(", "),
        }),
    }
}

fn gradle_literal(text: &str) -> ContentQuery {
    ContentQuery::literal(text)
        .extension("gradle")
        .language("groovy")
}

/// Android projects, split into apps and libraries, with Android L and Wear overlays.
pub fn android() -> CrawlProfile {
    CrawlProfile {
        name: "android",
        search_term: "android",
        gate: Predicate::new(
            "android",
            PredicateKind::MarkerFile {
                file_name: "androidmanifest.xml".to_string(),
            },
        ),
        predicates: PredicateSet::new(vec![
            Predicate::new(
                "library",
                PredicateKind::DeclarationLiteral {
                    queries: vec![
                        gradle_literal("android-library"),
                        ContentQuery::literal("android.library=true").language("ini"),
                    ],
                    description_term: Some("library".to_string()),
                },
            ),
            Predicate::new(
                "android_l",
                PredicateKind::SingleQuery(gradle_literal("compileSdkVersion android-l")),
            ),
            Predicate::new(
                "wearable",
                PredicateKind::SingleQuery(gradle_literal("com.google.android.support:wearable")),
            ),
        ]),
        primary: PrimaryBin::Split {
            tag: "library",
            when_true: "lib_repos",
            when_false: "repos",
        },
        overlays: vec![
            Overlay {
                tag: "android_l",
                bin: "l_repos",
            },
            Overlay {
                tag: "wearable",
                bin: "wear_repos",
            },
        ],
    }
}

/// Polymer web-component projects; one bin, no secondary tags.
pub fn polymer() -> CrawlProfile {
    CrawlProfile {
        name: "polymer",
        search_term: "polymer",
        gate: Predicate::new(
            "polymer",
            PredicateKind::SingleQuery(
                ContentQuery::literal("platform.js")
                    .extension("html")
                    .language("html"),
            ),
        ),
        predicates: PredicateSet::default(),
        primary: PrimaryBin::Fixed("repos"),
        overlays: Vec::new(),
    }
}
