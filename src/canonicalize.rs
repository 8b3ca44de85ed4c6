//! Query canonicalization
//!
//! Collapses the many phrasings of the same question ("Explain gravity!",
//! "  gravity?? ") into one stable topic string that the cache keys on.
//! The group key is used verbatim for lookups - no hashing - so any change
//! to this logic silently invalidates every existing cache entry.

use crate::schema::Level;
use serde::{Deserialize, Serialize};

/// Version tag for the content schema. Bumping it deliberately invalidates
/// all existing cache entries.
pub const STRUCTURE_VERSION: &str = "v1";

/// Conversational lead-ins stripped from queries, in match order.
/// Exactly one prefix is stripped per query - first match wins.
const CLEANUP_PREFIXES: [&str; 6] = [
    "i'm interested in learning more about",
    "i am interested in learning more about",
    "i want to learn about",
    "teach me about",
    "explain",
    "explain to me",
];

/// Stable identity derived from a raw query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalQuery {
    pub canonical_topic: String,
    pub canonical_key: String,
}

/// Normalize a raw query into a canonical topic and key fragment.
pub fn canonicalize(raw_query: &str) -> CanonicalQuery {
    let normalized = raw_query
        .trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(['?', '.', '!'])
        .to_lowercase();

    let without_prefix = CLEANUP_PREFIXES
        .iter()
        .find_map(|prefix| normalized.strip_prefix(prefix))
        .map(str::trim)
        .unwrap_or(&normalized);

    let canonical_topic = if without_prefix.is_empty() {
        normalized.clone()
    } else {
        without_prefix.to_string()
    };

    let canonical_key = canonical_topic
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == ' ' || *c == '-')
        .collect::<String>()
        .trim()
        .to_string();

    CanonicalQuery {
        canonical_topic,
        canonical_key,
    }
}

/// Composite cache key: `canonicalTopic|level|structureVersion`.
pub fn build_group_key(canonical_topic: &str, level: Level, structure_version: &str) -> String {
    format!("{}|{}|{}", canonical_topic, level.as_str(), structure_version)
}
