//! Keyword-frequency retrieval
//!
//! Scores each record by how often the query's keywords occur in its
//! lower-cased text and keeps the best `limit`. This is a cheap, deterministic
//! recall step whose job is to keep the attached context bounded; it is not
//! semantic search.

use crate::knowledge::types::{Record, ScoredRecord};

/// Default number of records kept per dataset
pub const DEFAULT_LIMIT: usize = 10;

/// Ranks records against a free-text query
#[derive(Debug, Clone, Copy)]
pub struct RelevanceRetriever {
    limit: usize,
}

impl Default for RelevanceRetriever {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT)
    }
}

impl RelevanceRetriever {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Rank `records` against `query`, keeping at most `limit`.
    ///
    /// Never fails: an empty or whitespace-only query, or a query whose
    /// keywords match nothing, yields an empty result.
    pub fn retrieve(&self, records: &[Record], query: &str) -> Vec<ScoredRecord> {
        retrieve(records, query, self.limit)
    }
}

/// Split a query into lower-cased keywords longer than one character
pub fn tokenize(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|token| token.chars().count() > 1)
        .collect()
}

/// Sum of literal occurrences of each token in `text`
pub fn score_text(text: &str, tokens: &[String]) -> u32 {
    tokens
        .iter()
        .map(|token| text.matches(token.as_str()).count() as u32)
        .sum()
}

/// Rank `records` against `query` and return the top `limit`.
///
/// Ties keep the original dataset order.
pub fn retrieve(records: &[Record], query: &str, limit: usize) -> Vec<ScoredRecord> {
    let tokens = tokenize(query);
    if tokens.is_empty() || limit == 0 {
        return Vec::new();
    }

    let mut scored: Vec<(usize, u32)> = records
        .iter()
        .enumerate()
        .map(|(idx, record)| (idx, score_text(&record.search_text(), &tokens)))
        .filter(|(_, score)| *score > 0)
        .collect();

    // sort_by is stable, so equal scores stay in dataset order
    scored.sort_by(|a, b| b.1.cmp(&a.1));
    scored.truncate(limit);

    scored
        .into_iter()
        .map(|(idx, score)| ScoredRecord {
            record: records[idx].clone(),
            score,
        })
        .collect()
}
