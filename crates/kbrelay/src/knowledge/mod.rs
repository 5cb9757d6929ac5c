//! Knowledge base: external datasets, their cache, and keyword retrieval

pub mod cache;
pub mod links;
pub mod retrieval;
pub mod source;
pub mod types;

pub use cache::RefreshableCache;
pub use links::LinkTitleResolver;
pub use retrieval::{RelevanceRetriever, retrieve, tokenize};
pub use source::{HttpKnowledgeSource, KnowledgeSource, flatten_groups};
pub use types::{CacheEntry, CacheLookup, CacheOutcome, Record, ScoredRecord};
