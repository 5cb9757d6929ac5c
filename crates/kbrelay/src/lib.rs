//! kbrelay - knowledge-grounded chat completion relay
//!
//! Accepts a chat conversation, attaches the most relevant records from a
//! cached external knowledge base as a system prompt, forwards the request to
//! an OpenAI-compatible provider with primary/backup credential failover, and
//! sanitizes the streamed reply before returning it.

pub mod config;
pub mod error;
pub mod knowledge;
pub mod proxy;
pub mod testing;

pub use error::RelayError;
