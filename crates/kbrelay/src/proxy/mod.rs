mod error;
pub mod failover;
pub mod prompt;
pub mod request;
pub mod sanitizer;
mod server;

pub use error::{ProxyError, create_error_response};
pub use failover::{CredentialSet, CredentialSlot, DispatchOutcome, FailoverDispatcher};
pub use prompt::{DatasetSection, build_system_prompt, format_knowledge_block, resolve_link_titles};
pub use request::{ChatMessage, CompletionRequest, RelayRequest};
pub use sanitizer::{
    DONE_SENTINEL, MAX_LINE_BYTES, ProviderError, SanitizedStream, SanitizerState,
    SanitizerStats, StreamFrame, StreamSanitizer, UnrecognizedReason, classify_line,
};
pub use server::{AppState, RelayServer, apply_cors, create_router};
