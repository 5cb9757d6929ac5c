//! HTTP relay server
//!
//! One endpoint accepts a chat request, grounds it in the knowledge base and
//! forwards it to the completion provider:
//! - `OPTIONS` answers the CORS preflight
//! - any other non-POST method is rejected
//! - streaming responses pass through the stream sanitizer
//! - `GET /health` reports liveness

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode},
    routing::{any, get},
};
use bytes::Bytes;
use futures::future::try_join_all;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::knowledge::{
    HttpKnowledgeSource, KnowledgeSource, LinkTitleResolver, RefreshableCache, RelevanceRetriever,
};

use super::error::ProxyError;
use super::failover::{CredentialSet, FailoverDispatcher};
use super::prompt::{DatasetSection, build_system_prompt, format_knowledge_block, resolve_link_titles};
use super::request::RelayRequest;
use super::sanitizer::SanitizedStream;

/// Headers that are not copied from the upstream response
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
    "content-length",
];

const CORS_HEADERS: [(&str, &str); 3] = [
    ("access-control-allow-origin", "*"),
    ("access-control-allow-methods", "GET, POST, OPTIONS"),
    ("access-control-allow-headers", "Content-Type, Authorization"),
];

/// Shared application state for all handlers
pub struct AppState {
    pub config: Config,
    pub cache: Arc<RefreshableCache>,
    pub retriever: RelevanceRetriever,
    /// `None` when the primary credential is missing; requests then fail
    /// with a configuration error
    pub dispatcher: Option<Arc<FailoverDispatcher>>,
    pub link_resolver: Option<LinkTitleResolver>,
}

impl AppState {
    pub fn new(
        config: Config,
        cache: Arc<RefreshableCache>,
        dispatcher: Option<Arc<FailoverDispatcher>>,
        link_resolver: Option<LinkTitleResolver>,
    ) -> Self {
        let retriever = RelevanceRetriever::new(config.retrieval.limit);
        Self {
            config,
            cache,
            retriever,
            dispatcher,
            link_resolver,
        }
    }

    /// Wire up the HTTP knowledge source, cache and dispatcher from config.
    ///
    /// A mode that names an undeclared dataset is rejected. A missing primary
    /// credential is logged, not returned: the server still starts and answers
    /// relay requests with `configuration_error`.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let source: Arc<dyn KnowledgeSource> = Arc::new(HttpKnowledgeSource::new(&config.knowledge)?);
        let cache = Arc::new(RefreshableCache::from_config(source, &config.knowledge));

        let dispatcher = match CredentialSet::from_env(&config.upstream) {
            Ok(credentials) => {
                if !credentials.has_backup() {
                    info!(
                        "No backup credential in {}; failover disabled",
                        config.upstream.backup_key_env
                    );
                }
                Some(Arc::new(FailoverDispatcher::from_config(
                    &config.upstream,
                    credentials,
                )?))
            }
            Err(e) => {
                error!("{e}; relay requests will fail until it is set");
                None
            }
        };

        let link_resolver = if config.links.resolve_titles {
            Some(LinkTitleResolver::new(&config.links)?)
        } else {
            None
        };

        Ok(Self::new(config, cache, dispatcher, link_resolver))
    }
}

/// The relay server
pub struct RelayServer {
    state: Arc<AppState>,
}

impl RelayServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Bind the configured address and serve until Ctrl+C or SIGTERM
    pub async fn serve(&self) -> Result<()> {
        let addr: SocketAddr = self
            .state
            .config
            .server
            .listen_addr
            .parse()
            .map_err(|e| RelayError::Config(format!("Invalid listen address: {e}")))?;

        let datasets: Vec<&str> = self
            .state
            .config
            .knowledge
            .datasets
            .iter()
            .map(|d| d.id.as_str())
            .collect();
        info!("Starting relay server on {addr}");
        info!("Knowledge datasets: {}", datasets.join(", "));
        if let Some(dispatcher) = &self.state.dispatcher {
            info!(
                backup = dispatcher.has_backup(),
                "Upstream endpoint: {}",
                dispatcher.endpoint()
            );
        }

        let app = create_router(self.state.clone());
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Proxy(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| RelayError::Proxy(format!("Server error: {e}")))?;

        info!("Relay server shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/", any(relay_handler))
        .fallback(relay_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn relay_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response<Body> {
    let span = info_span!("relay", request_id = %Uuid::new_v4(), method = %request.method());
    async move {
        match relay(&state, request).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }
    .instrument(span)
    .await
}

async fn relay(state: &AppState, request: Request<Body>) -> std::result::Result<Response<Body>, ProxyError> {
    let method = request.method().clone();
    if method == Method::OPTIONS {
        return Ok(preflight_response());
    }
    if method != Method::POST {
        return Err(ProxyError::MethodNotAllowed(method.to_string()));
    }

    let dispatcher = state.dispatcher.as_ref().ok_or_else(|| {
        ProxyError::Configuration(format!("Missing {}", state.config.upstream.primary_key_env))
    })?;

    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| ProxyError::InvalidRequest(format!("Failed to read request body: {e}")))?;
    let relay_request: RelayRequest = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(format!("Invalid request body: {e}")))?;

    let (mode, mode_config) = state.config.resolve_mode(relay_request.mode.as_deref());
    let query = relay_request.latest_user_query().unwrap_or_default();
    debug!(%mode, datasets = ?mode_config.datasets, "Grounding request");

    let sections = gather_sections(state, &mode_config.datasets, &query).await?;
    let titles = match &state.link_resolver {
        Some(resolver) => resolve_link_titles(&sections, resolver).await,
        None => HashMap::new(),
    };
    let knowledge_block = format_knowledge_block(&sections, &titles);
    let system_prompt = build_system_prompt(&mode_config.instructions, &knowledge_block);

    let completion = relay_request.into_completion(system_prompt, &state.config.upstream.defaults);
    let streaming = completion.stream;
    let payload = Bytes::from(serde_json::to_vec(&completion).map_err(|e| {
        ProxyError::Internal(format!("Failed to serialize completion request: {e}"))
    })?);

    let outcome = dispatcher.send(payload).await?;
    info!(
        served_by = %outcome.served_by,
        attempts = outcome.attempts,
        status = %outcome.response.status(),
        "Relaying upstream response"
    );

    Ok(relay_response(outcome.response, streaming))
}

/// Fetch and rank records for every dataset of the mode
async fn gather_sections(
    state: &AppState,
    datasets: &[String],
    query: &str,
) -> std::result::Result<Vec<DatasetSection>, ProxyError> {
    let lookups = try_join_all(datasets.iter().map(|dataset| state.cache.get(dataset))).await?;

    Ok(datasets
        .iter()
        .zip(lookups)
        .map(|(dataset, lookup)| {
            let records = state.retriever.retrieve(&lookup.records, query);
            debug!(
                %dataset,
                outcome = ?lookup.outcome,
                total = lookup.records.len(),
                selected = records.len(),
                "Retrieved records"
            );
            DatasetSection {
                dataset: dataset.clone(),
                records,
            }
        })
        .collect())
}

/// Copy status and headers from upstream, then attach the body.
///
/// Successful streaming responses are sanitized; everything else is passed
/// through byte for byte.
fn relay_response(upstream: reqwest::Response, streaming: bool) -> Response<Body> {
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers().iter() {
        let name_str = name.as_str().to_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&name_str.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }
    apply_cors(&mut headers);

    let body = if streaming && status.is_success() {
        Body::from_stream(SanitizedStream::new(Box::pin(upstream.bytes_stream())))
    } else {
        if !status.is_success() {
            warn!(%status, "Passing upstream error through");
        }
        Body::from_stream(upstream.bytes_stream())
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn preflight_response() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    apply_cors(response.headers_mut());
    response
}

/// Insert the CORS headers sent with every relay response
pub fn apply_cors(headers: &mut HeaderMap) {
    for (name, value) in CORS_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSource;
    use axum::http::Request;
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state(dispatcher: Option<Arc<FailoverDispatcher>>) -> Arc<AppState> {
        let source = Arc::new(ScriptedSource::always(vec![json!({"topic": "ocean"})]));
        let cache = Arc::new(RefreshableCache::new(source, Duration::from_secs(60)));
        Arc::new(AppState::new(Config::default(), cache, dispatcher, None))
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_from_config_rejects_mode_with_undeclared_dataset() {
        let mut config = Config::default();
        config.modes.insert(
            "PARENT".to_string(),
            crate::config::ModeConfig {
                datasets: vec!["parent-guide".to_string()],
                instructions: String::new(),
            },
        );

        let err = AppState::from_config(config).err().expect("config should be rejected");
        assert!(matches!(err, RelayError::Config(ref m) if m.contains("parent-guide")));
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_router(test_state(None));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("\"status\":\"ok\""));
    }

    #[tokio::test]
    async fn test_preflight_returns_cors_headers() {
        let app = create_router(test_state(None));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
        assert_eq!(
            headers.get("access-control-allow-methods").unwrap(),
            "GET, POST, OPTIONS"
        );
        assert_eq!(
            headers.get("access-control-allow-headers").unwrap(),
            "Content-Type, Authorization"
        );
        assert!(body_string(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_get_is_rejected() {
        let app = create_router(test_state(None));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(response.headers().contains_key("access-control-allow-origin"));
        assert!(body_string(response).await.contains("method_not_allowed"));
    }

    #[tokio::test]
    async fn test_missing_credential_is_configuration_error() {
        let app = create_router(test_state(None));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .body(Body::from(r#"{"conversation_history":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_string(response).await;
        assert!(body.contains("configuration_error"));
        assert!(body.contains("OPENROUTER_API_KEY"));
    }

    #[tokio::test]
    async fn test_invalid_json_is_rejected() {
        let dispatcher = FailoverDispatcher::new(
            reqwest::Client::new(),
            url::Url::parse("http://127.0.0.1:9/v1/chat/completions").unwrap(),
            CredentialSet::new("p", None),
        );
        let app = create_router(test_state(Some(Arc::new(dispatcher))));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("invalid_request"));
    }

    #[test]
    fn test_apply_cors_overwrites_existing() {
        let mut headers = HeaderMap::new();
        headers.insert("access-control-allow-origin", HeaderValue::from_static("https://x"));
        apply_cors(&mut headers);
        assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    }

    #[test]
    fn test_hop_by_hop_headers_defined() {
        for name in ["connection", "keep-alive", "transfer-encoding", "content-length", "upgrade"] {
            assert!(HOP_BY_HOP_HEADERS.contains(&name));
        }
    }
}
