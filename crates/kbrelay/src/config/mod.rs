use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{RelayError, Result};

/// Main configuration structure for kbrelay
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Completion provider configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Knowledge base datasets and cache settings
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    /// Keyword retrieval settings
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Link title resolution settings
    #[serde(default)]
    pub links: LinksConfig,
    /// Mode used when a request names no mode or an unknown one
    #[serde(default = "default_mode_name")]
    pub default_mode: String,
    /// Instruction template and datasets per request mode
    #[serde(default = "default_modes")]
    pub modes: HashMap<String, ModeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            knowledge: KnowledgeConfig::default(),
            retrieval: RetrievalConfig::default(),
            links: LinksConfig::default(),
            default_mode: default_mode_name(),
            modes: default_modes(),
        }
    }
}

impl Config {
    /// Read and parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            RelayError::Config(format!("Failed to parse config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross references between sections.
    ///
    /// Every dataset id a mode searches must be declared under
    /// `[[knowledge.datasets]]`.
    pub fn validate(&self) -> Result<()> {
        let mut names: Vec<&String> = self.modes.keys().collect();
        names.sort();

        for name in names {
            for dataset in &self.modes[name].datasets {
                if !self.knowledge.datasets.iter().any(|d| &d.id == dataset) {
                    return Err(RelayError::Config(format!(
                        "Mode '{name}' uses dataset '{dataset}', which is not declared in [[knowledge.datasets]]"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve a request's mode selector to a configured mode.
    ///
    /// Lookup is case-insensitive. Falls back to `default_mode`, and to a
    /// mode with no datasets if even that is missing.
    pub fn resolve_mode(&self, requested: Option<&str>) -> (String, ModeConfig) {
        let find = |name: &str| {
            self.modes
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(key, mode)| (key.clone(), mode.clone()))
        };

        if let Some(found) = requested.and_then(find) {
            return found;
        }
        if let Some(name) = requested {
            tracing::debug!("Unknown mode '{name}', using default '{}'", self.default_mode);
        }
        find(&self.default_mode).unwrap_or_else(|| (self.default_mode.clone(), ModeConfig::default()))
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8787")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8787".to_string()
}

/// Completion provider configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Chat completion endpoint
    #[serde(default = "default_upstream_url")]
    pub url: String,
    /// Environment variable holding the primary API key (required)
    #[serde(default = "default_primary_key_env")]
    pub primary_key_env: String,
    /// Environment variable holding the backup API key (optional)
    #[serde(default = "default_backup_key_env")]
    pub backup_key_env: String,
    /// Request timeout in seconds
    #[serde(default = "default_upstream_timeout_secs")]
    pub timeout_secs: u64,
    /// Values applied when the inbound request omits them
    #[serde(default)]
    pub defaults: RequestDefaults,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            primary_key_env: default_primary_key_env(),
            backup_key_env: default_backup_key_env(),
            timeout_secs: default_upstream_timeout_secs(),
            defaults: RequestDefaults::default(),
        }
    }
}

fn default_upstream_url() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}

fn default_primary_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_backup_key_env() -> String {
    "OPENROUTER_API_KEY_BACKUP".to_string()
}

fn default_upstream_timeout_secs() -> u64 {
    300
}

/// Completion parameters used when the caller leaves them out
#[derive(Debug, Clone, Deserialize)]
pub struct RequestDefaults {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            stream: default_stream(),
        }
    }
}

fn default_model() -> String {
    "openai/gpt-oss-20b:free".to_string()
}

fn default_temperature() -> f64 {
    0.4
}

fn default_top_p() -> f64 {
    0.9
}

fn default_max_tokens() -> u32 {
    1500
}

fn default_stream() -> bool {
    true
}

/// Knowledge base configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeConfig {
    /// Freshness window for datasets that don't set their own
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Timeout for a single knowledge source fetch
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Configured datasets
    #[serde(default)]
    pub datasets: Vec<DatasetConfig>,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            datasets: Vec::new(),
        }
    }
}

impl KnowledgeConfig {
    /// TTL for a dataset, falling back to the default
    pub fn ttl_for(&self, dataset: &str) -> Duration {
        let secs = self
            .datasets
            .iter()
            .find(|d| d.id == dataset)
            .and_then(|d| d.ttl_secs)
            .unwrap_or(self.default_ttl_secs);
        Duration::from_secs(secs)
    }
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

/// A single knowledge dataset
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    /// Dataset identifier referenced by modes
    pub id: String,
    /// URL returning `{ group: [record, ...] }`
    pub url: String,
    /// Per-dataset freshness window in seconds
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Keyword retrieval configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    /// Maximum records attached per dataset
    #[serde(default = "default_retrieval_limit")]
    pub limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            limit: default_retrieval_limit(),
        }
    }
}

fn default_retrieval_limit() -> usize {
    10
}

/// Link title resolution configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LinksConfig {
    /// Replace bare URLs in attached records with `[title](url)`
    #[serde(default)]
    pub resolve_titles: bool,
    /// Per-lookup timeout in milliseconds
    #[serde(default = "default_link_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LinksConfig {
    fn default() -> Self {
        Self {
            resolve_titles: false,
            timeout_ms: default_link_timeout_ms(),
        }
    }
}

fn default_link_timeout_ms() -> u64 {
    3000
}

/// Request mode: which instructions to send and which datasets to search
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModeConfig {
    /// Dataset ids searched for this mode
    #[serde(default)]
    pub datasets: Vec<String>,
    /// System instructions placed before the knowledge block
    #[serde(default)]
    pub instructions: String,
}

fn default_mode_name() -> String {
    "STUDENT".to_string()
}

fn default_modes() -> HashMap<String, ModeConfig> {
    let mut modes = HashMap::new();
    modes.insert(
        default_mode_name(),
        ModeConfig {
            datasets: Vec::new(),
            instructions: "You are a friendly tutor. Answer using the knowledge base below. \
                If the answer is not in the knowledge base, say so instead of guessing."
                .to_string(),
        },
    );
    modes
}
