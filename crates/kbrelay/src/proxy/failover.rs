//! Primary/backup credential failover for the completion call
//!
//! Credentials are tried in order with the identical request body. A 429
//! response or a transport failure moves on to the next credential; anything
//! else is final. There is at most one retry and no backoff.

use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use std::env;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::UpstreamConfig;
use crate::error::{RelayError, Result};

/// Which configured credential a call used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSlot {
    Primary,
    Backup,
}

impl CredentialSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSlot::Primary => "primary",
            CredentialSlot::Backup => "backup",
        }
    }
}

impl fmt::Display for CredentialSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary credential plus optional backup
#[derive(Clone)]
pub struct CredentialSet {
    primary: String,
    backup: Option<String>,
}

// Secrets stay out of logs
impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("primary", &"<redacted>")
            .field("backup", &self.backup.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl CredentialSet {
    pub fn new(primary: impl Into<String>, backup: Option<String>) -> Self {
        Self {
            primary: primary.into(),
            backup: backup.filter(|b| !b.trim().is_empty()),
        }
    }

    /// Read credentials from the environment variables named in config.
    pub fn from_env(config: &UpstreamConfig) -> Result<Self> {
        Self::from_lookup(config, |name| env::var(name).ok())
    }

    /// Read credentials through `lookup`, keyed by the variable names in config.
    ///
    /// A missing or empty primary key is a configuration error; a missing
    /// backup just disables failover.
    pub fn from_lookup(
        config: &UpstreamConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let primary = lookup(&config.primary_key_env)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                RelayError::Config(format!(
                    "Missing {} (primary API key)",
                    config.primary_key_env
                ))
            })?;
        let backup = lookup(&config.backup_key_env);

        Ok(Self::new(primary, backup))
    }

    pub fn has_backup(&self) -> bool {
        self.backup.is_some()
    }

    /// Credentials in the order they are tried
    fn ordered(&self) -> Vec<(CredentialSlot, &str)> {
        let mut ordered = vec![(CredentialSlot::Primary, self.primary.as_str())];
        if let Some(backup) = &self.backup {
            ordered.push((CredentialSlot::Backup, backup.as_str()));
        }
        ordered
    }
}

/// Response from the upstream plus which credential produced it
#[derive(Debug)]
pub struct DispatchOutcome {
    pub response: Response,
    pub served_by: CredentialSlot,
    pub attempts: usize,
}

enum AttemptFailure {
    RateLimited(Response),
    Transport(reqwest::Error),
}

/// Sends completion requests, failing over from primary to backup credential
#[derive(Debug, Clone)]
pub struct FailoverDispatcher {
    client: Client,
    endpoint: Url,
    credentials: CredentialSet,
}

impl FailoverDispatcher {
    pub fn new(client: Client, endpoint: Url, credentials: CredentialSet) -> Self {
        Self {
            client,
            endpoint,
            credentials,
        }
    }

    /// Build a dispatcher from upstream config and already-loaded credentials
    pub fn from_config(config: &UpstreamConfig, credentials: CredentialSet) -> Result<Self> {
        let endpoint = Url::parse(&config.url)
            .map_err(|e| RelayError::Config(format!("Invalid upstream URL '{}': {e}", config.url)))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self::new(client, endpoint, credentials))
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn has_backup(&self) -> bool {
        self.credentials.has_backup()
    }

    /// POST `body` to the completion endpoint with failover.
    ///
    /// Returns the upstream response when it succeeded, or when it failed on
    /// the only attempt made (so upstream errors reach the client unchanged).
    /// Fails with `RelayError::UpstreamExhausted` when the backup was tried
    /// and also failed, or when the last credential hit a transport error.
    pub async fn send(&self, body: Bytes) -> Result<DispatchOutcome> {
        let credentials = self.credentials.ordered();
        let total = credentials.len();

        for (idx, (slot, secret)) in credentials.into_iter().enumerate() {
            let attempts = idx + 1;
            let has_next = attempts < total;

            let failure = match self.attempt(secret, body.clone()).await {
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    AttemptFailure::RateLimited(response)
                }
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || attempts == 1 {
                        info!(credential = %slot, %status, attempts, "Upstream request served");
                        return Ok(DispatchOutcome {
                            response,
                            served_by: slot,
                            attempts,
                        });
                    }
                    return Err(exhausted_from_response(slot, response).await);
                }
                Err(e) => AttemptFailure::Transport(e),
            };

            match failure {
                AttemptFailure::RateLimited(response) if has_next => {
                    warn!(credential = %slot, "Upstream rate limited, failing over");
                    // Drain so the connection can be reused
                    let _ = response.bytes().await;
                }
                AttemptFailure::RateLimited(response) => {
                    if attempts == 1 {
                        info!(credential = %slot, "Upstream rate limited, no backup configured");
                        return Ok(DispatchOutcome {
                            response,
                            served_by: slot,
                            attempts,
                        });
                    }
                    return Err(exhausted_from_response(slot, response).await);
                }
                AttemptFailure::Transport(e) if has_next => {
                    warn!(credential = %slot, "Upstream transport failure, failing over: {e}");
                }
                AttemptFailure::Transport(e) => {
                    return Err(RelayError::UpstreamExhausted {
                        status: None,
                        reason: format!("{slot} credential: {}", describe_transport_error(&e)),
                    });
                }
            }
        }

        Err(RelayError::UpstreamExhausted {
            status: None,
            reason: "no credentials configured".to_string(),
        })
    }

    async fn attempt(&self, secret: &str, body: Bytes) -> std::result::Result<Response, reqwest::Error> {
        debug!(endpoint = %self.endpoint, "Sending upstream completion request");
        self.client
            .post(self.endpoint.clone())
            .bearer_auth(secret)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
    }
}

async fn exhausted_from_response(slot: CredentialSlot, response: Response) -> RelayError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    warn!(credential = %slot, %status, "Upstream failed after failover");

    let detail = body.trim();
    let reason = if detail.is_empty() {
        format!("{slot} credential returned {status}")
    } else {
        format!("{slot} credential returned {status}: {detail}")
    };

    RelayError::UpstreamExhausted {
        status: Some(status.as_u16()),
        reason,
    }
}

fn describe_transport_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("request timed out: {e}")
    } else if e.is_connect() {
        format!("failed to connect to upstream: {e}")
    } else {
        format!("request failed: {e}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_credential_order() {
        let set = CredentialSet::new("p", Some("b".to_string()));
        let order: Vec<CredentialSlot> = set.ordered().into_iter().map(|(s, _)| s).collect();
        assert_eq!(order, vec![CredentialSlot::Primary, CredentialSlot::Backup]);
    }

    #[test]
    fn test_blank_backup_disables_failover() {
        let set = CredentialSet::new("p", Some("  ".to_string()));
        assert!(!set.has_backup());
        assert_eq!(set.ordered().len(), 1);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let set = CredentialSet::new("sk-secret", Some("sk-other".to_string()));
        let printed = format!("{set:?}");
        assert!(!printed.contains("sk-secret"));
        assert!(!printed.contains("sk-other"));
    }

    fn key_config() -> UpstreamConfig {
        UpstreamConfig {
            primary_key_env: "MAIN_KEY".to_string(),
            backup_key_env: "SPARE_KEY".to_string(),
            ..UpstreamConfig::default()
        }
    }

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_from_env_requires_primary() {
        let config = UpstreamConfig {
            primary_key_env: "KBRELAY_TEST_MISSING_PRIMARY".to_string(),
            backup_key_env: "KBRELAY_TEST_MISSING_BACKUP".to_string(),
            ..UpstreamConfig::default()
        };
        let err = CredentialSet::from_env(&config).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
        assert!(err.to_string().contains("KBRELAY_TEST_MISSING_PRIMARY"));
    }

    #[test]
    fn test_from_lookup_reads_both_keys() {
        let lookup = lookup_from(&[("MAIN_KEY", "sk-primary"), ("SPARE_KEY", "sk-backup")]);
        let set = CredentialSet::from_lookup(&key_config(), lookup).unwrap();
        assert!(set.has_backup());
        assert_eq!(
            set.ordered(),
            vec![
                (CredentialSlot::Primary, "sk-primary"),
                (CredentialSlot::Backup, "sk-backup")
            ]
        );
    }

    #[test]
    fn test_from_lookup_blank_values() {
        let err = CredentialSet::from_lookup(&key_config(), lookup_from(&[("MAIN_KEY", "  ")]))
            .unwrap_err();
        assert!(err.to_string().contains("MAIN_KEY"));

        let lookup = lookup_from(&[("MAIN_KEY", "sk-primary"), ("SPARE_KEY", "")]);
        let set = CredentialSet::from_lookup(&key_config(), lookup).unwrap();
        assert!(!set.has_backup());
    }

    #[test]
    fn test_from_config_rejects_bad_url() {
        let config = UpstreamConfig {
            url: "not a url".to_string(),
            ..UpstreamConfig::default()
        };
        let result = FailoverDispatcher::from_config(&config, CredentialSet::new("p", None));
        assert!(matches!(result, Err(RelayError::Config(_))));
    }
}
