//! Link title lookup for URL-valued record fields
//!
//! Each lookup is time-boxed. A lookup that times out, fails, or finds no
//! `<title>` falls back to the URL itself, so callers always get a label.

use futures::StreamExt;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::config::LinksConfig;
use crate::error::{RelayError, Result};

/// Upper bound on how much of a page is scanned for `<title>`
const MAX_TITLE_SCAN_BYTES: usize = 64 * 1024;

/// Resolves a page's display title with a short timeout
#[derive(Debug, Clone)]
pub struct LinkTitleResolver {
    client: Client,
    timeout: Duration,
}

impl LinkTitleResolver {
    pub fn new(config: &LinksConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client, Duration::from_millis(config.timeout_ms)))
    }

    pub fn with_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Title of the page at `url`, or `url` itself when it can't be found in time
    pub async fn resolve(&self, url: &str) -> String {
        match tokio::time::timeout(self.timeout, self.fetch_title(url)).await {
            Ok(Some(title)) => title,
            Ok(None) => url.to_string(),
            Err(_) => {
                debug!(%url, timeout_ms = self.timeout.as_millis() as u64, "Link title lookup timed out");
                url.to_string()
            }
        }
    }

    async fn fetch_title(&self, url: &str) -> Option<String> {
        let response = match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(%url, status = %response.status(), "Link title lookup got error status");
                return None;
            }
            Err(e) => {
                debug!(%url, "Link title lookup failed: {e}");
                return None;
            }
        };

        // Read only as much of the body as the scan needs
        let mut scanned = Vec::new();
        let mut body = response.bytes_stream();
        while scanned.len() < MAX_TITLE_SCAN_BYTES {
            match body.next().await {
                Some(Ok(chunk)) => scanned.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    debug!(%url, "Link title body read failed: {e}");
                    break;
                }
                None => break,
            }
        }
        scanned.truncate(MAX_TITLE_SCAN_BYTES);

        extract_title(&String::from_utf8_lossy(&scanned))
    }
}

/// Whether `value` looks like an absolute http(s) link
pub fn is_link(value: &str) -> bool {
    let trimmed = value.trim();
    (trimmed.starts_with("http://") || trimmed.starts_with("https://"))
        && !trimmed.contains(char::is_whitespace)
}

/// Text of the first `<title>` element, whitespace-collapsed
pub fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let content_start = open + lower[open..].find('>')? + 1;
    let content_end = content_start + lower[content_start..].find("</title")?;

    let title = html[content_start..content_end]
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if title.is_empty() { None } else { Some(title) }
}
