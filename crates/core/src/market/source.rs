use crate::market::symbol::MarketClass;
use crate::market::types::{DateRange, PriceSeries};
use anyhow::{Context, Result};
use reqwest::StatusCode;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRIES: u32 = 2;
const MAX_BACKOFF_SECS: u64 = 30;
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) finagent/0.1";

/// One market-data provider in the resolver's fallback chain.
///
/// `Ok(None)` and `Ok(Some(empty))` both mean "no data"; the resolver treats them
/// exactly like `Err` and moves on to the next source.
#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prefix placed in front of a successful report.
    fn label(&self) -> &'static str;

    fn applies_to(&self, class: MarketClass) -> bool {
        let _ = class;
        true
    }

    async fn attempt(&self, symbol: &str, range: &DateRange) -> Result<Option<PriceSeries>>;
}

/// HTTP plumbing shared by the providers.
#[derive(Debug, Clone)]
pub(crate) struct HttpFetcher {
    http: reqwest::Client,
    retries: u32,
}

impl HttpFetcher {
    pub(crate) fn from_env() -> Result<Self> {
        let timeout_secs = std::env::var("MARKET_DATA_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let retries = std::env::var("MARKET_DATA_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RETRIES)
            .max(1);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build market data http client")?;

        Ok(Self { http, retries })
    }

    /// Sends the request built by `build`, retrying transport failures, 429 and 5xx
    /// with exponential backoff. Returns the body of the first successful response.
    pub(crate) async fn send_text<F>(&self, source: &'static str, build: F) -> Result<String>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let backoff = backoff_for(attempt);

            let res = match build(&self.http).send().await {
                Ok(r) => r,
                Err(err) => {
                    if attempt >= self.retries {
                        return Err(err).with_context(|| format!("{source} request failed"));
                    }
                    tracing::warn!(source, attempt, ?backoff, error = %err, "market data request failed; retrying");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };

            let status = res.status();
            let text = res
                .text()
                .await
                .with_context(|| format!("failed to read {source} response"))?;

            if status.is_success() {
                return Ok(text);
            }

            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if retryable && attempt < self.retries {
                tracing::warn!(source, attempt, ?backoff, http_status = %status, "market data HTTP error; retrying");
                tokio::time::sleep(backoff).await;
                continue;
            }
            anyhow::bail!("{source} HTTP {status}: {}", truncate_body(&text));
        }
    }
}

/// 1s, 2s, 4s, ... capped at [`MAX_BACKOFF_SECS`].
fn backoff_for(attempt: u32) -> Duration {
    let secs = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX)
        .min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

fn truncate_body(text: &str) -> String {
    const MAX: usize = 200;
    let trimmed = text.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_for(1), Duration::from_secs(1));
        assert_eq!(backoff_for(3), Duration::from_secs(4));
        assert_eq!(backoff_for(10), Duration::from_secs(MAX_BACKOFF_SECS));
        assert_eq!(backoff_for(65), Duration::from_secs(MAX_BACKOFF_SECS));
        assert_eq!(backoff_for(u32::MAX), Duration::from_secs(MAX_BACKOFF_SECS));
    }

    #[test]
    fn truncates_long_error_bodies_on_char_boundary() {
        let body = "行".repeat(300);
        let out = truncate_body(&body);
        assert_eq!(out.chars().count(), 203);
        assert!(out.ends_with("..."));
        assert_eq!(truncate_body("  short  "), "short");
    }
}
