use crate::config;
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("feed returned HTTP {0}")]
    Status(u16),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// HTTP client for the paginated leaderboard endpoint.
///
/// Handles transport-level retries only (connect errors, timeouts, 429 and
/// 5xx). Payload validation failures are returned to the caller untouched.
pub struct LeaderboardClient {
    base_url: Url,
    params: BTreeMap<String, String>,
    client: reqwest::Client,
    max_retries: u32,
    backoff_base: Duration,
}

impl LeaderboardClient {
    pub fn new(feed: &config::Feed) -> Result<Self> {
        let base_url = Url::parse(&feed.base_url)
            .with_context(|| format!("invalid feed.base_url: {}", feed.base_url))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(feed.timeout())
            .user_agent(feed.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            base_url,
            params: feed.params.clone(),
            client,
            max_retries: feed.http_max_retries,
            backoff_base: feed.http_backoff_base(),
        })
    }

    pub fn page_url(&self, offset: u64, count: u64) -> String {
        let mut url = self.base_url.clone();
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("offset", &offset.to_string());
            qp.append_pair("count", &count.to_string());
            for (k, v) in &self.params {
                qp.append_pair(k, v);
            }
        }
        url.to_string()
    }

    /// Fetch one page. An empty vector means the upstream returned an empty
    /// `data.leaderboard` array.
    pub async fn fetch_page(&self, offset: u64, count: u64) -> Result<Vec<Value>, FeedError> {
        let url = self.page_url(offset, count);
        let mut attempt = 0u32;
        loop {
            match self.get_json(&url).await {
                Ok(body) => return extract_leaderboard(&body),
                Err(e) if attempt < self.max_retries && is_retryable(&e) => {
                    let wait = self.backoff_base * 2u32.saturating_pow(attempt);
                    warn!(
                        offset,
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "leaderboard request failed; retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value, FeedError> {
        debug!(url = %url, "fetching leaderboard page");
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| FeedError::Malformed(format!("invalid JSON: {e}")))
    }
}

fn is_retryable(err: &FeedError) -> bool {
    match err {
        FeedError::Transport(_) => true,
        FeedError::Status(code) => {
            *code == StatusCode::TOO_MANY_REQUESTS.as_u16()
                || matches!(*code, 500 | 502 | 503 | 504)
        }
        FeedError::Malformed(_) => false,
    }
}

/// Pull the record list out of `{"data": {"leaderboard": [...]}}`.
pub fn extract_leaderboard(body: &Value) -> Result<Vec<Value>, FeedError> {
    let list = body
        .get("data")
        .and_then(|d| d.get("leaderboard"))
        .ok_or_else(|| FeedError::Malformed("missing data.leaderboard".to_string()))?;
    match list {
        Value::Array(items) => Ok(items.clone()),
        other => Err(FeedError::Malformed(format!(
            "data.leaderboard is not an array: {}",
            type_name(other)
        ))),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(base_url: &str) -> config::Feed {
        let mut params = BTreeMap::new();
        params.insert("preview".to_string(), "false".to_string());
        params.insert("walletAddress".to_string(), String::new());
        config::Feed {
            base_url: base_url.to_string(),
            page_size: 5000,
            timeout_secs: 5,
            http_max_retries: 0,
            http_backoff_base_ms: 0,
            logic_max_retries: 3,
            logic_backoff_base_ms: 0,
            user_agent: "test".to_string(),
            params,
        }
    }

    #[test]
    fn test_page_url_has_offset_count_and_params() {
        let client = LeaderboardClient::new(&feed("https://example.invalid/api/leaderboard")).unwrap();
        let url = Url::parse(&client.page_url(10000, 5000)).unwrap();
        let pairs: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(url.path(), "/api/leaderboard");
        assert_eq!(pairs.get("offset").map(String::as_str), Some("10000"));
        assert_eq!(pairs.get("count").map(String::as_str), Some("5000"));
        assert_eq!(pairs.get("preview").map(String::as_str), Some("false"));
        assert_eq!(pairs.get("walletAddress").map(String::as_str), Some(""));
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(LeaderboardClient::new(&feed("not a url")).is_err());
    }

    #[test]
    fn test_extract_leaderboard_ok() {
        let body = json!({"data": {"leaderboard": [{"walletAddress": "0x1"}, {"walletAddress": "0x2"}]}});
        let items = extract_leaderboard(&body).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["walletAddress"], "0x2");
    }

    #[test]
    fn test_extract_leaderboard_empty_array() {
        let body = json!({"data": {"leaderboard": []}});
        assert!(extract_leaderboard(&body).unwrap().is_empty());
    }

    #[test]
    fn test_extract_leaderboard_missing_or_wrong_type() {
        let missing = json!({"data": {}});
        assert!(matches!(
            extract_leaderboard(&missing),
            Err(FeedError::Malformed(_))
        ));
        let wrong = json!({"data": {"leaderboard": {"walletAddress": "0x1"}}});
        let err = extract_leaderboard(&wrong).unwrap_err();
        assert!(err.to_string().contains("object"), "got: {err}");
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(&FeedError::Status(429)));
        assert!(is_retryable(&FeedError::Status(503)));
        assert!(!is_retryable(&FeedError::Status(404)));
        assert!(!is_retryable(&FeedError::Malformed("x".to_string())));
    }
}
