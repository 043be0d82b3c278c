use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::LeaderboardPager;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_feed(feed: &common::config::Feed) -> Self {
        Self {
            max_attempts: feed.logic_max_retries,
            backoff_base: feed.logic_backoff_base(),
        }
    }

    /// Wait before attempt `attempt + 1` (1-based `attempt`).
    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Fetches a single page, retrying failed, malformed and empty responses.
pub struct PageFetcher<P> {
    pager: Arc<P>,
    page_size: u64,
    policy: RetryPolicy,
}

impl<P> Clone for PageFetcher<P> {
    fn clone(&self) -> Self {
        Self {
            pager: Arc::clone(&self.pager),
            page_size: self.page_size,
            policy: self.policy,
        }
    }
}

impl<P: LeaderboardPager + Send + Sync> PageFetcher<P> {
    pub fn new(pager: Arc<P>, page_size: u64, policy: RetryPolicy) -> Self {
        Self {
            pager,
            page_size,
            policy,
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Records at `offset`. An empty vector means every attempt failed or came
    /// back empty; it never signals end of data on its own.
    pub async fn fetch(&self, offset: u64) -> Vec<Value> {
        for attempt in 1..=self.policy.max_attempts {
            match self
                .pager
                .fetch_leaderboard_page(offset, self.page_size)
                .await
            {
                Ok(records) if !records.is_empty() => return records,
                Ok(_) => tracing::warn!(offset, attempt, "empty page"),
                Err(e) => tracing::warn!(offset, attempt, error = %e, "page fetch failed"),
            }

            if attempt < self.policy.max_attempts {
                metrics::counter!("leaderboard_page_retries_total").increment(1);
                tokio::time::sleep(self.policy.backoff(attempt)).await;
            }
        }

        tracing::error!(
            offset,
            attempts = self.policy.max_attempts,
            "page retries exhausted"
        );
        Vec::new()
    }
}
