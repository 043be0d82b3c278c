mod coordinator;
mod page;
mod progress;

pub use coordinator::{FetchCoordinator, FetchOutcome, FetchReport, WindowConfig};
pub use page::{PageFetcher, RetryPolicy};
pub use progress::ProgressTracker;

use chrono::NaiveDate;
use common::leaderboard::{FeedError, LeaderboardClient};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// One page of raw leaderboard records at `offset`.
pub trait LeaderboardPager {
    fn fetch_leaderboard_page(
        &self,
        offset: u64,
        count: u64,
    ) -> impl std::future::Future<Output = Result<Vec<Value>, FeedError>> + Send;
}

impl LeaderboardPager for LeaderboardClient {
    async fn fetch_leaderboard_page(
        &self,
        offset: u64,
        count: u64,
    ) -> Result<Vec<Value>, FeedError> {
        let start = Instant::now();
        let res = self.fetch_page(offset, count).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("leaderboard_api_latency_ms").record(ms);
        let status = match &res {
            Ok(_) => "ok",
            Err(FeedError::Transport(_)) => "transport",
            Err(FeedError::Status(_)) => "http_status",
            Err(FeedError::Malformed(_)) => "malformed",
        };
        metrics::counter!("leaderboard_api_requests_total", "status" => status).increment(1);
        res
    }
}

/// On-disk artifacts of one dated fetch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFiles {
    pub log: PathBuf,
    pub progress: PathBuf,
    /// Written once the end of the feed has been reached.
    pub done: PathBuf,
}

impl RunFiles {
    pub fn for_date(data_dir: impl AsRef<Path>, date: NaiveDate) -> Self {
        let dir = data_dir.as_ref();
        let stem = format!("{}_leaderboard", date.format("%Y%m%d"));
        Self {
            log: dir.join(format!("{stem}.jsonl")),
            progress: dir.join(format!("{stem}.progress")),
            done: dir.join(format!("{stem}.done")),
        }
    }
}

/// Snapshot date encoded in a log file name (`YYYYMMDD_...`).
pub fn date_from_log_name(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let digits = name.get(..8)?;
    NaiveDate::parse_from_str(digits, "%Y%m%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_files_named_by_date() {
        let files = RunFiles::for_date("/data", NaiveDate::from_ymd_opt(2025, 9, 28).unwrap());
        assert_eq!(files.log, PathBuf::from("/data/20250928_leaderboard.jsonl"));
        assert_eq!(
            files.progress,
            PathBuf::from("/data/20250928_leaderboard.progress")
        );
        assert_eq!(files.done, PathBuf::from("/data/20250928_leaderboard.done"));
    }

    #[test]
    fn test_date_from_log_name() {
        assert_eq!(
            date_from_log_name(Path::new("/x/20250928_leaderboard.jsonl")),
            NaiveDate::from_ymd_opt(2025, 9, 28)
        );
        assert_eq!(date_from_log_name(Path::new("leaderboard.jsonl")), None);
        assert_eq!(date_from_log_name(Path::new("2025")), None);
    }
}
