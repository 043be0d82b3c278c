use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn describe() {
    describe_gauge!(
        "leaderboard_web_build_info",
        "Build info for the leaderboard query API (value is always 1)."
    );
    describe_counter!(
        "leaderboard_web_requests_total",
        "API requests by matched route and status code."
    );
    describe_histogram!(
        "leaderboard_web_request_latency_ms",
        "API request latency in milliseconds by matched route."
    );
}

/// Install the global Prometheus recorder once and return a handle for
/// rendering `/metrics`. Upkeep runs on each scrape.
pub fn init_global() -> Result<PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    let git_sha = std::env::var("GIT_SHA").unwrap_or_else(|_| "unknown".to_string());
    ::metrics::gauge!(
        "leaderboard_web_build_info",
        "version" => env!("CARGO_PKG_VERSION"),
        "git_sha" => git_sha,
    )
    .set(1.0);

    Ok(PROM_HANDLE.get_or_init(|| handle).clone())
}
