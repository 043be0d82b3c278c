use anyhow::Result;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "leaderboard_api_requests_total",
        "Leaderboard page requests, labelled by result."
    );
    describe_histogram!(
        "leaderboard_api_latency_ms",
        "Leaderboard page request latency in milliseconds, including transport retries."
    );
    describe_counter!(
        "leaderboard_page_retries_total",
        "Logic-level page retries (failed, malformed or empty responses)."
    );
    describe_counter!(
        "leaderboard_pages_written_total",
        "Pages appended to the daily log."
    );
    describe_counter!(
        "leaderboard_records_written_total",
        "Records appended to the daily log."
    );
    describe_counter!(
        "leaderboard_duplicates_skipped_total",
        "Records dropped because their wallet was already written this run."
    );
    describe_counter!(
        "leaderboard_ingest_batches_total",
        "Ingest batches, labelled ok or failed."
    );
    describe_counter!(
        "leaderboard_snapshots_upserted_total",
        "Snapshot rows upserted."
    );
    describe_counter!(
        "leaderboard_changes_upserted_total",
        "Daily change rows upserted."
    );
    describe_counter!(
        "leaderboard_platform_stats_updates_total",
        "Platform stats recomputations, labelled updated or skipped."
    );
    describe_histogram!(
        "leaderboard_db_query_latency_ms",
        "SQLite call latency in milliseconds by operation."
    );
    describe_counter!(
        "leaderboard_db_query_errors_total",
        "SQLite calls that returned an error, by operation."
    );
}

/// Install the global recorder and serve `/metrics` on `port`. Must run
/// inside a Tokio runtime.
pub fn install_prometheus(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}
