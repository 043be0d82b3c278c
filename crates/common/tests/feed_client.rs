use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use common::config;
use common::leaderboard::{FeedError, LeaderboardClient};
use serde_json::json;

#[derive(Clone, Default)]
struct Upstream {
    hits: Arc<AtomicUsize>,
    fail_first: usize,
}

async fn leaderboard(
    State(up): State<Upstream>,
    Query(q): Query<BTreeMap<String, String>>,
) -> Response {
    let n = up.hits.fetch_add(1, Ordering::SeqCst);
    if n < up.fail_first {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let offset: u64 = q.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    Json(json!({
        "data": {"leaderboard": [{"walletAddress": format!("0x{offset}")}]}
    }))
    .into_response()
}

async fn broken() -> Json<serde_json::Value> {
    Json(json!({"data": {"rows": []}}))
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn spawn(up: Upstream) -> String {
    let app = Router::new()
        .route("/leaderboard", get(leaderboard))
        .route("/broken", get(broken))
        .route("/gone", get(not_found))
        .with_state(up);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn feed(url: String, http_max_retries: u32) -> config::Feed {
    config::Feed {
        base_url: url,
        page_size: 10,
        timeout_secs: 5,
        http_max_retries,
        http_backoff_base_ms: 1,
        logic_max_retries: 3,
        logic_backoff_base_ms: 0,
        user_agent: "feed-client-test".to_string(),
        params: BTreeMap::new(),
    }
}

#[tokio::test]
async fn retries_transient_status_then_succeeds() {
    let up = Upstream {
        fail_first: 2,
        ..Default::default()
    };
    let hits = up.hits.clone();
    let base = spawn(up).await;

    let client = LeaderboardClient::new(&feed(format!("{base}/leaderboard"), 3)).unwrap();
    let page = client.fetch_page(20, 10).await.unwrap();

    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["walletAddress"], "0x20");
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn gives_up_after_transport_retries() {
    let up = Upstream {
        fail_first: 100,
        ..Default::default()
    };
    let hits = up.hits.clone();
    let base = spawn(up).await;

    let client = LeaderboardClient::new(&feed(format!("{base}/leaderboard"), 2)).unwrap();
    let err = client.fetch_page(0, 10).await.unwrap_err();

    assert!(matches!(err, FeedError::Status(503)), "got {err:?}");
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let base = spawn(Upstream::default()).await;
    let client = LeaderboardClient::new(&feed(format!("{base}/gone"), 5)).unwrap();
    let err = client.fetch_page(0, 10).await.unwrap_err();
    assert!(matches!(err, FeedError::Status(404)), "got {err:?}");
}

#[tokio::test]
async fn malformed_payload_is_reported() {
    let base = spawn(Upstream::default()).await;
    let client = LeaderboardClient::new(&feed(format!("{base}/broken"), 5)).unwrap();
    let err = client.fetch_page(0, 10).await.unwrap_err();
    assert!(matches!(err, FeedError::Malformed(_)), "got {err:?}");
}
