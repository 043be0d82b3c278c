mod metrics;
mod models;
mod queries;

use anyhow::Result;
use axum::extract::{MatchedPath, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Local, NaiveDate};
use metrics_exporter_prometheus::PrometheusHandle;
use models::{DailyRankRow, GlobalRankRow, Health, NewWalletsPage, PlatformStats, XpBucketCount};
use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 500;

pub struct AppState {
    pub db_path: PathBuf,
    pub started_at: Instant,
    /// `None` disables `/metrics`.
    pub prometheus: Option<PrometheusHandle>,
}

/// Open a read-only connection to the store.
/// Each request gets a fresh connection; WAL lets reads run beside the ingester.
pub fn open_readonly(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            Self::Internal(e) => {
                tracing::error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Run a read-only query off the async runtime.
async fn with_conn<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let path = state.db_path.clone();
    tokio::task::spawn_blocking(move || {
        let conn = open_readonly(&path)?;
        f(&conn)
    })
    .await
    .map_err(|e| ApiError::Internal(e.into()))?
    .map_err(ApiError::Internal)
}

fn yesterday() -> NaiveDate {
    let today = Local::now().date_naive();
    today.pred_opt().unwrap_or(today)
}

fn parse_date(raw: Option<&str>) -> Result<Option<NaiveDate>, ApiError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("invalid date {s:?}, expected YYYY-MM-DD"))),
    }
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(0, MAX_LIMIT)
}

#[derive(Debug, Default, Deserialize)]
struct StatsParams {
    date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RankParams {
    snapshot_date: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl RankParams {
    fn date(&self) -> Result<NaiveDate, ApiError> {
        Ok(parse_date(self.snapshot_date.as_deref())?.unwrap_or_else(yesterday))
    }
}

// --- Handlers ---

async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn platform_stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Result<Json<PlatformStats>, ApiError> {
    let date = parse_date(params.date.as_deref())?;
    let row = with_conn(&state, move |conn| queries::platform_stats(conn, date)).await?;
    row.map(Json).ok_or_else(|| {
        ApiError::NotFound(match date {
            Some(d) => format!("no platform stats for {d}"),
            None => "no platform stats yet".to_string(),
        })
    })
}

async fn platform_stats_all(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PlatformStats>>, ApiError> {
    let rows = with_conn(&state, queries::all_platform_stats).await?;
    if rows.is_empty() {
        return Err(ApiError::NotFound("no platform stats yet".to_string()));
    }
    Ok(Json(rows))
}

async fn global_rank(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RankParams>,
) -> Result<Json<Vec<GlobalRankRow>>, ApiError> {
    let date = params.date()?;
    let limit = clamp_limit(params.limit);
    let rows = with_conn(&state, move |conn| queries::global_rank(conn, date, limit)).await?;
    Ok(Json(rows))
}

async fn daily_rank(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RankParams>,
) -> Result<Json<Vec<DailyRankRow>>, ApiError> {
    let date = params.date()?;
    let limit = clamp_limit(params.limit);
    let rows = with_conn(&state, move |conn| queries::daily_rank(conn, date, limit)).await?;
    Ok(Json(rows))
}

async fn new_wallets(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RankParams>,
) -> Result<Json<NewWalletsPage>, ApiError> {
    let date = params.date()?;
    let limit = clamp_limit(params.limit);
    let offset = params.offset.unwrap_or(0).max(0);
    let page =
        with_conn(&state, move |conn| queries::new_wallets(conn, date, offset, limit)).await?;
    Ok(Json(page))
}

async fn xp_distribution(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RankParams>,
) -> Result<Json<Vec<XpBucketCount>>, ApiError> {
    let date = params.date()?;
    let buckets = with_conn(&state, move |conn| queries::xp_distribution(conn, date)).await?;
    Ok(Json(buckets))
}

async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.prometheus {
        Some(handle) => {
            handle.run_upkeep();
            (
                [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                handle.render(),
            )
                .into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());
    let start = Instant::now();
    let response = next.run(request).await;

    ::metrics::histogram!("leaderboard_web_request_latency_ms", "route" => route.clone())
        .record(start.elapsed().as_secs_f64() * 1000.0);
    ::metrics::counter!(
        "leaderboard_web_requests_total",
        "route" => route,
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    response
}

// --- Router ---

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/platform-stats", get(platform_stats))
        .route("/platform-stats-all", get(platform_stats_all))
        .route("/global-rank", get(global_rank))
        .route("/daily-rank", get(daily_rank))
        .route("/new-wallets", get(new_wallets))
        .route("/xp-distribution", get(xp_distribution))
        .route("/metrics", get(prometheus_metrics))
        .route_layer(middleware::from_fn(track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;
    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("web", &config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    let web_port = config.web.as_ref().map_or(8080, |w| w.port);
    let web_host = config
        .web
        .as_ref()
        .map_or("0.0.0.0".to_string(), |w| w.host.clone());

    let state = Arc::new(AppState {
        db_path: PathBuf::from(&config.database.path),
        started_at: Instant::now(),
        prometheus: Some(metrics::init_global()?),
    });

    let app = create_router(state);
    let addr: SocketAddr = format!("{web_host}:{web_port}").parse()?;
    tracing::info!(%addr, "query API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
