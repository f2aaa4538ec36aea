// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
//   GET /health               liveness, active sessions, default key usage
//   GET /data?symbol&interval one interval's chart series with indicators
//   GET /ws?symbol            WebSocket subscription (see `api::ws`)
//
// `/data` aligns the index-based series (labels, prices, MACD) to the MACD
// consumer offset. SMA points carry their own timestamps and are returned
// whole.
//
// CORS is permissive; the service carries no credentials of its own.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::error::FeedError;
use crate::indicators::{IndicatorParams, IndicatorPoint, IndicatorSet};
use crate::market_data::bar::iso_timestamp;
use crate::market_data::BarSeries;
use crate::types::{Interval, Symbol};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/data", get(chart_data))
        .route("/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    active_sessions: usize,
    uptime_secs: u64,
    server_time: i64,
    rate_limit_key: String,
    rate_limit_in_window: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (rate_limit_key, rate_limit_in_window) = state.default_key_usage();
    Json(HealthResponse {
        status: "ok",
        active_sessions: state.active_sessions(),
        uptime_secs: state.uptime_secs(),
        server_time: Utc::now().timestamp_millis(),
        rate_limit_key,
        rate_limit_in_window,
    })
}

// =============================================================================
// Chart data
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct DataQuery {
    symbol: Option<String>,
    interval: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataResponse {
    pub labels: Vec<String>,
    pub prices: Vec<f64>,
    pub sma50: Vec<IndicatorPoint>,
    pub sma200: Vec<IndicatorPoint>,
    pub macd_line: Vec<f64>,
    pub signal_line: Vec<f64>,
    pub histogram: Vec<f64>,
}

impl DataResponse {
    pub fn build(series: &BarSeries, params: &IndicatorParams) -> Self {
        let set = IndicatorSet::compute(series, params);
        let offset = params.macd.consumer_offset();
        let macd = set.macd.sliced(offset);
        let bars = series.bars().get(offset..).unwrap_or_default();

        Self {
            labels: bars.iter().map(|b| iso_timestamp(&b.timestamp)).collect(),
            prices: bars.iter().map(|b| b.close).collect(),
            sma50: set.sma50,
            sma200: set.sma200,
            macd_line: macd.macd_line,
            signal_line: macd.signal_line,
            histogram: macd.histogram,
        }
    }
}

async fn chart_data(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DataQuery>,
) -> Result<Json<DataResponse>, FeedError> {
    let symbol = Symbol::parse(query.symbol.as_deref().unwrap_or(&state.config.default_symbol))?;
    let interval = match query.interval.as_deref() {
        Some(raw) => raw.parse::<Interval>()?,
        None => state.config.primary_interval,
    };

    let to = Utc::now();
    let from = to - state.config.lookback();
    let series = state.aggregator.fetch_one(&symbol, interval, from, to).await?;

    debug!(symbol = %symbol, interval = %interval, bars = series.len(), "chart data fetched");
    info!(symbol = %symbol, interval = %interval, "GET /data served");

    Ok(Json(DataResponse::build(&series, &state.config.indicators)))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::DataAggregator;
    use crate::provider::rate_limit::RateKeyScope;
    use crate::provider::RateLimiter;
    use crate::provider::scripted::{daily_series, ScriptedProvider};
    use crate::runtime_config::RuntimeConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    fn limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(5, Duration::from_secs(60), RateKeyScope::SymbolInterval))
    }

    fn app(provider: Arc<ScriptedProvider>) -> Router {
        app_with_limiter(provider, limiter())
    }

    fn app_with_limiter(provider: Arc<ScriptedProvider>, limiter: Arc<RateLimiter>) -> Router {
        let aggregator = DataAggregator::new(provider, Duration::from_secs(5));
        router(Arc::new(AppState::new(RuntimeConfig::default(), aggregator, None, limiter)))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_reports_sessions() {
        let (status, body) = get_json(app(Arc::new(ScriptedProvider::new())), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_sessions"], 0);
        assert!(body["server_time"].is_i64());
        assert_eq!(body["rate_limit_in_window"], 0);
    }

    #[tokio::test]
    async fn health_reports_default_key_usage() {
        let limiter = limiter();
        let provider = Arc::new(ScriptedProvider::new().with_limiter(limiter.clone()));
        provider.respond(Interval::Day, Ok(daily_series(40, |i| i as f64)));
        let app = app_with_limiter(provider, limiter);

        let (status, _) = get_json(app.clone(), "/data").await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = get_json(app, "/health").await;
        assert_eq!(body["rate_limit_key"], "C:EURUSD@day");
        assert_eq!(body["rate_limit_in_window"], 1);
    }

    #[tokio::test]
    async fn data_is_aligned_to_macd_offset() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.respond(Interval::Day, Ok(daily_series(250, |i| 1.0 + 0.01 * i as f64)));
        let (status, body) = get_json(app(provider), "/data?symbol=EURUSD&interval=day").await;

        assert_eq!(status, StatusCode::OK);
        let labels = body["labels"].as_array().unwrap();
        assert_eq!(labels.len(), 250 - 33);
        assert_eq!(body["prices"].as_array().unwrap().len(), 217);
        assert_eq!(body["macdLine"].as_array().unwrap().len(), 217);
        assert_eq!(body["signalLine"].as_array().unwrap().len(), 217);
        assert_eq!(body["histogram"].as_array().unwrap().len(), 217);
        assert_eq!(body["sma50"].as_array().unwrap().len(), 201);
        assert_eq!(body["sma200"].as_array().unwrap().len(), 51);
        // 2024-01-01 + 33 days
        assert_eq!(labels[0], "2024-02-03T00:00:00.000Z");
    }

    #[tokio::test]
    async fn data_defaults_to_configured_symbol_and_primary_interval() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.respond(Interval::Day, Ok(daily_series(40, |i| i as f64)));
        let (status, body) = get_json(app(provider.clone()), "/data").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["labels"].as_array().unwrap().len(), 7);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_symbol_is_bad_request() {
        let (status, body) = get_json(
            app(Arc::new(ScriptedProvider::new())),
            "/data?symbol=%20%20",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_subscription");
    }

    #[tokio::test]
    async fn unknown_interval_is_bad_request() {
        let (status, body) = get_json(
            app(Arc::new(ScriptedProvider::new())),
            "/data?symbol=EURUSD&interval=fortnight",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_subscription");
    }

    #[tokio::test]
    async fn upstream_failure_maps_to_status() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.respond(Interval::Day, Err(FeedError::UpstreamRejected("polygon: HTTP 401".into())));
        let (status, body) = get_json(app(provider), "/data?symbol=EURUSD").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "upstream_rejected");
    }

    #[test]
    fn short_series_yields_empty_aligned_arrays() {
        let resp = DataResponse::build(&daily_series(10, |i| i as f64), &IndicatorParams::default());
        assert!(resp.labels.is_empty());
        assert!(resp.macd_line.is_empty());
        assert!(resp.sma50.is_empty());
    }
}
