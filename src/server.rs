use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;

use crate::error::Result;
use crate::forecaster::{check_horizon, Forecaster};
use crate::model::forecast::{ForecastResponse, PredictionResponse, UnavailableReason};

#[derive(Clone)]
pub struct AppState {
    pub forecaster: Arc<Forecaster>,
    pub default_horizon: usize,
}

#[derive(Debug, Deserialize)]
pub struct HorizonQuery {
    pub horizon: Option<usize>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/predict/{symbol}", get(predict))
        .route("/api/predict-future/{symbol}", get(predict_future))
        .with_state(state)
}

/// Serve until the listener fails or the process is stopped.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "HTTP server listening");
    }
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn predict(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> (StatusCode, Json<PredictionResponse>) {
    let resp = state.forecaster.get_prediction(&symbol).await;
    let status = if resp.error.is_some() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(resp))
}

async fn predict_future(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<HorizonQuery>,
) -> (StatusCode, Json<ForecastResponse>) {
    let horizon = query.horizon.unwrap_or(state.default_horizon);
    if let Err(e) = check_horizon(horizon) {
        let resp = ForecastResponse {
            symbol: symbol.trim().to_ascii_uppercase(),
            dates: Vec::new(),
            prices: Vec::new(),
            error: Some(UnavailableReason::from(e).to_string()),
        };
        return (StatusCode::BAD_REQUEST, Json(resp));
    }
    let resp = state.forecaster.get_forecast(&symbol, horizon).await;
    let status = if resp.error.is_some() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(resp))
}
