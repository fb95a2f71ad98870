use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use rand::rngs::StdRng;
use rand::SeedableRng;

use stock_forecast::config::Activation;
use stock_forecast::forecaster::Forecaster;
use stock_forecast::market_data::MarketDataProvider;
use stock_forecast::model::forecast::{ForecastResponse, PredictionResponse};
use stock_forecast::model::price_bar::PriceBar;
use stock_forecast::network::{LstmRegressor, ModelArtifact};
use stock_forecast::registry::{ArtifactLayout, ModelRegistry};
use stock_forecast::scaler::MinMaxScaler;
use stock_forecast::server::{self, AppState};

struct RampProvider;

#[async_trait]
impl MarketDataProvider for RampProvider {
    async fn fetch_history(
        &self,
        symbol: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> stock_forecast::Result<Vec<PriceBar>> {
        let first = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        Ok((0..20)
            .map(|d| PriceBar {
                symbol: symbol.to_string(),
                date: first + Days::new(d),
                open: 50.0,
                high: 55.0,
                low: 45.0,
                close: 50.0 + d as f64 * 0.5,
                volume: 1.0,
            })
            .collect())
    }
}

async fn spawn_server(root: &std::path::Path) -> String {
    let layout = ArtifactLayout::new(root, &["AAPL".to_string()]);
    let paths = layout.paths_for_key("AAPL");
    let mut rng = StdRng::seed_from_u64(21);
    let net = LstmRegressor::new(1, 3, 0.0, Activation::Sigmoid, &mut rng);
    ModelArtifact::new("AAPL", 8, 1, 0.1, net)
        .persist(&paths.best_model)
        .unwrap();
    MinMaxScaler::fit_series("AAPL", "Close", &[40.0, 70.0])
        .unwrap()
        .persist(&paths.scaler)
        .unwrap();

    let forecaster = Forecaster::new(
        Arc::new(ModelRegistry::new(layout)),
        Arc::new(RampProvider),
        Duration::from_secs(2),
        90,
    );
    let state = AppState {
        forecaster: Arc::new(forecaster),
        default_horizon: 60,
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server::serve(listener, state).await;
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn routes_serve_predictions_and_forecasts() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_server(dir.path()).await;
    let http = reqwest::Client::new();

    let health = http.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);
    assert_eq!(health.text().await.unwrap(), "ok");

    let resp = http
        .get(format!("{}/api/predict/aapl", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: PredictionResponse = resp.json().await.unwrap();
    assert_eq!(body.symbol, "AAPL");
    assert!(body.prediction.is_some());

    let resp = http
        .get(format!("{}/api/predict-future/AAPL?horizon=5", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: ForecastResponse = resp.json().await.unwrap();
    assert_eq!(body.dates.len(), 5);
    assert_eq!(body.prices.len(), 5);

    let resp = http
        .get(format!("{}/api/predict-future/AAPL", base))
        .send()
        .await
        .unwrap();
    let body: ForecastResponse = resp.json().await.unwrap();
    assert_eq!(body.dates.len(), 60);
}

#[tokio::test]
async fn unservable_symbol_reports_error_body() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_server(dir.path()).await;

    let resp = reqwest::get(format!("{}/api/predict/IBM", base)).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: PredictionResponse = resp.json().await.unwrap();
    assert_eq!(body.prediction, None);
    assert!(body.error.unwrap().contains("generalized"));
}

#[tokio::test]
async fn out_of_range_horizon_is_a_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_server(dir.path()).await;

    for horizon in [0, 366] {
        let resp = reqwest::get(format!("{}/api/predict-future/aapl?horizon={}", base, horizon))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: ForecastResponse = resp.json().await.unwrap();
        assert_eq!(body.symbol, "AAPL");
        assert!(body.dates.is_empty());
        assert!(body.error.unwrap().contains("horizon"));
    }

    let resp = reqwest::get(format!("{}/api/predict-future/AAPL?horizon=365", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
}
