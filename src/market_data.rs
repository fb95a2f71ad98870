use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ForecastError, Result};
use crate::model::price_bar::PriceBar;

/// Source of daily OHLCV history. Implementations may return an empty vector
/// for unknown symbols; callers treat that as "not enough data".
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch_history(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>>;
}

pub struct YahooChartClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Option<Vec<i64>>,
    indicators: ChartIndicators,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<ChartQuote>,
}

#[derive(Debug, Default, Deserialize)]
struct ChartQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

impl YahooChartClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stock-forecast/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn compact_error_body(body: &str) -> String {
        let normalized = body.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.len() > 180 {
            let cut = (0..=180)
                .rev()
                .find(|i| normalized.is_char_boundary(*i))
                .unwrap_or(0);
            format!("{}...", &normalized[..cut])
        } else {
            normalized
        }
    }
}

#[async_trait]
impl MarketDataProvider for YahooChartClient {
    async fn fetch_history(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        let endpoint = format!("{}/v8/finance/chart/{}", self.base_url, symbol);
        let period1 = day_start_unix(start).to_string();
        let period2 = day_start_unix(end).to_string();
        let response = self
            .http
            .get(&endpoint)
            .query(&[
                ("period1", period1.as_str()),
                ("period2", period2.as_str()),
                ("interval", "1d"),
                ("events", "history"),
            ])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // Unknown symbols come back as 404 with an error payload.
            tracing::warn!(symbol, "yahoo chart returned 404; treating as empty history");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ForecastError::UpstreamFetch(format!(
                "yahoo chart for {} returned {}: {}",
                symbol,
                status,
                Self::compact_error_body(&body)
            )));
        }

        let body = response.text().await?;
        parse_chart_payload(symbol, &body)
    }
}

/// Flatten the provider's nested `chart.result[0].indicators.quote[0]` arrays
/// into one row per timestamp. Rows missing any OHLC value are dropped.
pub fn parse_chart_payload(symbol: &str, body: &str) -> Result<Vec<PriceBar>> {
    let parsed: ChartResponse = serde_json::from_str(body)?;
    if let Some(error) = parsed.chart.error.filter(|e| !e.is_null()) {
        let detail = error
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        tracing::warn!(symbol, detail = %detail, "yahoo chart reported an error");
        return Ok(Vec::new());
    }

    let Some(result) = parsed.chart.result.and_then(|r| r.into_iter().next()) else {
        return Ok(Vec::new());
    };
    let timestamps = result.timestamp.unwrap_or_default();
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, &ts) in timestamps.iter().enumerate() {
        let Some(date) = DateTime::from_timestamp(ts, 0).map(|dt| dt.date_naive()) else {
            return Err(ForecastError::UpstreamFetch(format!(
                "invalid timestamp {} in chart for {}",
                ts, symbol
            )));
        };
        let field = |col: &[Option<f64>]| col.get(i).copied().flatten();
        if let (Some(open), Some(high), Some(low), Some(close)) = (
            field(&quote.open),
            field(&quote.high),
            field(&quote.low),
            field(&quote.close),
        ) {
            bars.push(PriceBar {
                symbol: symbol.to_string(),
                date,
                open,
                high,
                low,
                close,
                volume: field(&quote.volume).unwrap_or(0.0),
            });
        }
    }
    Ok(bars)
}

fn day_start_unix(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{
      "chart": {
        "result": [{
          "timestamp": [1704205800, 1704292200, 1704378600],
          "indicators": {
            "quote": [{
              "open":   [187.15, 184.22, null],
              "high":   [188.44, 185.88, 183.09],
              "low":    [183.89, 183.43, 180.88],
              "close":  [185.64, 184.25, 181.91],
              "volume": [82488700, 58414500, 71983600]
            }]
          }
        }],
        "error": null
      }
    }"#;

    #[test]
    fn flattens_nested_quote_arrays_and_drops_incomplete_rows() {
        let bars = parse_chart_payload("AAPL", PAYLOAD).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date.to_string(), "2024-01-02");
        assert!((bars[1].close - 184.25).abs() < 1e-9);
        assert!((bars[0].volume - 82_488_700.0).abs() < 1e-6);
        assert!(bars.iter().all(|b| b.symbol == "AAPL"));
    }

    #[test]
    fn error_payload_is_empty_history() {
        let body = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#;
        assert!(parse_chart_payload("ZZZZ", body).unwrap().is_empty());
    }
}
