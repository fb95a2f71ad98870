use chrono::NaiveDate;

use crate::error::{ForecastError, Result};
use crate::market_data::MarketDataProvider;
use crate::model::price_bar::{PriceBar, TimeSeries};
use crate::model::symbol::normalize_symbol;

/// Chronological train/test partition of one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSplit {
    pub train: Vec<PriceBar>,
    pub test: Vec<PriceBar>,
}

impl DatasetSplit {
    pub fn train_closes(&self) -> Vec<f64> {
        crate::model::price_bar::closes(&self.train)
    }

    pub fn test_closes(&self) -> Vec<f64> {
        crate::model::price_bar::closes(&self.test)
    }
}

pub async fn fetch(
    provider: &dyn MarketDataProvider,
    symbol: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<TimeSeries> {
    let symbol = normalize_symbol(symbol)?;
    if start >= end {
        return Err(ForecastError::Config(format!(
            "fetch range for {} is empty ({} >= {})",
            symbol, start, end
        )));
    }
    let bars = provider.fetch_history(&symbol, start, end).await?;
    let series = TimeSeries::new(symbol, bars);
    tracing::info!(
        symbol = %series.symbol(),
        rows = series.len(),
        last = ?series.last_date(),
        start = %start,
        end = %end,
        "Fetched price history"
    );
    Ok(series)
}

/// Split by time order: the first `floor(len * (1 - test_fraction))` rows
/// train, the rest test. Rows must already be sorted by date.
pub fn chronological_split(bars: &[PriceBar], test_fraction: f64) -> Result<DatasetSplit> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(ForecastError::Config(format!(
            "test fraction must be in (0, 1), got {}",
            test_fraction
        )));
    }
    let split_idx = ((bars.len() as f64) * (1.0 - test_fraction)).floor() as usize;
    let split_idx = split_idx.min(bars.len());
    Ok(DatasetSplit {
        train: bars[..split_idx].to_vec(),
        test: bars[split_idx..].to_vec(),
    })
}

/// Concatenate every symbol's bars and order them by `(date, symbol)` so the
/// pooled dataset can be split chronologically like a single series.
pub fn pool_series(series: &[TimeSeries]) -> Vec<PriceBar> {
    let mut pooled: Vec<PriceBar> = series
        .iter()
        .flat_map(|s| s.bars().iter().cloned())
        .collect();
    pooled.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.symbol.cmp(&b.symbol)));
    pooled
}

/// Re-group pooled rows by symbol, preserving their order. Used when the
/// pooled partitions are windowed per symbol.
pub fn group_by_symbol(bars: &[PriceBar]) -> Vec<(String, Vec<PriceBar>)> {
    let mut groups: Vec<(String, Vec<PriceBar>)> = Vec::new();
    for bar in bars {
        match groups.iter_mut().find(|(sym, _)| sym == &bar.symbol) {
            Some((_, rows)) => rows.push(bar.clone()),
            None => groups.push((bar.symbol.clone(), vec![bar.clone()])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(symbol: &str, day: u32, close: f64) -> PriceBar {
        PriceBar {
            symbol: symbol.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }

    #[test]
    fn split_index_floors_train_share() {
        let bars: Vec<PriceBar> = (1..=10).map(|d| bar("A", d, d as f64)).collect();
        let split = chronological_split(&bars, 0.25).unwrap();
        assert_eq!(split.train.len(), 7);
        assert_eq!(split.test.len(), 3);
        assert_eq!(split.test_closes(), vec![8.0, 9.0, 10.0]);
    }

    #[test]
    fn split_rejects_bad_fraction() {
        assert!(chronological_split(&[], 0.0).is_err());
        assert!(chronological_split(&[], 1.0).is_err());
        let empty = chronological_split(&[], 0.2).unwrap();
        assert!(empty.train.is_empty() && empty.test.is_empty());
    }

    #[test]
    fn pooling_orders_by_date_then_symbol() {
        let a = TimeSeries::new("MSFT", vec![bar("", 1, 1.0), bar("", 2, 2.0)]);
        let b = TimeSeries::new("AAPL", vec![bar("", 2, 20.0), bar("", 1, 10.0)]);
        let pooled = pool_series(&[a, b]);
        let order: Vec<(u32, &str)> = pooled
            .iter()
            .map(|p| (chrono::Datelike::day(&p.date), p.symbol.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![(1, "AAPL"), (1, "MSFT"), (2, "AAPL"), (2, "MSFT")]
        );
        let groups = group_by_symbol(&pooled);
        assert_eq!(groups[0].0, "AAPL");
        assert_eq!(crate::model::price_bar::closes(&groups[0].1), vec![10.0, 20.0]);
    }
}
