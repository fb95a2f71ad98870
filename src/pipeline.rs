//! Batch stages: ingest -> train -> evaluate. A failure on one dataset is
//! logged and recorded; the remaining datasets still run.

use std::sync::Arc;

use crate::config::Config;
use crate::error::{ForecastError, Result};
use crate::evaluation::{evaluate, EvaluationReport};
use crate::history_store::HistoryStore;
use crate::ingestion::{self, chronological_split, group_by_symbol, pool_series, DatasetSplit};
use crate::market_data::MarketDataProvider;
use crate::model::price_bar::{closes, PriceBar};
use crate::network::ModelArtifact;
use crate::registry::{ArtifactLayout, ModelRegistry, GENERALIZED_KEY};
use crate::scaler::MinMaxScaler;
use crate::sequence::{make_sequences, SequenceSet};
use crate::trainer::{self, TrainingHistory};

const CLOSE_FEATURE: &str = "Close";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl StageSummary {
    fn ok(&mut self, key: &str) {
        self.succeeded.push(key.to_string());
    }

    fn fail(&mut self, stage: &str, key: &str, err: &ForecastError) {
        tracing::warn!(stage, key, error = %err, "Dataset skipped");
        self.failed.push((key.to_string(), err.to_string()));
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Pipeline {
    config: Config,
    provider: Arc<dyn MarketDataProvider>,
    store: HistoryStore,
    registry: Arc<ModelRegistry>,
}

impl Pipeline {
    pub fn new(config: Config, provider: Arc<dyn MarketDataProvider>, registry: Arc<ModelRegistry>) -> Result<Self> {
        let store = HistoryStore::open(&config.artifacts.history_db)?;
        Ok(Self {
            config,
            provider,
            store,
            registry,
        })
    }

    pub fn layout(&self) -> &ArtifactLayout {
        self.registry.layout()
    }

    /// Fetch every configured symbol, stage its split, then stage the pooled
    /// split under the generalized key.
    pub async fn ingest_all(&self) -> Result<StageSummary> {
        let ingest = &self.config.data_ingestion;
        let mut summary = StageSummary::default();
        let mut fetched = Vec::new();

        for symbol in ingest.specialized_symbols() {
            let staged = async {
                let series =
                    ingestion::fetch(self.provider.as_ref(), &symbol, ingest.start_date, ingest.end_date).await?;
                if series.is_empty() {
                    return Err(ForecastError::NotEnoughData {
                        key: symbol.clone(),
                        required: 1,
                        available: 0,
                    });
                }
                let split = chronological_split(series.bars(), ingest.test_size)?;
                self.store.save_split(&symbol, &split)?;
                Ok::<_, ForecastError>(series)
            }
            .await;
            match staged {
                Ok(series) => {
                    summary.ok(&symbol);
                    fetched.push(series);
                }
                Err(e) => summary.fail("ingest", &symbol, &e),
            }
        }

        if fetched.is_empty() {
            summary.fail(
                "ingest",
                GENERALIZED_KEY,
                &ForecastError::NotEnoughData {
                    key: GENERALIZED_KEY.to_string(),
                    required: 1,
                    available: 0,
                },
            );
            return Ok(summary);
        }
        let pooled = pool_series(&fetched);
        match chronological_split(&pooled, ingest.test_size)
            .and_then(|split| self.store.save_split(GENERALIZED_KEY, &split))
        {
            Ok(()) => summary.ok(GENERALIZED_KEY),
            Err(e) => summary.fail("ingest", GENERALIZED_KEY, &e),
        }
        Ok(summary)
    }

    pub fn train_all(&self) -> Result<StageSummary> {
        let mut summary = StageSummary::default();
        for key in self.staged_keys()? {
            match self.train_key(&key) {
                Ok(history) => {
                    tracing::info!(
                        key = %key,
                        best_epoch = ?history.best_epoch,
                        best_val_loss = ?history.best_val_loss,
                        "Dataset trained"
                    );
                    summary.ok(&key);
                }
                Err(e) => summary.fail("train", &key, &e),
            }
        }
        Ok(summary)
    }

    pub fn train_key(&self, key: &str) -> Result<TrainingHistory> {
        let split = self.staged_split(key)?;
        let paths = self.layout().paths_for_key(key);
        let hyper = &self.config.lstm_model;

        let scaler = MinMaxScaler::fit_series(key, CLOSE_FEATURE, &split.train_closes())?;
        let train_set = windows_for(key, &split.train, &scaler, hyper.time_step)?;
        let test_set = windows_for(key, &split.test, &scaler, hyper.time_step)?;

        let (_, history) = trainer::train(key, &train_set, &test_set, &scaler, hyper, &paths)?;
        self.registry.invalidate(key);
        Ok(history)
    }

    pub fn evaluate_all(&self) -> Result<StageSummary> {
        let mut summary = StageSummary::default();
        for key in self.staged_keys()? {
            match self.evaluate_key(&key) {
                Ok(report) => {
                    tracing::info!(
                        key = %key,
                        samples = report.samples,
                        mae = report.mae,
                        rmse = report.rmse,
                        mape = ?report.mape,
                        "Dataset evaluated"
                    );
                    summary.ok(&key);
                }
                Err(e) => summary.fail("evaluate", &key, &e),
            }
        }
        Ok(summary)
    }

    pub fn evaluate_key(&self, key: &str) -> Result<EvaluationReport> {
        let split = self.staged_split(key)?;
        let paths = self.layout().paths_for_key(key);
        if !paths.best_model.exists() || !paths.scaler.exists() {
            return Err(ForecastError::ArtifactNotFound {
                key: key.to_string(),
            });
        }
        let model = ModelArtifact::load(&paths.best_model)?;
        let scaler = MinMaxScaler::load(&paths.scaler)?;
        let test_set = windows_for(key, &split.test, &scaler, model.window_length)?;
        let report = evaluate(key, &model.network, &scaler, &test_set)?;
        report.persist(&paths.report)?;
        Ok(report)
    }

    /// Staged datasets that still belong to the configured tickers.
    fn staged_keys(&self) -> Result<Vec<String>> {
        let layout = self.layout();
        Ok(self
            .store
            .datasets()?
            .into_iter()
            .filter(|key| key == GENERALIZED_KEY || layout.is_specialized(key))
            .collect())
    }

    fn staged_split(&self, key: &str) -> Result<DatasetSplit> {
        self.store
            .load_split(key)?
            .ok_or_else(|| ForecastError::NotEnoughData {
                key: key.to_string(),
                required: 1,
                available: 0,
            })
    }
}

/// Scale closes with `scaler` and window each symbol's rows separately so no
/// window mixes two symbols. A specialized dataset is a single group.
pub fn windows_for(
    key: &str,
    bars: &[PriceBar],
    scaler: &MinMaxScaler,
    window_length: usize,
) -> Result<SequenceSet> {
    let mut sets = Vec::new();
    for (_, rows) in group_by_symbol(bars) {
        let scaled = scaler.transform_series(&closes(&rows))?;
        sets.push(make_sequences(&scaled, window_length)?);
    }
    if sets.is_empty() {
        return Ok(SequenceSet::empty(window_length, scaler.feature_count()));
    }
    SequenceSet::concat(key, &sets)
}
