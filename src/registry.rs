use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::error::{ForecastError, Result};
use crate::model::symbol::normalize_symbol;
use crate::network::ModelArtifact;
use crate::scaler::MinMaxScaler;

/// Artifact key shared by every symbol outside the specialized set.
pub const GENERALIZED_KEY: &str = "generalized";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub key: String,
    pub best_model: PathBuf,
    pub final_model: PathBuf,
    pub scaler: PathBuf,
    pub report: PathBuf,
    /// Advisory lock held while this key is being trained.
    pub lock: PathBuf,
}

/// Maps symbols to artifact keys and keys to files under one root.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
    specialized: BTreeSet<String>,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>, specialized: &[String]) -> Self {
        Self {
            root: root.into(),
            specialized: specialized
                .iter()
                .map(|s| s.trim().to_ascii_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn is_specialized(&self, symbol: &str) -> bool {
        self.specialized.contains(&symbol.trim().to_ascii_uppercase())
    }

    /// Key used for `symbol`'s artifacts: the symbol itself when specialized,
    /// `generalized` otherwise.
    pub fn key_for(&self, symbol: &str) -> String {
        let sym = symbol.trim().to_ascii_uppercase();
        if self.specialized.contains(&sym) {
            sym
        } else {
            GENERALIZED_KEY.to_string()
        }
    }

    pub fn resolve(&self, symbol: &str) -> ArtifactPaths {
        self.paths_for_key(&self.key_for(symbol))
    }

    pub fn paths_for_key(&self, key: &str) -> ArtifactPaths {
        let file = format!("{}.json", key);
        ArtifactPaths {
            key: key.to_string(),
            best_model: self.root.join("models").join("best").join(&file),
            final_model: self.root.join("models").join("final").join(&file),
            scaler: self.root.join("scalers").join(&file),
            report: self.root.join("reports").join(&file),
            lock: self.root.join("locks").join(format!("{}.lock", key)),
        }
    }
}

/// Modification times of a model/scaler pair on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArtifactStamp {
    model: SystemTime,
    scaler: SystemTime,
}

impl ArtifactStamp {
    fn read(paths: &ArtifactPaths) -> Option<Self> {
        fn modified(path: &Path) -> Option<SystemTime> {
            std::fs::metadata(path).and_then(|m| m.modified()).ok()
        }
        Some(Self {
            model: modified(&paths.best_model)?,
            scaler: modified(&paths.scaler)?,
        })
    }
}

/// A model and the scaler it was trained against. Immutable once loaded.
#[derive(Debug)]
pub struct LoadedArtifacts {
    pub key: String,
    pub model: ModelArtifact,
    pub scaler: MinMaxScaler,
    stamp: Option<ArtifactStamp>,
}

impl LoadedArtifacts {
    pub fn window_length(&self) -> usize {
        self.model.window_length
    }
}

#[derive(Debug, Clone)]
pub enum ArtifactLookup {
    Found(Arc<LoadedArtifacts>),
    NotFound { key: String, missing: Vec<PathBuf> },
}

/// Read-through cache of loaded (model, scaler) pairs keyed by artifact key.
/// A hit is served only while both files keep the modification times they had
/// when loaded, so a retrain by another process is picked up on next use.
#[derive(Debug)]
pub struct ModelRegistry {
    layout: ArtifactLayout,
    cache: RwLock<HashMap<String, Arc<LoadedArtifacts>>>,
}

impl ModelRegistry {
    pub fn new(layout: ArtifactLayout) -> Self {
        Self {
            layout,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn load(&self, symbol: &str) -> Result<ArtifactLookup> {
        let symbol = normalize_symbol(symbol)?;
        let paths = self.layout.resolve(&symbol);

        let stamp = ArtifactStamp::read(&paths);
        if let Ok(cache) = self.cache.read() {
            if let Some(hit) = cache.get(&paths.key) {
                if stamp.is_some() && hit.stamp == stamp {
                    return Ok(ArtifactLookup::Found(Arc::clone(hit)));
                }
                tracing::debug!(key = %paths.key, "Cached artifacts are stale");
            }
        }

        let missing: Vec<PathBuf> = [&paths.best_model, &paths.scaler]
            .into_iter()
            .filter(|p| !p.exists())
            .cloned()
            .collect();
        if !missing.is_empty() {
            self.invalidate(&paths.key);
            tracing::debug!(
                symbol = %symbol,
                key = %paths.key,
                missing = missing.len(),
                "Artifacts not found"
            );
            return Ok(ArtifactLookup::NotFound {
                key: paths.key,
                missing,
            });
        }

        let model = ModelArtifact::load(&paths.best_model)?;
        let scaler = MinMaxScaler::load(&paths.scaler)?;
        if model.input_features() != scaler.feature_count() {
            return Err(ForecastError::ShapeMismatch {
                key: paths.key,
                expected: model.input_features(),
                actual: scaler.feature_count(),
            });
        }
        tracing::info!(
            key = %paths.key,
            epoch = model.epoch,
            window_length = model.window_length,
            "Loaded model artifacts"
        );

        let loaded = Arc::new(LoadedArtifacts {
            key: paths.key.clone(),
            model,
            scaler,
            stamp,
        });
        let mut cache = self
            .cache
            .write()
            .map_err(|_| ForecastError::Config("artifact cache lock poisoned".to_string()))?;
        cache.insert(paths.key, Arc::clone(&loaded));
        Ok(ArtifactLookup::Found(loaded))
    }

    /// Drop the cached pair for `key` so the next load reads fresh files.
    pub fn invalidate(&self, key: &str) -> bool {
        match self.cache.write() {
            Ok(mut cache) => cache.remove(key).is_some(),
            Err(_) => false,
        }
    }

    pub fn cached_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = match self.cache.read() {
            Ok(cache) => cache.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_for_collapses_unknown_symbols() {
        let layout = ArtifactLayout::new("artifacts", &["AAPL".to_string(), " msft".to_string()]);
        assert_eq!(layout.key_for("aapl"), "AAPL");
        assert_eq!(layout.key_for("MSFT"), "MSFT");
        assert_eq!(layout.key_for("IBM"), GENERALIZED_KEY);
        assert_eq!(
            layout.resolve("aapl").lock,
            PathBuf::from("artifacts/locks/AAPL.lock")
        );
    }

    #[test]
    fn missing_files_are_not_found_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(ArtifactLayout::new(dir.path(), &["AAPL".to_string()]));
        match registry.load("AAPL").unwrap() {
            ArtifactLookup::NotFound { key, missing } => {
                assert_eq!(key, "AAPL");
                assert_eq!(missing.len(), 2);
            }
            other => panic!("unexpected lookup {:?}", other),
        }
        assert!(registry.cached_keys().is_empty());
    }
}
