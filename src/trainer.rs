use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::LstmModelConfig;
use crate::error::{ForecastError, Result};
use crate::network::{mean_loss, LstmRegressor, ModelArtifact, Optimizer, RegressorGrads};
use crate::registry::ArtifactPaths;
use crate::scaler::MinMaxScaler;
use crate::sequence::SequenceSet;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    /// Mean training loss over the epoch's mini-batches (dropout active).
    pub loss: f64,
    pub val_loss: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
}

impl TrainingHistory {
    fn record(&mut self, record: EpochRecord) -> bool {
        let improved = self
            .best_val_loss
            .map(|best| record.val_loss < best)
            .unwrap_or(true);
        if improved {
            self.best_epoch = Some(record.epoch);
            self.best_val_loss = Some(record.val_loss);
        }
        self.epochs.push(record);
        improved
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }
}

/// Exclusive lock file for one artifact key. Removed on drop.
#[derive(Debug)]
pub struct TrainingLock {
    path: PathBuf,
}

impl TrainingLock {
    pub fn acquire(key: &str, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ForecastError::TrainingLocked(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for TrainingLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release training lock");
        }
    }
}

/// Refuse to overwrite a checkpoint trained on a different feature width.
pub fn check_existing_checkpoint(key: &str, paths: &ArtifactPaths, feature_count: usize) -> Result<()> {
    if !paths.best_model.exists() {
        return Ok(());
    }
    let existing = ModelArtifact::load(&paths.best_model)?;
    if existing.input_features() != feature_count {
        return Err(ForecastError::ShapeMismatch {
            key: key.to_string(),
            expected: existing.input_features(),
            actual: feature_count,
        });
    }
    Ok(())
}

fn validate_sets(key: &str, train_set: &SequenceSet, test_set: &SequenceSet) -> Result<()> {
    train_set.require_non_empty(key)?;
    test_set.require_non_empty(key)?;
    train_set.check_consistent(key)?;
    test_set.check_consistent(key)?;
    if train_set.feature_count() != test_set.feature_count() {
        return Err(ForecastError::ShapeMismatch {
            key: key.to_string(),
            expected: train_set.feature_count(),
            actual: test_set.feature_count(),
        });
    }
    if train_set.window_length() != test_set.window_length() {
        return Err(ForecastError::Config(format!(
            "{}: train windows have length {} but test windows have {}",
            key,
            train_set.window_length(),
            test_set.window_length()
        )));
    }
    Ok(())
}

/// Checkpoints and scaler for one run, written beside their live paths.
/// Nothing replaces a live artifact until `commit`; dropping an uncommitted
/// set removes the staged files.
#[derive(Debug)]
struct StagedArtifacts {
    best_model: PathBuf,
    final_model: PathBuf,
    scaler: PathBuf,
    committed: bool,
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl StagedArtifacts {
    fn new(paths: &ArtifactPaths) -> Self {
        Self {
            best_model: sibling(&paths.best_model, ".staged"),
            final_model: sibling(&paths.final_model, ".staged"),
            scaler: sibling(&paths.scaler, ".staged"),
            committed: false,
        }
    }

    /// Move every staged file into place. If any move fails, the files already
    /// replaced are restored so the live model and scaler stay a pair.
    fn commit(mut self, key: &str, paths: &ArtifactPaths) -> Result<()> {
        let moves = [
            (self.final_model.clone(), paths.final_model.clone()),
            (self.best_model.clone(), paths.best_model.clone()),
            (self.scaler.clone(), paths.scaler.clone()),
        ];
        let mut replaced: Vec<(PathBuf, Option<PathBuf>)> = Vec::new();
        for (staged, live) in moves {
            match swap_in(&staged, &live) {
                Ok(backup) => replaced.push((live, backup)),
                Err(e) => {
                    tracing::warn!(key, path = %live.display(), error = %e, "Artifact commit failed, restoring previous files");
                    restore(&replaced);
                    return Err(e.into());
                }
            }
        }
        for backup in replaced.iter().filter_map(|(_, b)| b.as_ref()) {
            if let Err(e) = std::fs::remove_file(backup) {
                tracing::warn!(path = %backup.display(), error = %e, "Failed to remove previous artifact");
            }
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedArtifacts {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for path in [&self.best_model, &self.final_model, &self.scaler] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove staged artifact"),
            }
        }
    }
}

/// Rename `staged` over `live`, keeping the previous file as a backup.
fn swap_in(staged: &Path, live: &Path) -> std::io::Result<Option<PathBuf>> {
    let backup = if live.is_file() {
        let backup = sibling(live, ".prev");
        std::fs::rename(live, &backup)?;
        Some(backup)
    } else {
        None
    };
    if let Err(e) = std::fs::rename(staged, live) {
        if let Some(backup) = &backup {
            if let Err(undo) = std::fs::rename(backup, live) {
                tracing::warn!(path = %live.display(), error = %undo, "Failed to restore previous artifact");
            }
        }
        return Err(e);
    }
    Ok(backup)
}

fn restore(replaced: &[(PathBuf, Option<PathBuf>)]) {
    for (live, backup) in replaced.iter().rev() {
        let undone = match backup {
            Some(backup) => std::fs::rename(backup, live),
            None => std::fs::remove_file(live),
        };
        if let Err(e) = undone {
            tracing::warn!(path = %live.display(), error = %e, "Failed to restore previous artifact");
        }
    }
}

/// Fit a fresh network on `train_set`, validating on `test_set` after every
/// epoch. The best-so-far network, the last epoch's network and `scaler` are
/// staged while the key's lock is held and only replace the live artifacts
/// once every epoch has finished. A failed run leaves the previous pair intact.
pub fn train(
    key: &str,
    train_set: &SequenceSet,
    test_set: &SequenceSet,
    scaler: &MinMaxScaler,
    hyper: &LstmModelConfig,
    paths: &ArtifactPaths,
) -> Result<(LstmRegressor, TrainingHistory)> {
    validate_sets(key, train_set, test_set)?;
    let features = train_set.feature_count();
    let window_length = train_set.window_length();
    if scaler.feature_count() != features {
        return Err(ForecastError::ShapeMismatch {
            key: key.to_string(),
            expected: scaler.feature_count(),
            actual: features,
        });
    }

    let _lock = TrainingLock::acquire(key, &paths.lock)?;
    check_existing_checkpoint(key, paths, features)?;
    let staged = StagedArtifacts::new(paths);

    let mut rng = StdRng::seed_from_u64(hyper.seed);
    let mut model = LstmRegressor::new(features, hyper.units, hyper.dropout, hyper.activation, &mut rng);
    let mut optimizer = Optimizer::new(hyper.optimizer, hyper.learning_rate);
    let mut history = TrainingHistory::default();
    let mut order: Vec<usize> = (0..train_set.len()).collect();

    tracing::info!(
        key,
        train_windows = train_set.len(),
        test_windows = test_set.len(),
        window_length,
        features,
        units = hyper.units,
        epochs = hyper.epochs,
        learning_rate = optimizer.learning_rate(),
        "Training started"
    );

    for epoch in 1..=hyper.epochs {
        order.shuffle(&mut rng);
        let mut loss_sum = 0.0;
        for batch in order.chunks(hyper.batch_size) {
            let weight = 1.0 / batch.len() as f64;
            let mut grads = RegressorGrads::zeros_like(&model);
            for &idx in batch {
                loss_sum += model.accumulate_sample(
                    train_set.window(idx),
                    train_set.targets[idx],
                    hyper.loss,
                    weight,
                    &mut rng,
                    &mut grads,
                );
            }
            grads.clip(hyper.clip_norm);
            model.apply_gradients(&grads, &mut optimizer);
        }

        let loss = loss_sum / train_set.len() as f64;
        let val_loss = mean_loss(&model, &test_set.inputs, &test_set.targets, hyper.loss)?;
        if !loss.is_finite() || !val_loss.is_finite() || !model.is_finite() {
            return Err(ForecastError::TrainingDiverged {
                key: key.to_string(),
                epoch,
            });
        }

        let improved = history.record(EpochRecord {
            epoch,
            loss,
            val_loss,
        });
        if improved {
            ModelArtifact::new(key, window_length, epoch, val_loss, model.clone()).persist(&staged.best_model)?;
        }
        tracing::info!(key, epoch, loss, val_loss, improved, "Epoch finished");
    }

    let last_val = history.last().map(|r| r.val_loss).unwrap_or(f64::NAN);
    ModelArtifact::new(key, window_length, hyper.epochs, last_val, model.clone()).persist(&staged.final_model)?;
    scaler.persist(&staged.scaler)?;
    staged.commit(key, paths)?;
    tracing::info!(
        key,
        best_epoch = ?history.best_epoch,
        best_val_loss = ?history.best_val_loss,
        "Training finished"
    );
    Ok((model, history))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ArtifactLayout;

    #[test]
    fn second_lock_on_same_key_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks/AAPL.lock");
        let first = TrainingLock::acquire("AAPL", &path).unwrap();
        assert!(matches!(
            TrainingLock::acquire("AAPL", &path),
            Err(ForecastError::TrainingLocked(_))
        ));
        drop(first);
        assert!(!path.exists());
        assert!(TrainingLock::acquire("AAPL", &path).is_ok());
    }

    #[test]
    fn history_tracks_strict_improvements_only() {
        let mut history = TrainingHistory::default();
        assert!(history.record(EpochRecord { epoch: 1, loss: 1.0, val_loss: 0.5 }));
        assert!(!history.record(EpochRecord { epoch: 2, loss: 0.9, val_loss: 0.5 }));
        assert!(history.record(EpochRecord { epoch: 3, loss: 0.8, val_loss: 0.4 }));
        assert_eq!(history.best_epoch, Some(3));
        assert_eq!(history.best_val_loss, Some(0.4));
    }

    #[test]
    fn empty_sets_are_rejected_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactLayout::new(dir.path(), &[]).paths_for_key("AAPL");
        let empty = SequenceSet::empty(5, 1);
        let hyper: LstmModelConfig = toml::from_str(
            r#"
units = 2
dropout = 0.0
activation = "linear"
optimizer = "adam"
loss = "mse"
epochs = 1
batch_size = 4
"#,
        )
        .unwrap();
        let scaler = MinMaxScaler::fit_series("AAPL", "Close", &[1.0, 2.0]).unwrap();
        assert!(matches!(
            train("AAPL", &empty, &empty, &scaler, &hyper, &paths),
            Err(ForecastError::NotEnoughData { .. })
        ));
        assert!(!paths.best_model.exists());
        assert!(!paths.lock.exists());
    }

    #[test]
    fn uncommitted_staging_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactLayout::new(dir.path(), &[]).paths_for_key("AAPL");
        let staged = StagedArtifacts::new(&paths);
        std::fs::create_dir_all(staged.best_model.parent().unwrap()).unwrap();
        std::fs::write(&staged.best_model, "{}").unwrap();
        let leftover = staged.best_model.clone();
        drop(staged);
        assert!(!leftover.exists());
        assert!(!paths.best_model.exists());
    }

    #[test]
    fn failed_commit_restores_previous_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactLayout::new(dir.path(), &[]).paths_for_key("AAPL");
        for live in [&paths.best_model, &paths.final_model] {
            std::fs::create_dir_all(live.parent().unwrap()).unwrap();
            std::fs::write(live, "old").unwrap();
        }
        // A directory where the scaler belongs cannot be replaced, so the
        // last move fails after both checkpoints were swapped in.
        std::fs::create_dir_all(&paths.scaler).unwrap();

        let staged = StagedArtifacts::new(&paths);
        for path in [&staged.best_model, &staged.final_model, &staged.scaler] {
            std::fs::write(path, "new").unwrap();
        }
        assert!(staged.commit("AAPL", &paths).is_err());
        assert_eq!(std::fs::read_to_string(&paths.best_model).unwrap(), "old");
        assert_eq!(std::fs::read_to_string(&paths.final_model).unwrap(), "old");
        assert!(paths.scaler.is_dir());
        assert!(!sibling(&paths.best_model, ".staged").exists());
        assert!(!sibling(&paths.best_model, ".prev").exists());
        assert!(!sibling(&paths.scaler, ".staged").exists());
    }

    #[test]
    fn commit_replaces_all_three_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactLayout::new(dir.path(), &[]).paths_for_key("MSFT");
        std::fs::create_dir_all(paths.scaler.parent().unwrap()).unwrap();
        std::fs::write(&paths.scaler, "old").unwrap();

        let staged = StagedArtifacts::new(&paths);
        for path in [&staged.best_model, &staged.final_model, &staged.scaler] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, "new").unwrap();
        }
        staged.commit("MSFT", &paths).unwrap();
        for live in [&paths.best_model, &paths.final_model, &paths.scaler] {
            assert_eq!(std::fs::read_to_string(live).unwrap(), "new");
        }
        assert!(!sibling(&paths.scaler, ".prev").exists());
    }
}
