use stock_forecast::config::{Activation, LossKind, LstmModelConfig, OptimizerKind};
use stock_forecast::network::ModelArtifact;
use stock_forecast::registry::ArtifactLayout;
use stock_forecast::scaler::MinMaxScaler;
use stock_forecast::sequence::{make_sequences, SequenceSet};
use stock_forecast::trainer::train;
use stock_forecast::ForecastError;

fn hyper(epochs: usize) -> LstmModelConfig {
    LstmModelConfig {
        units: 4,
        dropout: 0.1,
        activation: Activation::Linear,
        optimizer: OptimizerKind::Adam,
        loss: LossKind::Mse,
        epochs,
        batch_size: 8,
        time_step: 5,
        learning_rate: Some(0.01),
        clip_norm: 5.0,
        seed: 11,
    }
}

fn close_scaler() -> MinMaxScaler {
    MinMaxScaler::fit_series("AAPL", "Close", &[90.0, 140.0]).unwrap()
}

fn wave_sets() -> (SequenceSet, SequenceSet) {
    let series: Vec<f64> = (0..90)
        .map(|i| 0.5 + 0.4 * (i as f64 * 0.2).sin())
        .collect();
    let (train_part, test_part) = series.split_at(70);
    (
        make_sequences(train_part, 5).unwrap(),
        make_sequences(test_part, 5).unwrap(),
    )
}

#[test]
fn best_checkpoint_holds_minimum_validation_loss() {
    let dir = tempfile::tempdir().unwrap();
    let paths = ArtifactLayout::new(dir.path(), &["AAPL".to_string()]).paths_for_key("AAPL");
    let (train_set, test_set) = wave_sets();

    let (_, history) = train("AAPL", &train_set, &test_set, &close_scaler(), &hyper(6), &paths).unwrap();
    assert_eq!(history.epochs.len(), 6);
    let min_val = history
        .epochs
        .iter()
        .map(|r| r.val_loss)
        .fold(f64::INFINITY, f64::min);
    assert_eq!(history.best_val_loss, Some(min_val));

    let best = ModelArtifact::load(&paths.best_model).unwrap();
    assert_eq!(Some(best.epoch), history.best_epoch);
    assert!((best.val_loss.unwrap() - min_val).abs() < 1e-12);
    assert_eq!(best.window_length, 5);
    assert_eq!(best.input_features(), 1);

    let last = ModelArtifact::load(&paths.final_model).unwrap();
    assert_eq!(last.epoch, 6);
    assert_ne!(paths.best_model, paths.final_model);
    assert_eq!(MinMaxScaler::load(&paths.scaler).unwrap(), close_scaler());
    assert!(!paths.lock.exists());
}

#[test]
fn same_seed_trains_identically() {
    let (train_set, test_set) = wave_sets();
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let pa = ArtifactLayout::new(a.path(), &[]).paths_for_key("generalized");
    let pb = ArtifactLayout::new(b.path(), &[]).paths_for_key("generalized");
    let (_, ha) = train("generalized", &train_set, &test_set, &close_scaler(), &hyper(2), &pa).unwrap();
    let (_, hb) = train("generalized", &train_set, &test_set, &close_scaler(), &hyper(2), &pb).unwrap();
    assert_eq!(ha, hb);
}

#[test]
fn checkpoint_with_other_width_blocks_retraining() {
    let dir = tempfile::tempdir().unwrap();
    let paths = ArtifactLayout::new(dir.path(), &["AAPL".to_string()]).paths_for_key("AAPL");
    let (train_set, test_set) = wave_sets();
    train("AAPL", &train_set, &test_set, &close_scaler(), &hyper(1), &paths).unwrap();

    let wide = ndarray::Array2::from_shape_fn((30, 2), |(r, c)| (r + c) as f64 / 40.0);
    let wide_train = stock_forecast::sequence::make_feature_sequences(wide.view(), 5, 0).unwrap();
    let wide_test =
        stock_forecast::sequence::make_feature_sequences(wide.slice(ndarray::s![..12, ..]), 5, 0)
            .unwrap();
    let wide_scaler = MinMaxScaler::fit(
        "AAPL",
        &["Close", "Volume"],
        &[vec![90.0, 1.0], vec![140.0, 5.0]],
    )
    .unwrap();
    assert!(matches!(
        train("AAPL", &wide_train, &wide_test, &wide_scaler, &hyper(1), &paths),
        Err(ForecastError::ShapeMismatch {
            expected: 1,
            actual: 2,
            ..
        })
    ));
}

#[test]
fn mismatched_train_and_test_widths_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let paths = ArtifactLayout::new(dir.path(), &[]).paths_for_key("generalized");
    let (train_set, _) = wave_sets();
    let wide = ndarray::Array2::from_shape_fn((12, 3), |(r, c)| (r * c) as f64);
    let wide_test = stock_forecast::sequence::make_feature_sequences(wide.view(), 5, 0).unwrap();
    assert!(matches!(
        train("generalized", &train_set, &wide_test, &close_scaler(), &hyper(1), &paths),
        Err(ForecastError::ShapeMismatch { .. })
    ));
}

#[test]
fn held_lock_refuses_concurrent_training() {
    let dir = tempfile::tempdir().unwrap();
    let paths = ArtifactLayout::new(dir.path(), &["AAPL".to_string()]).paths_for_key("AAPL");
    std::fs::create_dir_all(paths.lock.parent().unwrap()).unwrap();
    std::fs::write(&paths.lock, "4242\n").unwrap();
    let (train_set, test_set) = wave_sets();
    assert!(matches!(
        train("AAPL", &train_set, &test_set, &close_scaler(), &hyper(1), &paths),
        Err(ForecastError::TrainingLocked(_))
    ));
    assert!(paths.lock.exists());
}

#[test]
fn checkpoint_width_is_checked_under_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let paths = ArtifactLayout::new(dir.path(), &["AAPL".to_string()]).paths_for_key("AAPL");
    let (train_set, test_set) = wave_sets();
    train("AAPL", &train_set, &test_set, &close_scaler(), &hyper(1), &paths).unwrap();

    let wide = ndarray::Array2::from_shape_fn((30, 2), |(r, c)| (r + c) as f64 / 40.0);
    let wide_train = stock_forecast::sequence::make_feature_sequences(wide.view(), 5, 0).unwrap();
    let wide_scaler = MinMaxScaler::fit(
        "AAPL",
        &["Close", "Volume"],
        &[vec![90.0, 1.0], vec![140.0, 5.0]],
    )
    .unwrap();

    // While another run holds the key, its checkpoint may be mid-replacement.
    std::fs::write(&paths.lock, "4242\n").unwrap();
    assert!(matches!(
        train("AAPL", &wide_train, &wide_train, &wide_scaler, &hyper(1), &paths),
        Err(ForecastError::TrainingLocked(_))
    ));
    std::fs::remove_file(&paths.lock).unwrap();
    assert!(matches!(
        train("AAPL", &wide_train, &wide_train, &wide_scaler, &hyper(1), &paths),
        Err(ForecastError::ShapeMismatch { .. })
    ));
    assert!(!paths.lock.exists());
}
