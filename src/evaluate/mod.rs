use std::str::FromStr;

use log::info;

use crate::error::ModelError;
use crate::model::{Batch, Model};
use crate::normalization::StandardScaler;

/// Determines which degeneracy guards and metric semantics apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetType {
    Classification,
    Regression,
}

impl FromStr for DatasetType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classification" => Ok(DatasetType::Classification),
            "regression" => Ok(DatasetType::Regression),
            _ => Err(ModelError::ConfigError(format!("Unrecognized dataset type: \"{}\"", s))),
        }
    }
}

/// An optional informational sink threaded through evaluation calls. Absent a
/// sink, messages go to the `log` facade.
pub trait InfoSink {
    fn info(&self, msg: &str);
}

fn emit(sink: Option<&dyn InfoSink>, msg: &str) {
    match sink {
        Some(s) => s.info(msg),
        None => info!("{}", msg),
    }
}

/// Scores model predictions per task with `metric`, filtering out missing
/// targets.
///
/// `preds` has shape (examples x tasks); `targets` the same, with `None`
/// marking a label that was never observed. With zero examples the result is
/// `num_tasks` NaN sentinels. A task whose every valid label is missing is
/// skipped outright under regression, so the output can be shorter than
/// `num_tasks`; under classification the all-0s/all-1s guard catches that task
/// first and records NaN. Callers that need positional task alignment must
/// account for skipped tasks.
pub fn evaluate_predictions<F>(
    preds: &[Vec<f32>],
    targets: &[Vec<Option<f32>>],
    num_tasks: usize,
    metric: F,
    dataset_type: DatasetType,
    sink: Option<&dyn InfoSink>,
) -> Vec<f32>
where
    F: Fn(&[f32], &[f32]) -> f32,
{
    if preds.is_empty() {
        return vec![f32::NAN; num_tasks];
    }

    // Filter out empty targets; valid_* have shape (num_tasks, examples)
    let mut valid_preds: Vec<Vec<f32>> = vec![Vec::new(); num_tasks];
    let mut valid_targets: Vec<Vec<f32>> = vec![Vec::new(); num_tasks];

    for j in 0..num_tasks {
        for i in 0..preds.len() {
            if let Some(target) = targets[i][j] {
                valid_preds[j].push(preds[i][j]);
                valid_targets[j].push(target);
            }
        }
    }

    let mut results = Vec::with_capacity(num_tasks);
    for (task_preds, task_targets) in valid_preds.iter().zip(&valid_targets) {
        // binary classification metrics crash when a side is single-class
        if dataset_type == DatasetType::Classification {
            if task_targets.iter().all(|&t| t == 0.0) || task_targets.iter().all(|&t| t != 0.0) {
                emit(sink, "Warning: Found a task with targets all 0s or all 1s");
                results.push(f32::NAN);
                continue;
            }
            if task_preds.iter().all(|&p| p == 0.0) || task_preds.iter().all(|&p| p != 0.0) {
                emit(sink, "Warning: Found a task with predictions all 0s or all 1s");
                results.push(f32::NAN);
                continue;
            }
        }

        if task_targets.is_empty() {
            continue;
        }

        results.push(metric(task_targets, task_preds));
    }

    results
}

/// A finite, per-call-restartable source of prediction batches together with
/// the full target matrix aligned to iteration order.
pub trait EvalSource {
    fn batches(&self) -> Box<dyn Iterator<Item = Batch> + '_>;
    fn targets(&self) -> &[Vec<Option<f32>>];
}

/// In-memory batch source.
pub struct MemorySource {
    batches: Vec<Batch>,
    targets: Vec<Vec<Option<f32>>>,
}

impl MemorySource {
    pub fn new(batches: Vec<Batch>, targets: Vec<Vec<Option<f32>>>) -> Self {
        Self { batches, targets }
    }
}

impl EvalSource for MemorySource {
    fn batches(&self) -> Box<dyn Iterator<Item = Batch> + '_> {
        Box::new(self.batches.iter().cloned())
    }

    fn targets(&self) -> &[Vec<Option<f32>>] {
        &self.targets
    }
}

/// Runs `model` over every batch of `source`, optionally un-scales the raw
/// outputs, and scores the collected predictions with `evaluate_predictions`.
/// Prediction and scaling failures propagate unmodified.
pub fn evaluate<F>(
    model: &dyn Model,
    source: &dyn EvalSource,
    num_tasks: usize,
    metric: F,
    dataset_type: DatasetType,
    scaler: Option<&StandardScaler>,
    sink: Option<&dyn InfoSink>,
) -> Result<Vec<f32>, ModelError>
where
    F: Fn(&[f32], &[f32]) -> f32,
{
    let mut preds: Vec<Vec<f32>> = Vec::new();
    for batch in source.batches() {
        let output = model.predict(&batch)?;
        for i in 0..output.rows() {
            let mut row = output.get_row(i);
            if let Some(scaler) = scaler {
                scaler.inverse_row(&mut row)?;
            }
            preds.push(row);
        }
    }

    Ok(evaluate_predictions(
        &preds,
        source.targets(),
        num_tasks,
        metric,
        dataset_type,
        sink,
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::matrix::DenseMatrix;
    use crate::model::{model, ModelParams};

    fn mae(targets: &[f32], preds: &[f32]) -> f32 {
        targets
            .iter()
            .zip(preds)
            .map(|(t, p)| (t - p).abs())
            .sum::<f32>()
            / targets.len() as f32
    }

    fn sum_metric(targets: &[f32], preds: &[f32]) -> f32 {
        targets.iter().sum::<f32>() + preds.iter().sum::<f32>()
    }

    struct Recorder {
        messages: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                messages: Mutex::new(Vec::new()),
            }
        }
    }

    impl InfoSink for Recorder {
        fn info(&self, msg: &str) {
            self.messages.lock().unwrap().push(msg.to_string());
        }
    }

    #[test]
    fn test_zero_examples_yields_all_nan() {
        let results = evaluate_predictions(&[], &[], 3, mae, DatasetType::Regression, None);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_nan()));
    }

    #[test]
    fn test_all_missing_regression_task_is_omitted() {
        let preds = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let targets = vec![vec![Some(1.0), None], vec![Some(3.0), None]];
        let results = evaluate_predictions(&preds, &targets, 2, mae, DatasetType::Regression, None);
        // task 1 has no valid targets and is skipped, not sentinel-filled
        assert_eq!(results.len(), 1);
        assert!((results[0] - 0.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_task_dropped_from_output() {
        let preds = vec![vec![1.0, 2.0]];
        let targets = vec![vec![Some(1.0), None]];
        let results = evaluate_predictions(&preds, &targets, 2, sum_metric, DatasetType::Regression, None);
        assert_eq!(results.len(), 1);
        assert!((results[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_classification_all_zero_targets_gives_nan() {
        let preds = vec![vec![0.3], vec![0.7]];
        let targets = vec![vec![Some(0.0)], vec![Some(0.0)]];
        let recorder = Recorder::new();
        let results = evaluate_predictions(&preds, &targets, 1, mae, DatasetType::Classification, Some(&recorder));
        assert_eq!(results.len(), 1);
        assert!(results[0].is_nan());
        let messages = recorder.messages.lock().unwrap();
        assert_eq!(messages.as_slice(), &["Warning: Found a task with targets all 0s or all 1s"]);
    }

    #[test]
    fn test_classification_all_one_targets_gives_nan() {
        let preds = vec![vec![0.3], vec![0.7]];
        let targets = vec![vec![Some(1.0)], vec![Some(1.0)]];
        let results = evaluate_predictions(&preds, &targets, 1, mae, DatasetType::Classification, None);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_nan());
    }

    #[test]
    fn test_classification_degenerate_predictions_give_nan() {
        // Mixed targets, but every prediction is nonzero
        let preds = vec![vec![0.3], vec![0.7]];
        let targets = vec![vec![Some(0.0)], vec![Some(1.0)]];
        let recorder = Recorder::new();
        let results = evaluate_predictions(&preds, &targets, 1, mae, DatasetType::Classification, Some(&recorder));
        assert_eq!(results.len(), 1);
        assert!(results[0].is_nan());
        let messages = recorder.messages.lock().unwrap();
        assert_eq!(messages.as_slice(), &["Warning: Found a task with predictions all 0s or all 1s"]);
    }

    #[test]
    fn test_classification_mixed_task_is_scored() {
        let preds = vec![vec![0.0], vec![0.7], vec![0.2]];
        let targets = vec![vec![Some(0.0)], vec![Some(1.0)], vec![Some(0.0)]];
        let results = evaluate_predictions(&preds, &targets, 1, mae, DatasetType::Classification, None);
        assert_eq!(results.len(), 1);
        assert!(!results[0].is_nan());
    }

    #[test]
    fn test_classification_all_missing_task_hits_target_guard() {
        // Vacuously all-0s: under classification an all-missing task records
        // NaN instead of being skipped
        let preds = vec![vec![0.5]];
        let targets = vec![vec![None]];
        let results = evaluate_predictions(&preds, &targets, 1, mae, DatasetType::Classification, None);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_nan());
    }

    #[test]
    fn test_filtering_preserves_example_order() {
        let preds = vec![vec![1.0], vec![2.0], vec![3.0], vec![4.0]];
        let targets = vec![vec![Some(10.0)], vec![None], vec![Some(30.0)], vec![Some(40.0)]];
        let collect_preds = |_t: &[f32], p: &[f32]| {
            assert_eq!(p, &[1.0, 3.0, 4.0]);
            0.0
        };
        let collect_targets = |t: &[f32], _p: &[f32]| {
            assert_eq!(t, &[10.0, 30.0, 40.0]);
            0.0
        };
        evaluate_predictions(&preds, &targets, 1, collect_preds, DatasetType::Regression, None);
        evaluate_predictions(&preds, &targets, 1, collect_targets, DatasetType::Regression, None);
    }

    #[test]
    fn test_earlier_skipped_task_shifts_later_scores() {
        // Documents the ragged-output compatibility behavior: task 0 is
        // skipped, so the single result belongs to task 1
        let preds = vec![vec![1.0, 5.0]];
        let targets = vec![vec![None, Some(5.0)]];
        let results = evaluate_predictions(&preds, &targets, 2, mae, DatasetType::Regression, None);
        assert_eq!(results.len(), 1);
        assert!((results[0] - 0.0).abs() < 1e-6);
    }

    fn fitted_rf() -> Box<dyn Model> {
        let params = ModelParams::new(1, 1).seed(9).num_trees(10);
        let mut m = model("rf", &params).unwrap();
        let rows: Vec<Vec<f32>> = (0..20).map(|i| vec![i as f32 / 20.0]).collect();
        let targets: Vec<f32> = rows.iter().map(|r| 3.0 * r[0]).collect();
        let batch = Batch::Features(DenseMatrix::from_rows(&rows));
        m.fit(&batch, &DenseMatrix::new(20, 1, &targets)).unwrap();
        m
    }

    #[test]
    fn test_evaluate_drives_model_over_batches() {
        let m = fitted_rf();
        let batches = vec![
            Batch::Features(DenseMatrix::new(2, 1, &[0.1, 0.2])),
            Batch::Features(DenseMatrix::new(1, 1, &[0.9])),
        ];
        let targets = vec![vec![Some(0.3)], vec![Some(0.6)], vec![Some(2.7)]];
        let source = MemorySource::new(batches, targets);

        let results = evaluate(m.as_ref(), &source, 1, mae, DatasetType::Regression, None, None).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0] < 1.0, "forest should track 3x reasonably, mae was {}", results[0]);
    }

    #[test]
    fn test_evaluate_applies_inverse_scaling() {
        let m = fitted_rf();
        // Scaler fit on targets 10x the model outputs; after inverse transform
        // the raw ~[0, 3] outputs land in the scaled-up space
        let scale_targets = DenseMatrix::new(3, 1, &[10.0, 20.0, 30.0]);
        let scaler = StandardScaler::fit(&scale_targets).unwrap();

        let batches = vec![Batch::Features(DenseMatrix::new(1, 1, &[0.5]))];
        let targets = vec![vec![Some(20.0)]];
        let source = MemorySource::new(batches, targets);

        let unscaled = evaluate(m.as_ref(), &source, 1, mae, DatasetType::Regression, None, None).unwrap();
        let rescaled = evaluate(m.as_ref(), &source, 1, mae, DatasetType::Regression, Some(&scaler), None).unwrap();
        assert!(rescaled[0] < unscaled[0], "inverse scaling should move predictions toward target space");
    }

    #[test]
    fn test_evaluate_propagates_batch_mismatch() {
        let m = fitted_rf();
        let batches = vec![Batch::Graphs(Vec::new())];
        let targets = vec![vec![Some(1.0)]];
        let source = MemorySource::new(batches, targets);

        let err = evaluate(m.as_ref(), &source, 1, mae, DatasetType::Regression, None, None).unwrap_err();
        assert!(matches!(err, ModelError::InputMismatch(_)));
    }

    #[test]
    fn test_dataset_type_from_str() {
        assert_eq!("classification".parse::<DatasetType>().unwrap(), DatasetType::Classification);
        assert_eq!("regression".parse::<DatasetType>().unwrap(), DatasetType::Regression);
        assert!("multiclass".parse::<DatasetType>().is_err());
    }
}
