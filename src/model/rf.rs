use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::matrix::DenseMatrix;
use crate::random::Randomizer;

use super::{Batch, Model, ModelParams};

/// Bootstrap-aggregated regression trees, one forest per task. Tree variance
/// across the forest doubles as the uncertainty estimate.
#[derive(Serialize, Deserialize, Clone)]
pub struct RandomForestModel {
    num_trees: usize,
    max_depth: usize,
    min_leaf: usize,
    num_tasks: usize,
    randomizer: Randomizer,
    forests: Vec<Vec<Node>>,
}

#[derive(Serialize, Deserialize, Clone)]
enum Node {
    Leaf {
        value: f32,
    },
    Split {
        feature: usize,
        threshold: f32,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn predict(&self, row: &[f32]) -> f32 {
        match self {
            Node::Leaf { value } => *value,
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if row[*feature] <= *threshold {
                    left.predict(row)
                } else {
                    right.predict(row)
                }
            }
        }
    }
}

struct TreeConfig {
    max_depth: usize,
    min_leaf: usize,
}

impl RandomForestModel {
    pub fn new(params: &ModelParams) -> Self {
        Self {
            num_trees: params.num_trees,
            max_depth: params.max_depth,
            min_leaf: params.min_leaf.max(1),
            num_tasks: params.num_tasks,
            randomizer: Randomizer::new(params.seed),
            forests: Vec::new(),
        }
    }

    fn grow_tree(&self, x: &DenseMatrix, y: &[f32], indices: &[usize], depth: usize, cfg: &TreeConfig) -> Node {
        let mean = indices.iter().map(|&i| y[i]).sum::<f32>() / indices.len() as f32;

        if depth >= cfg.max_depth || indices.len() < 2 * cfg.min_leaf {
            return Node::Leaf { value: mean };
        }
        if indices.iter().all(|&i| (y[i] - y[indices[0]]).abs() < f32::EPSILON) {
            return Node::Leaf { value: mean };
        }

        match self.best_split(x, y, indices, cfg) {
            None => Node::Leaf { value: mean },
            Some((feature, threshold)) => {
                let (left_idx, right_idx): (Vec<usize>, Vec<usize>) =
                    indices.iter().copied().partition(|&i| x.at(i, feature) <= threshold);
                Node::Split {
                    feature,
                    threshold,
                    left: Box::new(self.grow_tree(x, y, &left_idx, depth + 1, cfg)),
                    right: Box::new(self.grow_tree(x, y, &right_idx, depth + 1, cfg)),
                }
            }
        }
    }

    /// Picks the variance-minimizing split over a random sqrt-sized feature subset.
    fn best_split(&self, x: &DenseMatrix, y: &[f32], indices: &[usize], cfg: &TreeConfig) -> Option<(usize, f32)> {
        let num_features = x.cols();
        let num_candidates = ((num_features as f32).sqrt().ceil() as usize).clamp(1, num_features);
        let candidates = self.randomizer.perm(num_features);

        let mut best: Option<(f32, usize, f32)> = None;

        for &feature in candidates.iter().take(num_candidates) {
            let mut pairs: Vec<(f32, f32)> = indices.iter().map(|&i| (x.at(i, feature), y[i])).collect();
            pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

            let total: f32 = pairs.iter().map(|p| p.1).sum();
            let total_sq: f32 = pairs.iter().map(|p| p.1 * p.1).sum();
            let n = pairs.len();

            let mut left_sum = 0.0;
            let mut left_sq = 0.0;
            for k in 0..n - 1 {
                left_sum += pairs[k].1;
                left_sq += pairs[k].1 * pairs[k].1;

                if pairs[k].0 == pairs[k + 1].0 {
                    continue;
                }
                let n_left = k + 1;
                let n_right = n - n_left;
                if n_left < cfg.min_leaf || n_right < cfg.min_leaf {
                    continue;
                }

                let right_sum = total - left_sum;
                let right_sq = total_sq - left_sq;
                let sse = (left_sq - left_sum * left_sum / n_left as f32)
                    + (right_sq - right_sum * right_sum / n_right as f32);

                if best.map_or(true, |(best_sse, _, _)| sse < best_sse) {
                    let threshold = (pairs[k].0 + pairs[k + 1].0) / 2.0;
                    best = Some((sse, feature, threshold));
                }
            }
        }

        best.map(|(_, feature, threshold)| (feature, threshold))
    }

    /// Per-task tree predictions for one example row.
    fn tree_values(&self, row: &[f32], task: usize) -> Vec<f32> {
        self.forests[task].iter().map(|tree| tree.predict(row)).collect()
    }

    fn check_fitted(&self) -> Result<(), ModelError> {
        if self.forests.is_empty() {
            return Err(ModelError::NotFitted);
        }
        Ok(())
    }
}

#[typetag::serde]
impl Model for RandomForestModel {
    fn fit(&mut self, inputs: &Batch, targets: &DenseMatrix) -> Result<(), ModelError> {
        let x = inputs.features()?;
        let n = x.rows();
        if n == 0 {
            return Err(ModelError::ConfigError("Cannot fit on an empty batch".to_string()));
        }
        if targets.rows() != n || targets.cols() != self.num_tasks {
            return Err(ModelError::ConfigError(format!(
                "Expected targets of shape {}x{}, got {}x{}",
                n,
                self.num_tasks,
                targets.rows(),
                targets.cols()
            )));
        }

        let cfg = TreeConfig {
            max_depth: self.max_depth,
            min_leaf: self.min_leaf,
        };

        let mut forests = Vec::with_capacity(self.num_tasks);
        for task in 0..self.num_tasks {
            let y: Vec<f32> = (0..n).map(|i| targets.at(i, task)).collect();
            let mut forest = Vec::with_capacity(self.num_trees);
            for _ in 0..self.num_trees {
                let sample: Vec<usize> = (0..n).map(|_| self.randomizer.index(n)).collect();
                forest.push(self.grow_tree(x, &y, &sample, 0, &cfg));
            }
            forests.push(forest);
        }
        self.forests = forests;
        Ok(())
    }

    fn predict(&self, inputs: &Batch) -> Result<DenseMatrix, ModelError> {
        self.check_fitted()?;
        let x = inputs.features()?;
        let mut preds = DenseMatrix::zeros(x.rows(), self.num_tasks);
        for i in 0..x.rows() {
            let row = x.get_row(i);
            for task in 0..self.num_tasks {
                let values = self.tree_values(&row, task);
                preds.set(i, task, values.iter().sum::<f32>() / values.len() as f32);
            }
        }
        Ok(preds)
    }

    fn uncertainty(&self, inputs: &Batch) -> Result<Option<DenseMatrix>, ModelError> {
        self.check_fitted()?;
        let x = inputs.features()?;
        let mut vars = DenseMatrix::zeros(x.rows(), self.num_tasks);
        for i in 0..x.rows() {
            let row = x.get_row(i);
            for task in 0..self.num_tasks {
                let values = self.tree_values(&row, task);
                let mean = values.iter().sum::<f32>() / values.len() as f32;
                let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / values.len() as f32;
                vars.set(i, task, var);
            }
        }
        Ok(Some(vars))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
