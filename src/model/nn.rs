use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::matrix::DenseMatrix;
use crate::random::Randomizer;

use super::{Batch, Model, ModelParams};

/// A multilayer perceptron with ReLU hidden layers and a linear output layer,
/// trained full-batch by gradient descent. The output-layer loss gradient is
/// supplied by the caller so the same core serves MSE and two-output heads.
#[derive(Serialize, Deserialize, Clone)]
pub(crate) struct Mlp {
    weights: Vec<DenseMatrix>,
    biases: Vec<Vec<f32>>,
    learning_rate: f32,
}

impl Mlp {
    pub(crate) fn new(sizes: &[usize], learning_rate: f32, randomizer: &Randomizer) -> Self {
        let mut weights = Vec::with_capacity(sizes.len().saturating_sub(1));
        let mut biases = Vec::with_capacity(sizes.len().saturating_sub(1));
        for layer in 0..sizes.len().saturating_sub(1) {
            let (fan_in, fan_out) = (sizes[layer], sizes[layer + 1]);
            let std_dev = (2.0 / fan_in as f32).sqrt();
            let data: Vec<f32> = (0..fan_in * fan_out).map(|_| randomizer.normal(std_dev)).collect();
            weights.push(DenseMatrix::new(fan_in, fan_out, &data));
            biases.push(vec![0.0; fan_out]);
        }
        Self {
            weights,
            biases,
            learning_rate,
        }
    }

    /// Forward pass returning all activations (including the input) and, per
    /// hidden layer, the combined ReLU/dropout gradient mask.
    fn forward(&self, x: &DenseMatrix, dropout: Option<(f32, &Randomizer)>) -> (Vec<DenseMatrix>, Vec<DenseMatrix>) {
        let num_layers = self.weights.len();
        let mut activations = Vec::with_capacity(num_layers + 1);
        let mut masks = Vec::with_capacity(num_layers.saturating_sub(1));
        activations.push(x.clone());

        for layer in 0..num_layers {
            let mut z = activations[layer].matmul(&self.weights[layer]);
            z.add_row_vector(&self.biases[layer]);

            if layer + 1 == num_layers {
                activations.push(z);
                continue;
            }

            let mut a = DenseMatrix::zeros(z.rows(), z.cols());
            let mut mask = DenseMatrix::zeros(z.rows(), z.cols());
            for i in 0..z.rows() {
                for j in 0..z.cols() {
                    let v = z.at(i, j);
                    let (mut value, mut grad) = if v > 0.0 { (v, 1.0) } else { (0.0, 0.0) };
                    if let Some((rate, randomizer)) = dropout {
                        if randomizer.float32() < rate {
                            value = 0.0;
                            grad = 0.0;
                        } else {
                            // inverted dropout keeps prediction scale unchanged
                            let keep = 1.0 - rate;
                            value /= keep;
                            grad /= keep;
                        }
                    }
                    a.set(i, j, value);
                    mask.set(i, j, grad);
                }
            }
            activations.push(a);
            masks.push(mask);
        }

        (activations, masks)
    }

    /// A single (possibly stochastic) forward pass.
    pub(crate) fn output(&self, x: &DenseMatrix, dropout: Option<(f32, &Randomizer)>) -> DenseMatrix {
        let (mut activations, _) = self.forward(x, dropout);
        activations.pop().expect("forward pass always yields an output activation")
    }

    /// Full-batch gradient descent for `epochs` passes. `grad_out` maps
    /// (output, targets) to the loss gradient at the output layer.
    pub(crate) fn train<F>(
        &mut self,
        x: &DenseMatrix,
        y: &DenseMatrix,
        epochs: usize,
        dropout: Option<(f32, &Randomizer)>,
        grad_out: F,
    ) where
        F: Fn(&DenseMatrix, &DenseMatrix) -> DenseMatrix,
    {
        for epoch in 0..epochs {
            let (activations, masks) = self.forward(x, dropout);
            let output = activations.last().expect("forward pass always yields an output activation");

            if epoch % 20 == 0 {
                debug!("epoch {}: mse {:.6}", epoch, mse_loss(output, y));
            }

            let mut dz = grad_out(output, y);
            for layer in (0..self.weights.len()).rev() {
                let mut dw = activations[layer].transpose().matmul(&dz);
                let db = dz.col_sums();

                let next_dz = if layer > 0 {
                    let mut da = dz.matmul(&self.weights[layer].transpose());
                    da.mul_elem(&masks[layer - 1]);
                    Some(da)
                } else {
                    None
                };

                dw.scale(self.learning_rate);
                self.weights[layer].sub(&dw);
                for (bias, grad) in self.biases[layer].iter_mut().zip(db) {
                    *bias -= self.learning_rate * grad;
                }

                if let Some(da) = next_dz {
                    dz = da;
                }
            }
        }
    }
}

pub(crate) fn mse_loss(output: &DenseMatrix, y: &DenseMatrix) -> f32 {
    let mut sum = 0.0;
    for i in 0..y.rows() {
        for j in 0..y.cols() {
            let diff = output.at(i, j) - y.at(i, j);
            sum += diff * diff;
        }
    }
    sum / (y.rows() as f32).max(1.0)
}

pub(crate) fn mse_grad(output: &DenseMatrix, y: &DenseMatrix) -> DenseMatrix {
    let mut grad = output.clone();
    grad.sub(y);
    grad.scale(2.0 / output.rows() as f32);
    grad
}

/// Gradient for the two-output head: the first T columns are means trained by
/// MSE, the last T are raw variances whose softplus is regressed onto the
/// squared residual of the (detached) mean.
pub(crate) fn two_output_grad(output: &DenseMatrix, y: &DenseMatrix) -> DenseMatrix {
    let n = output.rows() as f32;
    let tasks = y.cols();
    let mut grad = DenseMatrix::zeros(output.rows(), output.cols());
    for i in 0..output.rows() {
        for j in 0..tasks {
            let mean = output.at(i, j);
            let raw = output.at(i, j + tasks);
            let resid = y.at(i, j) - mean;
            grad.set(i, j, 2.0 * (mean - y.at(i, j)) / n);
            grad.set(i, j + tasks, 2.0 * (softplus(raw) - resid * resid) * sigmoid(raw) / n);
        }
    }
    grad
}

pub(crate) fn softplus(x: f32) -> f32 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub(crate) fn check_shapes(
    x: &DenseMatrix,
    targets: &DenseMatrix,
    input_size: usize,
    num_tasks: usize,
) -> Result<(), ModelError> {
    if x.rows() == 0 {
        return Err(ModelError::ConfigError("Cannot fit on an empty batch".to_string()));
    }
    if x.cols() != input_size {
        return Err(ModelError::ConfigError(format!(
            "Expected {} input features, got {}",
            input_size,
            x.cols()
        )));
    }
    if targets.rows() != x.rows() || targets.cols() != num_tasks {
        return Err(ModelError::ConfigError(format!(
            "Expected targets of shape {}x{}, got {}x{}",
            x.rows(),
            num_tasks,
            targets.rows(),
            targets.cols()
        )));
    }
    Ok(())
}

/// Mean of a non-empty set of equally shaped matrices.
pub(crate) fn mean_of(mats: &[DenseMatrix]) -> DenseMatrix {
    let mut mean = mats[0].clone();
    for m in &mats[1..] {
        mean.add(m);
    }
    mean.scale(1.0 / mats.len() as f32);
    mean
}

/// Element-wise population variance around `mean`.
pub(crate) fn variance_of(mats: &[DenseMatrix], mean: &DenseMatrix) -> DenseMatrix {
    let mut var = DenseMatrix::zeros(mean.rows(), mean.cols());
    for m in mats {
        for i in 0..mean.rows() {
            for j in 0..mean.cols() {
                let d = m.at(i, j) - mean.at(i, j);
                var.set(i, j, var.at(i, j) + d * d);
            }
        }
    }
    var.scale(1.0 / mats.len() as f32);
    var
}

/// Point-prediction feed-forward model.
#[derive(Serialize, Deserialize, Clone)]
pub struct NnModel {
    input_size: usize,
    num_tasks: usize,
    hidden_sizes: Vec<usize>,
    epochs: usize,
    learning_rate: f32,
    randomizer: Randomizer,
    net: Option<Mlp>,
}

impl NnModel {
    pub fn new(params: &ModelParams) -> Self {
        Self {
            input_size: params.input_size,
            num_tasks: params.num_tasks,
            hidden_sizes: params.hidden_sizes.clone(),
            epochs: params.epochs,
            learning_rate: params.learning_rate,
            randomizer: Randomizer::new(params.seed),
            net: None,
        }
    }

    fn layer_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![self.input_size];
        sizes.extend_from_slice(&self.hidden_sizes);
        sizes.push(self.num_tasks);
        sizes
    }
}

#[typetag::serde]
impl Model for NnModel {
    fn fit(&mut self, inputs: &Batch, targets: &DenseMatrix) -> Result<(), ModelError> {
        let x = inputs.features()?;
        check_shapes(x, targets, self.input_size, self.num_tasks)?;

        let mut net = Mlp::new(&self.layer_sizes(), self.learning_rate, &self.randomizer);
        net.train(x, targets, self.epochs, None, mse_grad);
        self.net = Some(net);
        Ok(())
    }

    fn predict(&self, inputs: &Batch) -> Result<DenseMatrix, ModelError> {
        let net = self.net.as_ref().ok_or(ModelError::NotFitted)?;
        Ok(net.output(inputs.features()?, None))
    }

    fn uncertainty(&self, _inputs: &Batch) -> Result<Option<DenseMatrix>, ModelError> {
        Ok(None)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// MC-dropout model: dropout during training and at prediction time, where the
/// spread over stochastic forward passes is the uncertainty estimate.
#[derive(Serialize, Deserialize, Clone)]
pub struct NnDropoutModel {
    input_size: usize,
    num_tasks: usize,
    hidden_sizes: Vec<usize>,
    epochs: usize,
    learning_rate: f32,
    dropout_rate: f32,
    dropout_samples: usize,
    randomizer: Randomizer,
    net: Option<Mlp>,
}

impl NnDropoutModel {
    pub fn new(params: &ModelParams) -> Self {
        Self {
            input_size: params.input_size,
            num_tasks: params.num_tasks,
            hidden_sizes: params.hidden_sizes.clone(),
            epochs: params.epochs,
            learning_rate: params.learning_rate,
            dropout_rate: params.dropout_rate,
            dropout_samples: params.dropout_samples.max(1),
            randomizer: Randomizer::new(params.seed),
            net: None,
        }
    }

    fn sample_outputs(&self, inputs: &Batch) -> Result<Vec<DenseMatrix>, ModelError> {
        let net = self.net.as_ref().ok_or(ModelError::NotFitted)?;
        let x = inputs.features()?;
        Ok((0..self.dropout_samples)
            .map(|_| net.output(x, Some((self.dropout_rate, &self.randomizer))))
            .collect())
    }
}

#[typetag::serde]
impl Model for NnDropoutModel {
    fn fit(&mut self, inputs: &Batch, targets: &DenseMatrix) -> Result<(), ModelError> {
        let x = inputs.features()?;
        check_shapes(x, targets, self.input_size, self.num_tasks)?;

        let mut sizes = vec![self.input_size];
        sizes.extend_from_slice(&self.hidden_sizes);
        sizes.push(self.num_tasks);

        let mut net = Mlp::new(&sizes, self.learning_rate, &self.randomizer);
        net.train(x, targets, self.epochs, Some((self.dropout_rate, &self.randomizer)), mse_grad);
        self.net = Some(net);
        Ok(())
    }

    fn predict(&self, inputs: &Batch) -> Result<DenseMatrix, ModelError> {
        let samples = self.sample_outputs(inputs)?;
        Ok(mean_of(&samples))
    }

    fn uncertainty(&self, inputs: &Batch) -> Result<Option<DenseMatrix>, ModelError> {
        let samples = self.sample_outputs(inputs)?;
        let mean = mean_of(&samples);
        Ok(Some(variance_of(&samples, &mean)))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// An ensemble of independently seeded point-prediction networks; member
/// disagreement is the uncertainty estimate.
#[derive(Serialize, Deserialize, Clone)]
pub struct NnEnsembleModel {
    input_size: usize,
    num_tasks: usize,
    hidden_sizes: Vec<usize>,
    epochs: usize,
    learning_rate: f32,
    ensemble_size: usize,
    randomizer: Randomizer,
    members: Vec<Mlp>,
}

impl NnEnsembleModel {
    pub fn new(params: &ModelParams) -> Self {
        Self {
            input_size: params.input_size,
            num_tasks: params.num_tasks,
            hidden_sizes: params.hidden_sizes.clone(),
            epochs: params.epochs,
            learning_rate: params.learning_rate,
            ensemble_size: params.ensemble_size.max(1),
            randomizer: Randomizer::new(params.seed),
            members: Vec::new(),
        }
    }

    fn member_outputs(&self, inputs: &Batch) -> Result<Vec<DenseMatrix>, ModelError> {
        if self.members.is_empty() {
            return Err(ModelError::NotFitted);
        }
        let x = inputs.features()?;
        Ok(self.members.iter().map(|net| net.output(x, None)).collect())
    }
}

#[typetag::serde]
impl Model for NnEnsembleModel {
    fn fit(&mut self, inputs: &Batch, targets: &DenseMatrix) -> Result<(), ModelError> {
        let x = inputs.features()?;
        check_shapes(x, targets, self.input_size, self.num_tasks)?;

        let mut sizes = vec![self.input_size];
        sizes.extend_from_slice(&self.hidden_sizes);
        sizes.push(self.num_tasks);

        let mut members = Vec::with_capacity(self.ensemble_size);
        for k in 0..self.ensemble_size {
            let member_rnd = self.randomizer.derive(k as u64);
            let mut net = Mlp::new(&sizes, self.learning_rate, &member_rnd);
            net.train(x, targets, self.epochs, None, mse_grad);
            members.push(net);
        }
        self.members = members;
        Ok(())
    }

    fn predict(&self, inputs: &Batch) -> Result<DenseMatrix, ModelError> {
        let outputs = self.member_outputs(inputs)?;
        Ok(mean_of(&outputs))
    }

    fn uncertainty(&self, inputs: &Batch) -> Result<Option<DenseMatrix>, ModelError> {
        let outputs = self.member_outputs(inputs)?;
        let mean = mean_of(&outputs);
        Ok(Some(variance_of(&outputs, &mean)))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Mean-variance estimation model: the network emits a mean and a raw variance
/// per task; softplus of the raw head is the uncertainty estimate.
#[derive(Serialize, Deserialize, Clone)]
pub struct NnTwoOutputModel {
    input_size: usize,
    num_tasks: usize,
    hidden_sizes: Vec<usize>,
    epochs: usize,
    learning_rate: f32,
    randomizer: Randomizer,
    net: Option<Mlp>,
}

impl NnTwoOutputModel {
    pub fn new(params: &ModelParams) -> Self {
        Self {
            input_size: params.input_size,
            num_tasks: params.num_tasks,
            hidden_sizes: params.hidden_sizes.clone(),
            epochs: params.epochs,
            learning_rate: params.learning_rate,
            randomizer: Randomizer::new(params.seed),
            net: None,
        }
    }

    fn raw_output(&self, inputs: &Batch) -> Result<DenseMatrix, ModelError> {
        let net = self.net.as_ref().ok_or(ModelError::NotFitted)?;
        Ok(net.output(inputs.features()?, None))
    }
}

#[typetag::serde]
impl Model for NnTwoOutputModel {
    fn fit(&mut self, inputs: &Batch, targets: &DenseMatrix) -> Result<(), ModelError> {
        let x = inputs.features()?;
        check_shapes(x, targets, self.input_size, self.num_tasks)?;

        let mut sizes = vec![self.input_size];
        sizes.extend_from_slice(&self.hidden_sizes);
        sizes.push(2 * self.num_tasks);

        let mut net = Mlp::new(&sizes, self.learning_rate, &self.randomizer);
        net.train(x, targets, self.epochs, None, two_output_grad);
        self.net = Some(net);
        Ok(())
    }

    fn predict(&self, inputs: &Batch) -> Result<DenseMatrix, ModelError> {
        let raw = self.raw_output(inputs)?;
        let mut means = DenseMatrix::zeros(raw.rows(), self.num_tasks);
        for i in 0..raw.rows() {
            for j in 0..self.num_tasks {
                means.set(i, j, raw.at(i, j));
            }
        }
        Ok(means)
    }

    fn uncertainty(&self, inputs: &Batch) -> Result<Option<DenseMatrix>, ModelError> {
        let raw = self.raw_output(inputs)?;
        let mut vars = DenseMatrix::zeros(raw.rows(), self.num_tasks);
        for i in 0..raw.rows() {
            for j in 0..self.num_tasks {
                vars.set(i, j, softplus(raw.at(i, j + self.num_tasks)));
            }
        }
        Ok(Some(vars))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
