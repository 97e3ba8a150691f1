use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::matrix::DenseMatrix;
use crate::random::Randomizer;

use super::nn::{check_shapes, mean_of, mse_grad, softplus, two_output_grad, variance_of, Mlp};
use super::{Batch, Model, ModelParams};

/// A molecule as an undirected graph: one feature vector per atom and a bond
/// list of atom-index pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoleculeGraph {
    pub atom_features: Vec<Vec<f32>>,
    pub bonds: Vec<(usize, usize)>,
}

impl MoleculeGraph {
    pub fn new(atom_features: Vec<Vec<f32>>, bonds: Vec<(usize, usize)>) -> Self {
        Self { atom_features, bonds }
    }

    pub fn num_atoms(&self) -> usize {
        self.atom_features.len()
    }
}

/// Fixed random-projection message passing: each round sums neighbor states
/// into every atom and projects through a seeded, untrained weight matrix with
/// a ReLU. Mean readout over atoms yields the molecule embedding.
#[derive(Serialize, Deserialize, Clone)]
struct MessagePasser {
    atom_size: usize,
    message_size: usize,
    weights: Vec<DenseMatrix>,
}

impl MessagePasser {
    fn new(atom_size: usize, message_size: usize, depth: usize, randomizer: &Randomizer) -> Self {
        let mut weights = Vec::with_capacity(depth.max(1));
        for round in 0..depth.max(1) {
            let fan_in = if round == 0 { atom_size } else { message_size };
            let std_dev = (1.0 / fan_in as f32).sqrt();
            let data: Vec<f32> = (0..fan_in * message_size).map(|_| randomizer.normal(std_dev)).collect();
            weights.push(DenseMatrix::new(fan_in, message_size, &data));
        }
        Self {
            atom_size,
            message_size,
            weights,
        }
    }

    fn encode(&self, graph: &MoleculeGraph) -> Result<Vec<f32>, ModelError> {
        let atoms = graph.num_atoms();
        if atoms == 0 {
            return Ok(vec![0.0; self.message_size]);
        }
        for row in &graph.atom_features {
            if row.len() != self.atom_size {
                return Err(ModelError::InputMismatch(format!(
                    "Expected {} atom features, got {}",
                    self.atom_size,
                    row.len()
                )));
            }
        }
        for &(u, v) in &graph.bonds {
            if u >= atoms || v >= atoms {
                return Err(ModelError::InputMismatch(format!(
                    "Bond ({}, {}) references an atom out of range for a {}-atom molecule",
                    u, v, atoms
                )));
            }
        }

        let mut hidden = DenseMatrix::from_rows(&graph.atom_features);
        for weight in &self.weights {
            // message: own state plus the sum of neighbor states
            let mut message = hidden.clone();
            for &(u, v) in &graph.bonds {
                for k in 0..hidden.cols() {
                    message.set(u, k, message.at(u, k) + hidden.at(v, k));
                    message.set(v, k, message.at(v, k) + hidden.at(u, k));
                }
            }
            hidden = message.matmul(weight).map(|x| x.max(0.0));
        }

        let mut readout = vec![0.0; self.message_size];
        for i in 0..atoms {
            for (k, slot) in readout.iter_mut().enumerate() {
                *slot += hidden.at(i, k);
            }
        }
        for slot in readout.iter_mut() {
            *slot /= atoms as f32;
        }
        Ok(readout)
    }

    fn encode_batch(&self, graphs: &[MoleculeGraph]) -> Result<DenseMatrix, ModelError> {
        let mut rows = Vec::with_capacity(graphs.len());
        for graph in graphs {
            rows.push(self.encode(graph)?);
        }
        if rows.is_empty() {
            return Ok(DenseMatrix::zeros(0, self.message_size));
        }
        let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Ok(DenseMatrix::new(graphs.len(), self.message_size, &flat))
    }
}

/// Message-passing model: graph embedding followed by a trained MLP head.
#[derive(Serialize, Deserialize, Clone)]
pub struct MpnModel {
    num_tasks: usize,
    hidden_sizes: Vec<usize>,
    epochs: usize,
    learning_rate: f32,
    message_size: usize,
    encoder: MessagePasser,
    randomizer: Randomizer,
    head: Option<Mlp>,
}

impl MpnModel {
    pub fn new(params: &ModelParams) -> Self {
        let randomizer = Randomizer::new(params.seed);
        let encoder = MessagePasser::new(params.input_size, params.message_size, params.message_depth, &randomizer);
        Self {
            num_tasks: params.num_tasks,
            hidden_sizes: params.hidden_sizes.clone(),
            epochs: params.epochs,
            learning_rate: params.learning_rate,
            message_size: params.message_size,
            encoder,
            randomizer,
            head: None,
        }
    }

    fn head_sizes(&self, output_size: usize) -> Vec<usize> {
        let mut sizes = vec![self.message_size];
        sizes.extend_from_slice(&self.hidden_sizes);
        sizes.push(output_size);
        sizes
    }
}

#[typetag::serde]
impl Model for MpnModel {
    fn fit(&mut self, inputs: &Batch, targets: &DenseMatrix) -> Result<(), ModelError> {
        let x = self.encoder.encode_batch(inputs.graphs()?)?;
        check_shapes(&x, targets, self.message_size, self.num_tasks)?;

        let mut head = Mlp::new(&self.head_sizes(self.num_tasks), self.learning_rate, &self.randomizer);
        head.train(&x, targets, self.epochs, None, mse_grad);
        self.head = Some(head);
        Ok(())
    }

    fn predict(&self, inputs: &Batch) -> Result<DenseMatrix, ModelError> {
        let head = self.head.as_ref().ok_or(ModelError::NotFitted)?;
        let x = self.encoder.encode_batch(inputs.graphs()?)?;
        Ok(head.output(&x, None))
    }

    fn uncertainty(&self, _inputs: &Batch) -> Result<Option<DenseMatrix>, ModelError> {
        Ok(None)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// MC-dropout variant of the message-passing model.
#[derive(Serialize, Deserialize, Clone)]
pub struct MpnDropoutModel {
    num_tasks: usize,
    hidden_sizes: Vec<usize>,
    epochs: usize,
    learning_rate: f32,
    dropout_rate: f32,
    dropout_samples: usize,
    message_size: usize,
    encoder: MessagePasser,
    randomizer: Randomizer,
    head: Option<Mlp>,
}

impl MpnDropoutModel {
    pub fn new(params: &ModelParams) -> Self {
        let randomizer = Randomizer::new(params.seed);
        let encoder = MessagePasser::new(params.input_size, params.message_size, params.message_depth, &randomizer);
        Self {
            num_tasks: params.num_tasks,
            hidden_sizes: params.hidden_sizes.clone(),
            epochs: params.epochs,
            learning_rate: params.learning_rate,
            dropout_rate: params.dropout_rate,
            dropout_samples: params.dropout_samples.max(1),
            message_size: params.message_size,
            encoder,
            randomizer,
            head: None,
        }
    }

    fn sample_outputs(&self, inputs: &Batch) -> Result<Vec<DenseMatrix>, ModelError> {
        let head = self.head.as_ref().ok_or(ModelError::NotFitted)?;
        let x = self.encoder.encode_batch(inputs.graphs()?)?;
        Ok((0..self.dropout_samples)
            .map(|_| head.output(&x, Some((self.dropout_rate, &self.randomizer))))
            .collect())
    }
}

#[typetag::serde]
impl Model for MpnDropoutModel {
    fn fit(&mut self, inputs: &Batch, targets: &DenseMatrix) -> Result<(), ModelError> {
        let x = self.encoder.encode_batch(inputs.graphs()?)?;
        check_shapes(&x, targets, self.message_size, self.num_tasks)?;

        let mut sizes = vec![self.message_size];
        sizes.extend_from_slice(&self.hidden_sizes);
        sizes.push(self.num_tasks);

        let mut head = Mlp::new(&sizes, self.learning_rate, &self.randomizer);
        head.train(&x, targets, self.epochs, Some((self.dropout_rate, &self.randomizer)), mse_grad);
        self.head = Some(head);
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

/// Mean-variance estimation variant of the message-passing model.
#[derive(Serialize, Deserialize, Clone)]
pub struct MpnTwoOutputModel {
    num_tasks: usize,
    hidden_sizes: Vec<usize>,
    epochs: usize,
    learning_rate: f32,
    message_size: usize,
    encoder: MessagePasser,
    randomizer: Randomizer,
    head: Option<Mlp>,
}

impl MpnTwoOutputModel {
    pub fn new(params: &ModelParams) -> Self {
        let randomizer = Randomizer::new(params.seed);
        let encoder = MessagePasser::new(params.input_size, params.message_size, params.message_depth, &randomizer);
        Self {
            num_tasks: params.num_tasks,
            hidden_sizes: params.hidden_sizes.clone(),
            epochs: params.epochs,
            learning_rate: params.learning_rate,
            message_size: params.message_size,
            encoder,
            randomizer,
            head: None,
        }
    }

    fn raw_output(&self, inputs: &Batch) -> Result<DenseMatrix, ModelError> {
        let head = self.head.as_ref().ok_or(ModelError::NotFitted)?;
        let x = self.encoder.encode_batch(inputs.graphs()?)?;
        Ok(head.output(&x, None))
    }
}

#[typetag::serde]
impl Model for MpnTwoOutputModel {
    fn fit(&mut self, inputs: &Batch, targets: &DenseMatrix) -> Result<(), ModelError> {
        let x = self.encoder.encode_batch(inputs.graphs()?)?;
        check_shapes(&x, targets, self.message_size, self.num_tasks)?;

        let mut sizes = vec![self.message_size];
        sizes.extend_from_slice(&self.hidden_sizes);
        sizes.push(2 * self.num_tasks);

        let mut head = Mlp::new(&sizes, self.learning_rate, &self.randomizer);
        head.train(&x, targets, self.epochs, None, two_output_grad);
        self.head = Some(head);
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

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: usize, feature: f32) -> MoleculeGraph {
        let atom_features = vec![vec![feature, 1.0]; n];
        let bonds = (0..n.saturating_sub(1)).map(|i| (i, i + 1)).collect();
        MoleculeGraph::new(atom_features, bonds)
    }

    fn graph_data() -> (Batch, DenseMatrix) {
        let mut graphs = Vec::new();
        let mut targets = Vec::new();
        for i in 0..12 {
            let feature = i as f32 / 12.0;
            graphs.push(chain(4, feature));
            targets.push(feature);
        }
        (Batch::Graphs(graphs), DenseMatrix::new(12, 1, &targets))
    }

    fn quick_params() -> ModelParams {
        ModelParams::new(2, 1)
            .seed(23)
            .hidden_sizes(&[16])
            .epochs(500)
            .learning_rate(0.02)
            .message_size(8)
            .message_depth(2)
    }

    #[test]
    fn test_mpn_fits_and_orders_predictions() {
        let mut model = MpnModel::new(&quick_params());
        let (inputs, targets) = graph_data();
        model.fit(&inputs, &targets).unwrap();

        let probe = Batch::Graphs(vec![chain(4, 0.1), chain(4, 0.9)]);
        let preds = model.predict(&probe).unwrap();
        assert!(
            preds.at(0, 0) < preds.at(1, 0),
            "higher atom features should predict higher, got {} vs {}",
            preds.at(0, 0),
            preds.at(1, 0)
        );
    }

    #[test]
    fn test_encoder_rejects_bad_bond() {
        let encoder = MessagePasser::new(2, 8, 2, &Randomizer::new(Some(1)));
        let graph = MoleculeGraph::new(vec![vec![0.0, 0.0]], vec![(0, 3)]);
        assert!(matches!(encoder.encode(&graph), Err(ModelError::InputMismatch(_))));
    }

    #[test]
    fn test_encoder_empty_graph_embeds_to_zeros() {
        let encoder = MessagePasser::new(2, 8, 2, &Randomizer::new(Some(1)));
        let graph = MoleculeGraph::new(Vec::new(), Vec::new());
        assert_eq!(encoder.encode(&graph).unwrap(), vec![0.0; 8]);
    }

    #[test]
    fn test_mpn_dropout_uncertainty_shapes() {
        let params = quick_params().dropout_rate(0.1).dropout_samples(8).epochs(200);
        let mut model = MpnDropoutModel::new(&params);
        let (inputs, targets) = graph_data();
        model.fit(&inputs, &targets).unwrap();

        let probe = Batch::Graphs(vec![chain(3, 0.5)]);
        let vars = model.uncertainty(&probe).unwrap().unwrap();
        assert_eq!((vars.rows(), vars.cols()), (1, 1));
        assert!(vars.at(0, 0) >= 0.0);
    }

    #[test]
    fn test_mpn_two_output_uncertainty_positive() {
        let mut model = MpnTwoOutputModel::new(&quick_params());
        let (inputs, targets) = graph_data();
        model.fit(&inputs, &targets).unwrap();

        let probe = Batch::Graphs(vec![chain(3, 0.2)]);
        let preds = model.predict(&probe).unwrap();
        assert_eq!((preds.rows(), preds.cols()), (1, 1));
        let vars = model.uncertainty(&probe).unwrap().unwrap();
        assert!(vars.at(0, 0) > 0.0);
    }

    #[test]
    fn test_mpn_rejects_feature_batch() {
        let model = MpnModel::new(&quick_params());
        let probe = Batch::Features(DenseMatrix::zeros(1, 2));
        assert!(matches!(model.predict(&probe), Err(ModelError::NotFitted) | Err(ModelError::InputMismatch(_))));
    }
}
