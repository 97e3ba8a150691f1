pub mod gp;
pub mod mpn;
pub mod nn;
pub mod rf;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::matrix::DenseMatrix;

use gp::GaussianProcessModel;
use mpn::{MoleculeGraph, MpnDropoutModel, MpnModel, MpnTwoOutputModel};
use nn::{NnDropoutModel, NnEnsembleModel, NnModel, NnTwoOutputModel};
use rf::RandomForestModel;

/// One batch of model inputs: either a feature matrix (one row per molecule)
/// or a list of molecular graphs for message-passing models.
#[derive(Clone, Serialize, Deserialize)]
pub enum Batch {
    Features(DenseMatrix),
    Graphs(Vec<MoleculeGraph>),
}

impl Batch {
    /// Number of examples in the batch.
    pub fn len(&self) -> usize {
        match self {
            Batch::Features(m) => m.rows(),
            Batch::Graphs(g) => g.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn features(&self) -> Result<&DenseMatrix, ModelError> {
        match self {
            Batch::Features(m) => Ok(m),
            Batch::Graphs(_) => Err(ModelError::InputMismatch(
                "model requires a feature matrix, got molecular graphs".to_string(),
            )),
        }
    }

    pub(crate) fn graphs(&self) -> Result<&[MoleculeGraph], ModelError> {
        match self {
            Batch::Graphs(g) => Ok(g),
            Batch::Features(_) => Err(ModelError::InputMismatch(
                "model requires molecular graphs, got a feature matrix".to_string(),
            )),
        }
    }
}

/// The capability set every model family implements. Predictions are one row
/// per example and one column per task; `uncertainty` returns `Ok(None)` for
/// point-prediction-only models.
#[typetag::serde]
pub trait Model: ModelClone + Send + Sync {
    fn fit(&mut self, inputs: &Batch, targets: &DenseMatrix) -> Result<(), ModelError>;
    fn predict(&self, inputs: &Batch) -> Result<DenseMatrix, ModelError>;
    fn uncertainty(&self, inputs: &Batch) -> Result<Option<DenseMatrix>, ModelError>;
    fn as_any(&self) -> &dyn std::any::Any;
}

impl std::fmt::Debug for dyn Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Model")
    }
}

pub trait ModelClone {
    fn clone_box(&self) -> Box<dyn Model>;
}

impl<T> ModelClone for T
where
    T: 'static + Model + Clone,
{
    fn clone_box(&self) -> Box<dyn Model> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn Model> {
    fn clone(&self) -> Box<dyn Model> {
        self.clone_box()
    }
}

/// Uncertainty-quantification strategy for the neural model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfMethod {
    None,
    Dropout,
    Ensemble,
    TwoOutput,
}

impl ConfMethod {
    /// Maps a configuration string to a strategy; "mve" is an alias of
    /// "twooutput". Unknown strings fail, naming the model family.
    pub fn parse(family: &'static str, method: &str) -> Result<Self, ModelError> {
        match method {
            "none" => Ok(ConfMethod::None),
            "dropout" => Ok(ConfMethod::Dropout),
            "ensemble" => Ok(ConfMethod::Ensemble),
            "twooutput" | "mve" => Ok(ConfMethod::TwoOutput),
            _ => Err(ModelError::UnrecognizedConfMethod {
                family,
                method: method.to_string(),
            }),
        }
    }
}

/// Hyperparameters shared across the model families, with builder-style setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    pub(crate) input_size: usize,
    pub(crate) num_tasks: usize,
    pub(crate) hidden_sizes: Vec<usize>,
    pub(crate) epochs: usize,
    pub(crate) learning_rate: f32,
    pub(crate) dropout_rate: f32,
    pub(crate) dropout_samples: usize,
    pub(crate) ensemble_size: usize,
    pub(crate) num_trees: usize,
    pub(crate) max_depth: usize,
    pub(crate) min_leaf: usize,
    pub(crate) length_scale: f32,
    pub(crate) noise: f32,
    pub(crate) message_depth: usize,
    pub(crate) message_size: usize,
    pub(crate) seed: Option<u64>,
}

impl ModelParams {
    /// Creates parameters for models over `input_size` features predicting
    /// `num_tasks` targets, with defaults for everything else.
    pub fn new(input_size: usize, num_tasks: usize) -> Self {
        Self {
            input_size,
            num_tasks,
            hidden_sizes: vec![100],
            epochs: 100,
            learning_rate: 0.01,
            dropout_rate: 0.2,
            dropout_samples: 20,
            ensemble_size: 5,
            num_trees: 50,
            max_depth: 8,
            min_leaf: 2,
            length_scale: 1.0,
            noise: 0.01,
            message_depth: 3,
            message_size: 64,
            seed: None,
        }
    }

    pub fn hidden_sizes(mut self, hidden_sizes: &[usize]) -> Self {
        self.hidden_sizes = hidden_sizes.to_vec();
        self
    }

    pub fn epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn dropout_rate(mut self, dropout_rate: f32) -> Self {
        self.dropout_rate = dropout_rate;
        self
    }

    pub fn dropout_samples(mut self, dropout_samples: usize) -> Self {
        self.dropout_samples = dropout_samples;
        self
    }

    pub fn ensemble_size(mut self, ensemble_size: usize) -> Self {
        self.ensemble_size = ensemble_size;
        self
    }

    pub fn num_trees(mut self, num_trees: usize) -> Self {
        self.num_trees = num_trees;
        self
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn min_leaf(mut self, min_leaf: usize) -> Self {
        self.min_leaf = min_leaf;
        self
    }

    pub fn length_scale(mut self, length_scale: f32) -> Self {
        self.length_scale = length_scale;
        self
    }

    pub fn noise(mut self, noise: f32) -> Self {
        self.noise = noise;
        self
    }

    pub fn message_depth(mut self, message_depth: usize) -> Self {
        self.message_depth = message_depth;
        self
    }

    pub fn message_size(mut self, message_size: usize) -> Self {
        self.message_size = message_size;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Model factory function: dispatches on the model family name.
pub fn model(name: &str, params: &ModelParams) -> Result<Box<dyn Model>, ModelError> {
    match name {
        "rf" => Ok(Box::new(RandomForestModel::new(params))),
        "gp" => Ok(Box::new(GaussianProcessModel::new(params))),
        "nn" => nn(None, params),
        "mpn" => mpn(None, params),
        _ => Err(ModelError::UnrecognizedModel(name.to_string())),
    }
}

/// NN-type model factory function.
pub fn nn(conf_method: Option<&str>, params: &ModelParams) -> Result<Box<dyn Model>, ModelError> {
    let method = match conf_method {
        None => ConfMethod::None,
        Some(m) => ConfMethod::parse("NN", m)?,
    };

    Ok(match method {
        ConfMethod::None => Box::new(NnModel::new(params)),
        ConfMethod::Dropout => Box::new(NnDropoutModel::new(params)),
        ConfMethod::Ensemble => Box::new(NnEnsembleModel::new(params)),
        ConfMethod::TwoOutput => Box::new(NnTwoOutputModel::new(params)),
    })
}

/// MPN-type model factory function. Ensembling is not available for MPN models.
pub fn mpn(conf_method: Option<&str>, params: &ModelParams) -> Result<Box<dyn Model>, ModelError> {
    let method = match conf_method {
        None => ConfMethod::None,
        Some(m) => match ConfMethod::parse("MPN", m)? {
            ConfMethod::Ensemble => {
                return Err(ModelError::UnrecognizedConfMethod {
                    family: "MPN",
                    method: m.to_string(),
                })
            }
            parsed => parsed,
        },
    };

    Ok(match method {
        ConfMethod::None => Box::new(MpnModel::new(params)),
        ConfMethod::Dropout => Box::new(MpnDropoutModel::new(params)),
        ConfMethod::TwoOutput => Box::new(MpnTwoOutputModel::new(params)),
        ConfMethod::Ensemble => unreachable!("rejected above"),
    })
}
