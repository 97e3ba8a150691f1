use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::matrix::DenseMatrix;

use super::{Batch, Model, ModelParams};

/// Exact Gaussian-process regression with an RBF kernel and observation noise.
/// The predictive variance is shared across tasks (one kernel, multi-output
/// targets solved jointly).
#[derive(Serialize, Deserialize, Clone)]
pub struct GaussianProcessModel {
    length_scale: f32,
    noise: f32,
    num_tasks: usize,
    state: Option<GpState>,
}

#[derive(Serialize, Deserialize, Clone)]
struct GpState {
    x_train: DenseMatrix,
    alpha: DenseMatrix,
    k_inv: DenseMatrix,
}

impl GaussianProcessModel {
    pub fn new(params: &ModelParams) -> Self {
        Self {
            length_scale: params.length_scale,
            noise: params.noise,
            num_tasks: params.num_tasks,
            state: None,
        }
    }

    fn kernel(&self, a: &DenseMatrix, i: usize, b: &DenseMatrix, j: usize) -> f32 {
        let mut dist_sq = 0.0;
        for k in 0..a.cols() {
            let d = a.at(i, k) - b.at(j, k);
            dist_sq += d * d;
        }
        (-dist_sq / (2.0 * self.length_scale * self.length_scale)).exp()
    }

    fn kernel_matrix(&self, a: &DenseMatrix, b: &DenseMatrix) -> DenseMatrix {
        let mut k = DenseMatrix::zeros(a.rows(), b.rows());
        for i in 0..a.rows() {
            for j in 0..b.rows() {
                k.set(i, j, self.kernel(a, i, b, j));
            }
        }
        k
    }

    fn state(&self) -> Result<&GpState, ModelError> {
        self.state.as_ref().ok_or(ModelError::NotFitted)
    }
}

#[typetag::serde]
impl Model for GaussianProcessModel {
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

        let mut k = self.kernel_matrix(x, x);
        for i in 0..n {
            k.set(i, i, k.at(i, i) + self.noise);
        }

        let k_inv = k
            .try_inverse()
            .ok_or_else(|| ModelError::Numerical("Kernel matrix is singular; increase noise".to_string()))?;
        let alpha = k_inv.matmul(targets);

        self.state = Some(GpState {
            x_train: x.clone(),
            alpha,
            k_inv,
        });
        Ok(())
    }

    fn predict(&self, inputs: &Batch) -> Result<DenseMatrix, ModelError> {
        let state = self.state()?;
        let x = inputs.features()?;
        let k_star = self.kernel_matrix(x, &state.x_train);
        Ok(k_star.matmul(&state.alpha))
    }

    fn uncertainty(&self, inputs: &Batch) -> Result<Option<DenseMatrix>, ModelError> {
        let state = self.state()?;
        let x = inputs.features()?;
        let k_star = self.kernel_matrix(x, &state.x_train);
        // k(x,x) = 1 for the RBF kernel; v_i = 1 + noise - k*_i (K + noise I)^-1 k*_i^T
        let solved = state.k_inv.matmul(&k_star.transpose());

        let mut vars = DenseMatrix::zeros(x.rows(), self.num_tasks);
        for i in 0..x.rows() {
            let mut reduction = 0.0;
            for j in 0..state.x_train.rows() {
                reduction += k_star.at(i, j) * solved.at(j, i);
            }
            let var = (1.0 + self.noise - reduction).max(0.0);
            for task in 0..self.num_tasks {
                vars.set(i, task, var);
            }
        }
        Ok(Some(vars))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
