use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::matrix::DenseMatrix;

/// Per-column standard scaler, fit on training targets and used to un-scale raw
/// model outputs back into target space.
///
/// Columns with zero standard deviation are pinned: `transform` maps them to 0
/// and `inverse_transform` maps them back to the column mean.
#[derive(Serialize, Deserialize, Clone)]
pub struct StandardScaler {
    means: Vec<f32>,
    std_devs: Vec<f32>,
}

impl StandardScaler {
    /// Fits means and standard deviations over the columns of `targets`.
    pub fn fit(targets: &DenseMatrix) -> Result<Self, ModelError> {
        let (rows, cols) = (targets.rows(), targets.cols());
        if rows == 0 {
            return Err(ModelError::ConfigError("Cannot fit a scaler on an empty matrix".to_string()));
        }

        let mut means = vec![0.0; cols];
        for j in 0..cols {
            let mut sum = 0.0;
            for i in 0..rows {
                sum += targets.at(i, j);
            }
            means[j] = sum / rows as f32;
        }

        let mut std_devs = vec![0.0; cols];
        for j in 0..cols {
            let mut sum = 0.0;
            for i in 0..rows {
                let diff = targets.at(i, j) - means[j];
                sum += diff * diff;
            }
            std_devs[j] = (sum / rows as f32).sqrt();
        }

        Ok(Self { means, std_devs })
    }

    fn check_width(&self, cols: usize) -> Result<(), ModelError> {
        if cols != self.means.len() {
            return Err(ModelError::ConfigError(format!(
                "Scaler was fit on {} columns but applied to {}",
                self.means.len(),
                cols
            )));
        }
        Ok(())
    }

    /// Scales a matrix in place to zero mean and unit variance per column.
    pub fn transform(&self, matrix: &mut DenseMatrix) -> Result<(), ModelError> {
        self.check_width(matrix.cols())?;
        for i in 0..matrix.rows() {
            for j in 0..matrix.cols() {
                let std_dev = self.std_devs[j];
                if std_dev.abs() < f32::EPSILON {
                    matrix.set(i, j, 0.0);
                } else {
                    matrix.set(i, j, (matrix.at(i, j) - self.means[j]) / std_dev);
                }
            }
        }
        Ok(())
    }

    /// Un-scales a matrix in place back into target space.
    pub fn inverse_transform(&self, matrix: &mut DenseMatrix) -> Result<(), ModelError> {
        self.check_width(matrix.cols())?;
        for i in 0..matrix.rows() {
            let mut row = matrix.get_row(i);
            self.inverse_row(&mut row)?;
            matrix.set_row(i, &row);
        }
        Ok(())
    }

    /// Un-scales a single prediction row in place.
    pub fn inverse_row(&self, row: &mut [f32]) -> Result<(), ModelError> {
        self.check_width(row.len())?;
        for (j, value) in row.iter_mut().enumerate() {
            let std_dev = self.std_devs[j];
            if std_dev.abs() < f32::EPSILON {
                *value = self.means[j];
            } else {
                *value = *value * std_dev + self.means[j];
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_then_inverse_round_trips() {
        let original = vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0];
        let mut matrix = DenseMatrix::new(3, 2, &original);

        let scaler = StandardScaler::fit(&matrix).unwrap();
        scaler.transform(&mut matrix).unwrap();

        // After scaling, each column mean should be close to 0
        for j in 0..matrix.cols() {
            let mean: f32 = (0..matrix.rows()).map(|i| matrix.at(i, j)).sum::<f32>() / matrix.rows() as f32;
            assert!(mean.abs() < 1e-5);
        }

        scaler.inverse_transform(&mut matrix).unwrap();
        for (idx, &expected) in original.iter().enumerate() {
            let (i, j) = (idx / 2, idx % 2);
            assert!((matrix.at(i, j) - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn test_zero_std_column_pins_to_mean() {
        let mut matrix = DenseMatrix::new(3, 1, &[5.0, 5.0, 5.0]);
        let scaler = StandardScaler::fit(&matrix).unwrap();

        scaler.transform(&mut matrix).unwrap();
        assert_eq!(matrix.flatten(), &[0.0, 0.0, 0.0]);

        scaler.inverse_transform(&mut matrix).unwrap();
        assert_eq!(matrix.flatten(), &[5.0, 5.0, 5.0]);
    }

    #[test]
    fn test_fit_on_empty_matrix_fails() {
        let matrix = DenseMatrix::zeros(0, 2);
        assert!(StandardScaler::fit(&matrix).is_err());
    }

    #[test]
    fn test_width_mismatch_fails() {
        let matrix = DenseMatrix::new(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let scaler = StandardScaler::fit(&matrix).unwrap();
        let mut row = vec![1.0];
        assert!(scaler.inverse_row(&mut row).is_err());
    }
}
