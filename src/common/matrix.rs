use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// A dense `f32` matrix used for model inputs, targets, and predictions.
#[derive(Clone, Serialize, Deserialize)]
pub struct DenseMatrix {
    data: DMatrix<f32>,
}

impl DenseMatrix {
    /// Creates a new dense matrix with given rows, columns, and row-major data.
    pub fn new(rows: usize, cols: usize, data: &[f32]) -> Self {
        Self {
            data: DMatrix::from_row_slice(rows, cols, data),
        }
    }

    /// Creates a new dense matrix with given rows and columns, initialized with zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            data: DMatrix::zeros(rows, cols),
        }
    }

    /// Builds a matrix from a slice of equally sized rows; an empty slice yields a 0x0 matrix.
    pub fn from_rows(rows: &[Vec<f32>]) -> Self {
        if rows.is_empty() {
            return Self::zeros(0, 0);
        }
        let cols = rows[0].len();
        let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Self::new(rows.len(), cols, &flat)
    }

    /// Returns the number of rows in the matrix.
    #[inline]
    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    /// Returns the number of columns in the matrix.
    #[inline]
    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    /// Gets the value at position (i, j).
    #[inline]
    pub fn at(&self, i: usize, j: usize) -> f32 {
        self.data[(i, j)]
    }

    /// Sets the value at position (i, j).
    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: f32) {
        self.data[(i, j)] = value;
    }

    /// Returns row i as an owned vector.
    pub fn get_row(&self, i: usize) -> Vec<f32> {
        self.data.row(i).iter().copied().collect()
    }

    /// Sets the values of a specific row.
    pub fn set_row(&mut self, i: usize, src: &[f32]) {
        for (j, &value) in src.iter().enumerate() {
            self.set(i, j, value);
        }
    }

    /// Flattens the matrix into a single vector of elements in row-major layout.
    pub fn flatten(&self) -> Vec<f32> {
        self.data
            .row_iter()
            .flat_map(|row| row.into_iter().cloned())
            .collect()
    }

    /// Returns a transposed version of the matrix.
    pub fn transpose(&self) -> DenseMatrix {
        DenseMatrix {
            data: self.data.transpose(),
        }
    }

    /// Matrix product `self * other` as a new matrix.
    pub fn matmul(&self, other: &DenseMatrix) -> DenseMatrix {
        DenseMatrix {
            data: &self.data * &other.data,
        }
    }

    /// Adds another matrix to the current matrix.
    #[inline]
    pub fn add(&mut self, other: &Self) {
        self.data += &other.data;
    }

    /// Subtracts another matrix from the current matrix.
    #[inline]
    pub fn sub(&mut self, other: &Self) {
        self.data -= &other.data;
    }

    /// Scales the matrix by a scalar factor.
    #[inline]
    pub fn scale(&mut self, factor: f32) {
        self.data *= factor;
    }

    /// Element-wise multiplication with another matrix.
    #[inline]
    pub fn mul_elem(&mut self, other: &Self) {
        self.data.component_mul_assign(&other.data);
    }

    /// Applies a function to every element, returning a new matrix.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> DenseMatrix {
        DenseMatrix {
            data: self.data.map(f),
        }
    }

    /// Adds a row vector to every row of the matrix.
    pub fn add_row_vector(&mut self, v: &[f32]) {
        for i in 0..self.rows() {
            for (j, &value) in v.iter().enumerate() {
                self.data[(i, j)] += value;
            }
        }
    }

    /// Per-column sums.
    pub fn col_sums(&self) -> Vec<f32> {
        let mut sums = vec![0.0; self.cols()];
        for i in 0..self.rows() {
            for (j, sum) in sums.iter_mut().enumerate() {
                *sum += self.at(i, j);
            }
        }
        sums
    }

    /// Inverse of a square matrix, if it exists.
    pub fn try_inverse(&self) -> Option<DenseMatrix> {
        self.data.clone().try_inverse().map(|data| DenseMatrix { data })
    }
}
