pub mod error;
pub mod matrix;
pub(crate) mod random;
