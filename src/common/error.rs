use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Unrecognized model: \"{0}\"")]
    UnrecognizedModel(String),
    #[error("Unrecognized {family} confidence method: \"{method}\"")]
    UnrecognizedConfMethod { family: &'static str, method: String },
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Input mismatch: {0}")]
    InputMismatch(String),
    #[error("Model has not been fit")]
    NotFitted,
    #[error("Numerical error: {0}")]
    Numerical(String),
}
