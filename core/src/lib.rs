pub mod candidate;
pub mod features;
pub mod infer;
pub mod knn;
pub mod preprocess;
pub mod weights;

use abcnet_backend::BackendError;
use thiserror::Error;

pub use crate::preprocess::PreprocessError;
pub use crate::weights::ApplyError;

/// Invalid job configuration, detected before any event is processed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Invalid normalization: {0}")]
    Normalization(String),
}

#[derive(Error, Debug)]
pub enum AbcNetError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Preprocessing error: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("Weight application error: {0}")]
    Apply(#[from] ApplyError),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}
