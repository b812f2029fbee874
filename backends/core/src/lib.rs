#[cfg(feature = "clap")]
use clap::ValueEnum;
use std::fmt;
use thiserror::Error;

/// Dense model inputs for a single event
///
/// All tensors are row-major and padded to `n_rows` rows. Only the first
/// `n_candidates` rows hold real candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInputs {
    /// `n_rows * n_features` feature values
    pub features: Vec<f32>,
    /// `n_rows * n_knn` neighbour indices
    pub neighbors: Vec<i64>,
    /// `n_rows` values, 1.0 for real candidates and 0.0 for padding
    pub mask: Vec<f32>,
    pub n_rows: usize,
    pub n_features: usize,
    pub n_knn: usize,
    pub n_candidates: usize,
}

impl ModelInputs {
    pub fn len(&self) -> usize {
        self.n_candidates
    }

    pub fn is_empty(&self) -> bool {
        self.n_candidates == 0
    }

    /// Feature values of row `i`
    pub fn row(&self, i: usize) -> &[f32] {
        &self.features[i * self.n_features..(i + 1) * self.n_features]
    }
}

/// One weight per real candidate row, in row order
pub type Weights = Vec<f32>;

pub trait Backend {
    fn health(&self) -> Result<(), BackendError>;

    fn max_candidates(&self) -> Option<usize> {
        None
    }

    fn predict(&self, inputs: ModelInputs) -> Result<Weights, BackendError>;
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
pub enum WeightSource {
    /// Uniform placeholder weights in [0, 1] from a seeded generator.
    /// Stand-in until a trained model is available.
    Random,
    /// Run the serialized model with ONNX Runtime
    Model,
}

impl fmt::Display for WeightSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WeightSource::Random => write!(f, "random"),
            WeightSource::Model => write!(f, "model"),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum BackendError {
    #[error("No backend found")]
    NoBackend,
    #[error("Could not start backend: {0}")]
    Start(String),
    #[error("{0}")]
    Inference(String),
    #[error("Backend is unhealthy")]
    Unhealthy,
}
