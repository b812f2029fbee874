use abcnet_backend_core::{Backend, BackendError, ModelInputs, Weights};
use ort::session::{builder::GraphOptimizationLevel, Session};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Optional `config.json` stored next to `model.onnx`
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GraphConfig {
    /// Expected number of feature columns
    pub n_features: Option<usize>,
    /// Fixed number of candidate rows the graph was exported with
    pub n_pf_cands: Option<usize>,
    #[serde(default = "default_weights_output")]
    pub weights_output: String,
}

fn default_weights_output() -> String {
    String::from("weights")
}

pub struct OrtBackend {
    session: Mutex<Session>,

    // NOTE: the neighbour stream is called either `neighbors` or `knn_indices`
    neighbors_key: Option<String>,
    mask: bool,
    weights_output: String,
    config: Option<GraphConfig>,
}

impl OrtBackend {
    pub fn new(model_path: &Path) -> Result<Self, BackendError> {
        let onnx_path = resolve_onnx_path(model_path)?;

        let config = match model_path.is_dir() {
            true => {
                let path = model_path.join("config.json");
                match path.exists() {
                    true => {
                        let content = std::fs::read_to_string(&path).map_err(|e| {
                            BackendError::Start(format!("Failed to read config.json: {}", e))
                        })?;
                        Some(
                            serde_json::from_str::<GraphConfig>(&content).map_err(|e| {
                                BackendError::Start(format!("Failed to parse config.json: {}", e))
                            })?,
                        )
                    }
                    false => None,
                }
            }
            false => None,
        };

        tracing::info!("Loading inference graph from {onnx_path:?}");
        let session = Session::builder()
            .s()?
            .with_intra_threads(num_cpus::get())
            .s()?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .s()?
            .commit_from_file(&onnx_path)
            .s()?;

        let mut features = false;
        let mut neighbors_key = None;
        let mut mask = false;

        for input in &session.inputs {
            match input.name.as_str() {
                "features" => features = true,
                "neighbors" | "knn_indices" => neighbors_key = Some(input.name.clone()),
                "mask" => mask = true,
                name => {
                    return Err(BackendError::Start(format!(
                        "Unsupported graph input `{name}`"
                    )));
                }
            }
        }

        if !features {
            return Err(BackendError::Start(
                "Graph does not declare a `features` input".to_string(),
            ));
        }

        let preferred = config
            .as_ref()
            .map(|c| c.weights_output.clone())
            .unwrap_or_else(default_weights_output);
        let weights_output = match session.outputs.iter().find(|o| o.name == preferred) {
            Some(output) => output.name.clone(),
            None => session
                .outputs
                .first()
                .map(|o| o.name.clone())
                .ok_or(BackendError::Start("Graph declares no outputs".to_string()))?,
        };

        Ok(Self {
            session: Mutex::new(session),
            neighbors_key,
            mask,
            weights_output,
            config,
        })
    }

    fn check_shape(&self, inputs: &ModelInputs) -> Result<(), BackendError> {
        if let Some(config) = &self.config {
            if let Some(n_features) = config.n_features {
                if n_features != inputs.n_features {
                    return Err(BackendError::Inference(format!(
                        "Graph expects {n_features} features, got {}",
                        inputs.n_features
                    )));
                }
            }
            if let Some(n_pf_cands) = config.n_pf_cands {
                if n_pf_cands != inputs.n_rows {
                    return Err(BackendError::Inference(format!(
                        "Graph expects {n_pf_cands} candidate rows, got {}",
                        inputs.n_rows
                    )));
                }
            }
        }
        Ok(())
    }
}

fn resolve_onnx_path(model_path: &Path) -> Result<PathBuf, BackendError> {
    let onnx_path = match model_path.is_dir() {
        true => {
            let default_path = model_path.join("model.onnx");
            match default_path.exists() {
                true => default_path,
                false => model_path.join("onnx/model.onnx"),
            }
        }
        false => model_path.to_path_buf(),
    };

    if !onnx_path.exists() {
        return Err(BackendError::Start(format!(
            "Model graph not found at {:?}",
            onnx_path
        )));
    }
    Ok(onnx_path)
}

impl Backend for OrtBackend {
    fn max_candidates(&self) -> Option<usize> {
        self.config.as_ref().and_then(|c| c.n_pf_cands)
    }

    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn predict(&self, inputs: ModelInputs) -> Result<Weights, BackendError> {
        self.check_shape(&inputs)?;

        let n_rows = inputs.n_rows;
        let n_candidates = inputs.n_candidates;

        // Create ndarrays with a leading batch axis of one event
        let features =
            ndarray::Array3::from_shape_vec((1, n_rows, inputs.n_features), inputs.features)
                .e()?;

        let inputs = {
            let mut feeds = ort::inputs![
                "features" => ort::value::Tensor::from_array(features).e()?,
            ];

            if let Some(key) = &self.neighbors_key {
                let neighbors =
                    ndarray::Array3::from_shape_vec((1, n_rows, inputs.n_knn), inputs.neighbors)
                        .e()?;
                let neighbors_value = ort::value::Tensor::from_array(neighbors).e()?;
                feeds.push((key.clone().into(), neighbors_value.into()));
            }

            if self.mask {
                let mask = ndarray::Array2::from_shape_vec((1, n_rows), inputs.mask).e()?;
                let mask_value = ort::value::Tensor::from_array(mask).e()?;
                feeds.push(("mask".into(), mask_value.into()));
            }

            feeds
        };

        // Run model
        let mut session = self
            .session
            .lock()
            .map_err(|_| BackendError::Unhealthy)?;
        let outputs = session.run(inputs).e()?;

        let weights = outputs
            .get(self.weights_output.as_str())
            .ok_or(BackendError::Inference(format!(
                "Missing graph output `{}`",
                self.weights_output
            )))?
            .try_extract_array::<f32>()
            .e()?;

        // Accept [1, rows], [1, rows, 1] or [rows]
        let weights: Vec<f32> = weights.iter().copied().collect();
        if weights.len() != n_rows {
            return Err(BackendError::Inference(format!(
                "Shape mismatch: graph returned {} weights for {} rows",
                weights.len(),
                n_rows
            )));
        }

        Ok(weights.into_iter().take(n_candidates).collect())
    }
}

pub trait WrapErr<O> {
    fn s(self) -> Result<O, BackendError>;
    fn e(self) -> Result<O, BackendError>;
}

impl<O> WrapErr<O> for Result<O, ort::Error> {
    fn s(self) -> Result<O, BackendError> {
        self.map_err(|e| BackendError::Start(e.to_string()))
    }
    fn e(self) -> Result<O, BackendError> {
        self.map_err(|e| BackendError::Inference(e.to_string()))
    }
}

impl<O> WrapErr<O> for Result<O, ndarray::ShapeError> {
    fn s(self) -> Result<O, BackendError> {
        self.map_err(|e| BackendError::Start(e.to_string()))
    }
    fn e(self) -> Result<O, BackendError> {
        self.map_err(|e| BackendError::Inference(e.to_string()))
    }
}
