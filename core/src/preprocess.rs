use crate::features::{FeatureMap, FeatureSchema};
use crate::ConfigError;
use abcnet_backend::ModelInputs;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PreprocessError {
    #[error("feature column `{0}` is missing")]
    MissingColumn(String),
    #[error("feature column `{column}` has {actual} values, expected {expected}")]
    ColumnLength {
        column: String,
        expected: usize,
        actual: usize,
    },
    #[error("neighbour stream has {actual} indices, expected {expected}")]
    NeighborLength { expected: usize, actual: usize },
    #[error("{n_candidates} candidates do not fit in {n_pf_cands} rows")]
    TooManyCandidates {
        n_candidates: usize,
        n_pf_cands: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ColumnScale {
    #[serde(default)]
    pub center: f32,
    #[serde(default = "default_scale")]
    pub scale: f32,
}

fn default_scale() -> f32 {
    1.0
}

/// Per-column affine normalization `(x - center) / scale`
///
/// Stored as a JSON object keyed by column name:
/// `{"pt": {"center": 1.2, "scale": 4.0}, "eta": {"scale": 2.5}}`.
/// Columns without an entry are passed through.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct Normalization {
    columns: HashMap<String, ColumnScale>,
}

impl Normalization {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let normalization: Self = serde_json::from_str(json)
            .map_err(|err| ConfigError::Normalization(format!("invalid JSON: {err}")))?;

        for (column, scale) in &normalization.columns {
            if scale.scale == 0.0 || !scale.scale.is_finite() || !scale.center.is_finite() {
                return Err(ConfigError::Normalization(format!(
                    "column `{column}` has an unusable scale {} or center {}",
                    scale.scale, scale.center
                )));
            }
        }
        Ok(normalization)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|err| {
            ConfigError::Normalization(format!("could not read {path:?}: {err}"))
        })?;
        Self::from_json(&json)
    }

    /// Reject entries naming columns the schema does not produce
    pub fn check_schema(&self, schema: &FeatureSchema) -> Result<(), ConfigError> {
        match self
            .columns
            .keys()
            .find(|name| !schema.columns().contains(&name.as_str()))
        {
            Some(name) => Err(ConfigError::Normalization(format!(
                "unknown feature column `{name}`"
            ))),
            None => Ok(()),
        }
    }

    pub fn get(&self, column: &str) -> Option<&ColumnScale> {
        self.columns.get(column)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Turn a feature map into the fixed-size model inputs
///
/// Rows `n_candidates..n_pf_cands` are padding: zero features, a mask of 0.0
/// and neighbour slots pointing at the row itself.
pub fn preprocess(
    feature_map: &FeatureMap,
    schema: &FeatureSchema,
    n_pf_cands: usize,
    normalization: Option<&Normalization>,
    debug: bool,
) -> Result<ModelInputs, PreprocessError> {
    let n_candidates = feature_map.n_candidates;
    let n_knn = feature_map.n_knn;
    let n_features = schema.len();

    if n_candidates > n_pf_cands {
        return Err(PreprocessError::TooManyCandidates {
            n_candidates,
            n_pf_cands,
        });
    }
    if feature_map.neighbors.len() != n_candidates * n_knn {
        return Err(PreprocessError::NeighborLength {
            expected: n_candidates * n_knn,
            actual: feature_map.neighbors.len(),
        });
    }

    let mut features = vec![0.0; n_pf_cands * n_features];

    for (j, name) in schema.columns().iter().enumerate() {
        let column = feature_map
            .column(name)
            .ok_or_else(|| PreprocessError::MissingColumn(name.to_string()))?;
        if column.len() != n_candidates {
            return Err(PreprocessError::ColumnLength {
                column: name.to_string(),
                expected: n_candidates,
                actual: column.len(),
            });
        }

        let scale = normalization.and_then(|n| n.get(name));
        for (i, value) in column.iter().enumerate() {
            features[i * n_features + j] = match scale {
                Some(s) => (value - s.center) / s.scale,
                None => *value,
            };
        }
    }

    let mut neighbors = Vec::with_capacity(n_pf_cands * n_knn);
    neighbors.extend_from_slice(&feature_map.neighbors);
    for i in n_candidates..n_pf_cands {
        neighbors.extend(std::iter::repeat(i as i64).take(n_knn));
    }

    let mut mask = vec![0.0; n_pf_cands];
    mask[..n_candidates].fill(1.0);

    let inputs = ModelInputs {
        features,
        neighbors,
        mask,
        n_rows: n_pf_cands,
        n_features,
        n_knn,
        n_candidates,
    };

    if debug {
        tracing::debug!(
            target: "abcnet::features",
            shape = ?[n_pf_cands, n_features],
            n_candidates,
            first_row = ?(n_pf_cands > 0).then(|| inputs.row(0)),
            "Model inputs ready"
        );
    }

    Ok(inputs)
}
