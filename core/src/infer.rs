use crate::candidate::{Candidate, PackedCandidate};
use crate::features::{make_feature_map, FeatureOptions, FeatureSchema};
use crate::knn::SearchStrategy;
use crate::preprocess::{preprocess, Normalization};
use crate::weights::{apply_weights, ApplyError};
use crate::{AbcNetError, ConfigError};
use abcnet_backend::{Backend, BackendError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq)]
pub struct InferConfig {
    /// Maximum number of candidates seen by the model, also the padded row count
    pub n_pf_cands: usize,
    pub n_knn: usize,
    pub features: FeatureOptions,
    /// Weight given to candidates past `n_pf_cands`
    pub overflow_weight: f32,
    pub normalization: Option<Normalization>,
}

impl Default for InferConfig {
    fn default() -> Self {
        Self {
            n_pf_cands: 4000,
            n_knn: 16,
            features: FeatureOptions::default(),
            overflow_weight: 0.0,
            normalization: None,
        }
    }
}

/// Smallest accepted grid cell side
pub const MIN_CELL_SIZE: f32 = 1e-3;

impl InferConfig {
    fn validate(
        &self,
        schema: &FeatureSchema,
        max_candidates: Option<usize>,
    ) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.overflow_weight) {
            return Err(ConfigError::Invalid(format!(
                "`overflow_weight` must be in [0, 1], got {}",
                self.overflow_weight
            )));
        }
        if let SearchStrategy::Grid { cell_size } = self.features.search {
            if !cell_size.is_finite() || cell_size < MIN_CELL_SIZE {
                return Err(ConfigError::Invalid(format!(
                    "grid cell size must be a number of at least {MIN_CELL_SIZE}, got {cell_size}"
                )));
            }
        }
        if let Some(max_candidates) = max_candidates {
            if max_candidates != self.n_pf_cands {
                return Err(ConfigError::Invalid(format!(
                    "the model expects {max_candidates} candidate rows but `n_pf_cands` is {}",
                    self.n_pf_cands
                )));
            }
        }
        if let Some(normalization) = &self.normalization {
            normalization.check_schema(schema)?;
        }
        Ok(())
    }
}

/// Per-event pipeline: features, model inputs, weights, reweighted collection
#[derive(Debug, Clone)]
pub struct Infer {
    backend: Backend,
    config: Arc<InferConfig>,
    schema: FeatureSchema,
}

impl Infer {
    pub fn new(backend: Backend, config: InferConfig) -> Result<Self, ConfigError> {
        let schema = FeatureSchema::new(config.features.aggregation);
        config.validate(&schema, backend.max_candidates)?;

        tracing::info!(
            "Producing weights from `{}` with {} features per candidate",
            backend.weight_source,
            schema.len()
        );

        Ok(Self {
            backend,
            config: Arc::new(config),
            schema,
        })
    }

    pub fn config(&self) -> &InferConfig {
        &self.config
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    #[instrument(skip_all, fields(n_candidates = candidates.len()))]
    pub async fn process<C: Candidate>(
        &self,
        candidates: &[C],
    ) -> Result<EventOutput, AbcNetError> {
        let start_time = Instant::now();
        let config = &self.config;

        let counter = metrics::counter!("abc_event_count");
        counter.increment(1);

        // Only packed candidates can be reweighted
        if let Some(index) = candidates.iter().position(|c| c.packed().is_none()) {
            let counter = metrics::counter!("abc_event_failure", "err" => "apply");
            counter.increment(1);
            let err = ApplyError::NotPacked { index };
            tracing::error!("{err}");
            return Err(err.into());
        }

        // Features
        let feature_map = make_feature_map(
            candidates,
            config.n_pf_cands,
            config.n_knn,
            &config.features,
        );
        let inputs = preprocess(
            &feature_map,
            &self.schema,
            config.n_pf_cands,
            config.normalization.as_ref(),
            config.features.debug,
        )
        .map_err(|err| {
            let counter = metrics::counter!("abc_event_failure", "err" => "preprocess");
            counter.increment(1);
            tracing::error!("{err}");
            err
        })?;
        let n_processed = inputs.n_candidates;
        let feature_time = start_time.elapsed();

        // Inference
        let (mut weights, inference_time) =
            self.backend.predict(inputs).await.map_err(|err| {
                let counter = metrics::counter!("abc_event_failure", "err" => "inference");
                counter.increment(1);
                tracing::error!("{err}");
                err
            })?;

        if weights.len() != n_processed {
            let counter = metrics::counter!("abc_event_failure", "err" => "inference");
            counter.increment(1);
            let message = format!(
                "Shape mismatch: got {} weights for {n_processed} candidates",
                weights.len()
            );
            tracing::error!("{message}");
            return Err(AbcNetError::Backend(BackendError::Inference(message)));
        }

        // Candidates the model could not see
        weights.resize(candidates.len(), config.overflow_weight);

        let weighted = apply_weights(candidates, weights).map_err(|err| {
            let counter = metrics::counter!("abc_event_failure", "err" => "apply");
            counter.increment(1);
            tracing::error!("{err}");
            err
        })?;

        let total_time = start_time.elapsed();

        let counter = metrics::counter!("abc_event_success");
        counter.increment(1);
        let histogram = metrics::histogram!("abc_event_duration");
        histogram.record(total_time.as_secs_f64());
        let histogram = metrics::histogram!("abc_event_feature_duration");
        histogram.record(feature_time.as_secs_f64());
        let histogram = metrics::histogram!("abc_event_inference_duration");
        histogram.record(inference_time.as_secs_f64());
        let histogram = metrics::histogram!("abc_event_candidates");
        histogram.record(candidates.len() as f64);

        tracing::debug!("Event processed in {total_time:?}");

        Ok(EventOutput {
            candidates: weighted.candidates,
            weights: weighted.weights,
            metadata: EventMetadata {
                n_candidates: candidates.len(),
                n_processed,
                feature: feature_time,
                inference: inference_time,
            },
        })
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> bool {
        self.backend.health().await.is_ok()
    }

    #[instrument(skip(self))]
    pub fn health_watcher(&self) -> watch::Receiver<bool> {
        self.backend.health_watcher()
    }

    /// Release the weight source held by this pipeline
    pub fn shutdown(self) {
        self.backend.shutdown();
    }
}

#[derive(Debug)]
pub struct EventMetadata {
    pub n_candidates: usize,
    /// Candidates that went through the model
    pub n_processed: usize,
    pub feature: Duration,
    pub inference: Duration,
}

#[derive(Debug)]
pub struct EventOutput {
    pub candidates: Vec<PackedCandidate>,
    pub weights: Vec<f32>,
    pub metadata: EventMetadata,
}
