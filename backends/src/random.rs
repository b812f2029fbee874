use abcnet_backend_core::{Backend, BackendError, ModelInputs, Weights};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

/// Placeholder weight source drawing uniform weights in [0, 1]
///
/// The generator is seeded once per job so a job replayed over the same
/// events yields the same weights.
pub struct RandomBackend {
    rng: Mutex<StdRng>,
}

impl RandomBackend {
    pub fn new(seed: u64) -> Self {
        tracing::warn!("Using placeholder random weights (seed {seed})");
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Backend for RandomBackend {
    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn predict(&self, inputs: ModelInputs) -> Result<Weights, BackendError> {
        let mut rng = self.rng.lock().map_err(|_| BackendError::Unhealthy)?;
        Ok((0..inputs.n_candidates)
            .map(|_| rng.gen_range(0.0..=1.0))
            .collect())
    }
}
