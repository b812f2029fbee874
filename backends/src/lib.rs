mod random;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{instrument, Span};

pub use crate::random::RandomBackend;
pub use abcnet_backend_core::Backend as CoreBackend;
pub use abcnet_backend_core::{BackendError, ModelInputs, WeightSource, Weights};

#[cfg(feature = "ort")]
use abcnet_backend_ort::OrtBackend;

/// Job-wide handle on the loaded weight source
///
/// The engine is created once by [`Backend::new`] and owned by a dedicated
/// thread. Handles are cheap to clone and can be shared by every processing
/// unit. The engine is released when the last handle is dropped or
/// [`Backend::shutdown`] is called on it.
#[derive(Debug, Clone)]
pub struct Backend {
    /// Channel to communicate with the background thread
    backend_sender: mpsc::Sender<BackendCommand>,
    /// Health status
    health_receiver: watch::Receiver<bool>,
    _backend_thread: Arc<BackendThread>,
    pub max_candidates: Option<usize>,
    pub weight_source: WeightSource,
}

impl Backend {
    pub fn new(
        weight_source: WeightSource,
        model_path: Option<PathBuf>,
        seed: u64,
    ) -> Result<Self, BackendError> {
        let start = Instant::now();
        let backend = init_backend(weight_source, model_path, seed)?;
        tracing::info!("Weight source `{weight_source}` ready in {:?}", start.elapsed());

        Ok(Self::from_backend(backend, weight_source))
    }

    /// Wrap an already started engine
    pub fn from_backend(backend: Box<dyn CoreBackend + Send>, weight_source: WeightSource) -> Self {
        let (backend_sender, backend_receiver) = mpsc::channel(8);
        let max_candidates = backend.max_candidates();

        let (health_sender, health_receiver) = watch::channel(false);
        let _backend_thread =
            Arc::new(BackendThread::new(backend, backend_receiver, health_sender));

        Self {
            backend_sender,
            health_receiver,
            _backend_thread,
            max_candidates,
            weight_source,
        }
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<(), BackendError> {
        let (sender, receiver) = oneshot::channel();
        self.backend_sender
            .send(BackendCommand::Health(Span::current(), sender))
            .await
            .map_err(|_| BackendError::Unhealthy)?;
        receiver.await.map_err(|_| BackendError::Unhealthy)?
    }

    #[instrument(skip(self))]
    pub fn health_watcher(&self) -> watch::Receiver<bool> {
        self.health_receiver.clone()
    }

    #[instrument(skip_all)]
    pub async fn predict(&self, inputs: ModelInputs) -> Result<(Weights, Duration), BackendError> {
        let (sender, receiver) = oneshot::channel();

        self.backend_sender
            .send(BackendCommand::Predict(inputs, Span::current(), sender))
            .await
            .map_err(|_| BackendError::Unhealthy)?;
        receiver.await.map_err(|_| BackendError::Unhealthy)?
    }

    /// Release this handle. The engine is torn down once every clone is gone.
    pub fn shutdown(self) {
        tracing::info!("Releasing weight source `{}`", self.weight_source);
    }
}

fn init_backend(
    weight_source: WeightSource,
    model_path: Option<PathBuf>,
    seed: u64,
) -> Result<Box<dyn CoreBackend + Send>, BackendError> {
    match weight_source {
        WeightSource::Random => Ok(Box::new(RandomBackend::new(seed))),
        WeightSource::Model => {
            let model_path = model_path.ok_or(BackendError::Start(
                "a model path is required for the `model` weight source".to_string(),
            ))?;

            load_model(&model_path)
        }
    }
}

#[cfg(feature = "ort")]
fn load_model(model_path: &Path) -> Result<Box<dyn CoreBackend + Send>, BackendError> {
    match OrtBackend::new(model_path) {
        Ok(b) => Ok(Box::new(b)),
        Err(err) => {
            tracing::error!("Could not start ORT backend: {err}");
            Err(err)
        }
    }
}

#[cfg(not(feature = "ort"))]
fn load_model(model_path: &Path) -> Result<Box<dyn CoreBackend + Send>, BackendError> {
    tracing::error!("Cannot load {model_path:?}: `ort` feature is not enabled");
    Err(BackendError::NoBackend)
}

#[derive(Debug)]
struct BackendThread(Option<JoinHandle<()>>);

impl BackendThread {
    fn new(
        backend: Box<dyn CoreBackend + Send>,
        mut backend_receiver: mpsc::Receiver<BackendCommand>,
        health_sender: watch::Sender<bool>,
    ) -> Self {
        let handle = std::thread::spawn(move || {
            while let Some(cmd) = backend_receiver.blocking_recv() {
                let start = Instant::now();
                let mut healthy = false;
                match cmd {
                    BackendCommand::Health(span, sender) => {
                        let _span = span.entered();
                        let _ = sender.send(backend.health().map(|_| healthy = true));
                    }
                    BackendCommand::Predict(inputs, span, sender) => {
                        let _span = span.entered();
                        let _ = sender.send(backend.predict(inputs).map(|w| {
                            healthy = true;
                            (w, start.elapsed())
                        }));
                    }
                };
                let _ = health_sender.send(healthy);
            }
            tracing::debug!("Weight source thread stopped");
        });
        Self(Some(handle))
    }
}

impl Drop for BackendThread {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            if handle.join().is_err() {
                tracing::error!("Weight source thread panicked");
            }
        }
    }
}

enum BackendCommand {
    Health(Span, oneshot::Sender<Result<(), BackendError>>),
    Predict(
        ModelInputs,
        Span,
        #[allow(clippy::type_complexity)]
        oneshot::Sender<Result<(Weights, Duration), BackendError>>,
    ),
}
