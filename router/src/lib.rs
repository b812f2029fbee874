/// JSON-lines event and product records
pub mod event;
mod logging;
mod prometheus;

pub use logging::init_logging;

use crate::event::{Event, EventProduct};
use abcnet_backend::{Backend, WeightSource};
use abcnet_core::infer::{Infer, InferConfig};
use abcnet_core::AbcNetError;
use anyhow::{anyhow, Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::Instrument;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Collection `{0}` not found in event")]
    MissingCollection(String),
    #[error("Invalid event on line {line}: {source}")]
    InvalidEvent {
        line: usize,
        source: serde_json::Error,
    },
    #[error("Could not serialize products: {0}")]
    Serialize(serde_json::Error),
    #[error(transparent)]
    AbcNet(#[from] AbcNetError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub events: usize,
    pub candidates: usize,
}

/// Produce weights for every event of `input` and write them to `output`
///
/// `output` is a file path, or `-` for stdout. The first failing event stops
/// the job and nothing is written for it. The weight source is released once
/// every event has been processed.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    input: PathBuf,
    output: String,
    cand_name: String,
    weight_source: WeightSource,
    model_path: Option<PathBuf>,
    seed: u64,
    config: InferConfig,
    prometheus_port: Option<u16>,
) -> Result<RunSummary> {
    let backend =
        Backend::new(weight_source, model_path, seed).context("Could not create backend")?;
    let infer = Infer::new(backend, config).context("Invalid configuration")?;

    if !infer.health().await {
        return Err(anyhow!("Weight source `{weight_source}` is unhealthy"));
    }

    if let Some(port) = prometheus_port {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        prometheus::prometheus_builder(addr, infer.config().n_pf_cands)?
            .install()
            .context("Could not start the Prometheus exporter")?;
        tracing::info!("Serving metrics on {addr}");
    }

    let reader = tokio::fs::File::open(&input)
        .await
        .with_context(|| format!("Could not open events file {input:?}"))?;
    let reader = BufReader::new(reader);

    let writer: Box<dyn AsyncWrite + Unpin + Send> = match output.as_str() {
        "-" => Box::new(tokio::io::stdout()),
        path => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Could not create products file {path:?}"))?,
        ),
    };

    let start = Instant::now();
    let summary = process_events(&infer, &cand_name, reader, BufWriter::new(writer)).await;
    infer.shutdown();
    let summary = summary?;
    tracing::info!(
        "Processed {} events with {} candidates in {:?}",
        summary.events,
        summary.candidates,
        start.elapsed()
    );

    Ok(summary)
}

/// Read JSON-lines events from `reader` and write one product line per event
///
/// Products of the events before a failure are flushed before the error is
/// returned.
pub async fn process_events<R, W>(
    infer: &Infer,
    cand_name: &str,
    reader: R,
    mut writer: W,
) -> Result<RunSummary, RouterError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = write_products(infer, cand_name, reader, &mut writer).await;
    writer.flush().await?;
    result
}

async fn write_products<R, W>(
    infer: &Infer,
    cand_name: &str,
    reader: R,
    writer: &mut W,
) -> Result<RunSummary, RouterError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut summary = RunSummary::default();
    let mut lines = reader.lines();
    let mut line_number = 0;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let event: Event =
            serde_json::from_str(&line).map_err(|source| RouterError::InvalidEvent {
                line: line_number,
                source,
            })?;

        let span = tracing::info_span!("event", id = event.id);
        let product = process_event(infer, cand_name, event).instrument(span).await?;
        summary.events += 1;
        summary.candidates += product.weights.len();

        let mut json = serde_json::to_vec(&product).map_err(RouterError::Serialize)?;
        json.push(b'\n');
        writer.write_all(&json).await?;
    }

    Ok(summary)
}

async fn process_event(
    infer: &Infer,
    cand_name: &str,
    mut event: Event,
) -> Result<EventProduct, RouterError> {
    let candidates = event
        .collections
        .remove(cand_name)
        .ok_or_else(|| RouterError::MissingCollection(cand_name.to_string()))
        .map_err(|err| {
            tracing::error!("{err}");
            err
        })?;

    let output = infer.process(&candidates).await?;

    Ok(EventProduct {
        id: event.id,
        weights: output.weights,
        candidates: output.candidates,
    })
}
