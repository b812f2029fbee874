use abcnet_backend::WeightSource;
use abcnet_core::features::{Aggregation, FeatureOptions, ShortNeighborhood};
use abcnet_core::infer::InferConfig;
use abcnet_core::knn::SearchStrategy;
use abcnet_core::preprocess::Normalization;
use anyhow::Result;
use clap::{Parser, ValueEnum};
use opentelemetry::global;
use std::path::PathBuf;

#[cfg(not(target_os = "linux"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Search {
    /// Compare every pair of candidates
    BruteForce,
    /// Bucket candidates on an (η, φ) grid first. Same neighbours, faster on
    /// large events.
    Grid,
}

/// App Configuration
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// JSON-lines file with one event per line
    #[clap(long, env)]
    input: PathBuf,

    /// Where to write the JSON-lines products. `-` writes to stdout.
    #[clap(default_value = "-", long, env)]
    output: String,

    /// Name of the candidate collection to reweight in every event
    #[clap(default_value = "packedPFCandidates", long, env)]
    cand_name: String,

    /// Number of candidate rows fed to the model. Later candidates get
    /// `--overflow-weight`.
    #[clap(default_value = "4000", long, env)]
    n_pf_cands: usize,

    /// Number of angular nearest neighbours per candidate
    #[clap(default_value = "16", long, env)]
    n_knn: usize,

    #[clap(default_value = "random", long, env, value_enum)]
    weight_source: WeightSource,

    /// Path to `model.onnx`, or to a directory holding it and an optional
    /// `config.json`
    #[clap(long, env, required_if_eq("weight_source", "model"))]
    model_path: Option<PathBuf>,

    /// Seed of the `random` weight source, fixed for the whole job
    #[clap(default_value = "100", long, env)]
    seed: u64,

    /// How neighbour quantities are summarized. Must match what the model
    /// was trained with.
    #[clap(default_value = "mean", long, env, value_enum)]
    aggregation: Aggregation,

    /// How candidates with fewer than `--n-knn` neighbours are aggregated
    #[clap(default_value = "truncate", long, env, value_enum)]
    short_neighborhood: ShortNeighborhood,

    #[clap(default_value = "brute-force", long, env, value_enum)]
    search: Search,

    /// Cell side of the `grid` search, in units of ΔR
    #[clap(default_value = "0.4", long, env)]
    grid_cell_size: f32,

    /// Run the neighbour search on all cores
    #[clap(long, env)]
    parallel: bool,

    /// Weight of candidates past `--n-pf-cands`
    #[clap(default_value = "0.0", long, env)]
    overflow_weight: f32,

    /// JSON file with a per-column `center` and `scale`
    #[clap(long, env)]
    normalization: Option<PathBuf>,

    /// Log the features of every candidate on the `abcnet::features` target
    #[clap(long, env)]
    debug_features: bool,

    /// Outputs the logs in JSON format (useful for telemetry)
    #[clap(long, env)]
    json_output: bool,

    // Whether or not to include the log trace through spans
    #[clap(long, env)]
    disable_spans: bool,

    /// The grpc endpoint for opentelemetry. Telemetry is sent to this endpoint as OTLP over gRPC.
    /// e.g. `http://localhost:4317`
    #[clap(long, env)]
    otlp_endpoint: Option<String>,

    /// The service name for opentelemetry.
    #[clap(default_value = "abcnet.producer", long, env)]
    otlp_service_name: String,

    /// Serve Prometheus metrics on this port while the job runs
    #[clap(long, env)]
    prometheus_port: Option<u16>,
}

impl Args {
    pub fn search_strategy(&self) -> SearchStrategy {
        match self.search {
            Search::BruteForce => SearchStrategy::BruteForce,
            Search::Grid => SearchStrategy::Grid {
                cell_size: self.grid_cell_size,
            },
        }
    }

    pub fn infer_config(&self) -> Result<InferConfig> {
        let normalization = self
            .normalization
            .as_deref()
            .map(Normalization::from_path)
            .transpose()?;

        Ok(InferConfig {
            n_pf_cands: self.n_pf_cands,
            n_knn: self.n_knn,
            features: FeatureOptions {
                aggregation: self.aggregation,
                short_neighborhood: self.short_neighborhood,
                search: self.search_strategy(),
                parallel: self.parallel,
                debug: self.debug_features,
            },
            overflow_weight: self.overflow_weight,
            normalization,
        })
    }
}


#[tokio::main]
async fn main() -> Result<()> {
    // Pattern match configuration
    let args: Args = Args::parse();

    // Initialize logging and telemetry
    let global_tracer = abcnet_router::init_logging(
        args.otlp_endpoint.as_deref(),
        args.otlp_service_name.clone(),
        args.json_output,
        args.disable_spans,
        args.debug_features,
    );

    tracing::info!("{args:?}");

    let config = args.infer_config()?;

    abcnet_router::run(
        args.input,
        args.output,
        args.cand_name,
        args.weight_source,
        args.model_path,
        args.seed,
        config,
        args.prometheus_port,
    )
    .await?;

    if global_tracer {
        // Shutdown tracer
        global::shutdown_tracer_provider();
    }
    Ok(())
}
