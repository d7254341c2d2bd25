//! Expert distribution CLI
//!
//! # Commands
//!
//! - `serve` - Start the recording control plane
//! - `simulate` - Record a synthetic MoE run and dump it

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use expert_distribution::{
    api::{create_router, AppState},
    error::{DistributionError, Result},
    moe::{simulate, SimulationConfig},
    ExpertDistributionRecorder, RecorderConfig, SyncScope,
};
use tracing_subscriber::EnvFilter;

/// Expert distribution recorder for Mixture-of-Experts inference
#[derive(Parser)]
#[command(name = "expert-distribution")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Recorder flags shared by every command; unset flags fall back to the
/// environment, then to defaults
#[derive(clap::Args)]
struct RecorderArgs {
    /// Directory dump artifacts are written to
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Distributed rank embedded in artifact names
    #[arg(short, long)]
    rank: Option<usize>,

    /// Barrier scope after each device copy: device or stream
    #[arg(long)]
    sync_scope: Option<SyncScope>,
}

impl RecorderArgs {
    fn into_config(self) -> Result<RecorderConfig> {
        let mut config = RecorderConfig::from_env()?;
        if let Some(dir) = self.output_dir {
            config = config.with_output_dir(dir);
        }
        if let Some(rank) = self.rank {
            config = config.with_rank(rank);
        }
        if let Some(scope) = self.sync_scope {
            config = config.with_sync_scope(scope);
        }
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP control plane
    ///
    /// Examples:
    ///   expert-distribution serve --port 30000
    ///   curl -X POST http://127.0.0.1:30000/start_expert_distribution_record
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value = "8080")]
        port: u16,

        #[command(flatten)]
        recorder: RecorderArgs,
    },
    /// Record a synthetic top-k routing run and dump the counts
    Simulate {
        /// MoE layers per step
        #[arg(long, default_value = "4")]
        layers: usize,

        /// Experts per layer
        #[arg(long, default_value = "8")]
        experts: usize,

        /// Experts selected per token
        #[arg(short = 'k', long, default_value = "2")]
        top_k: usize,

        /// Tokens per step
        #[arg(long, default_value = "16")]
        tokens: usize,

        /// Forward steps
        #[arg(long, default_value = "8")]
        steps: usize,

        /// RNG seed
        #[arg(long, default_value = "42")]
        seed: u64,

        #[command(flatten)]
        recorder: RecorderArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            recorder,
        } => {
            serve(&host, port, recorder.into_config()?).await?;
        },
        Commands::Simulate {
            layers,
            experts,
            top_k,
            tokens,
            steps,
            seed,
            recorder,
        } => {
            let sim = SimulationConfig {
                num_layers: layers,
                num_experts: experts,
                top_k,
                tokens_per_step: tokens,
                steps,
                seed,
                ..SimulationConfig::default()
            };
            run_simulation(recorder.into_config()?, &sim)?;
        },
    }

    Ok(())
}

async fn serve(host: &str, port: u16, config: RecorderConfig) -> Result<()> {
    let recorder = Arc::new(ExpertDistributionRecorder::with_host_device(config));
    tracing::info!(
        output_dir = %recorder.config().output_dir.display(),
        rank = recorder.config().rank,
        sync_scope = %recorder.config().sync_scope,
        "starting expert distribution control plane"
    );
    let app = create_router(AppState::new(recorder));

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| DistributionError::InvalidConfig(format!("Invalid address: {e}")))?;

    println!("Server listening on http://{addr}");
    println!();
    println!("Endpoints:");
    println!("  GET  /health                            - Health check");
    println!("  POST /start_expert_distribution_record  - Start recording");
    println!("  POST /stop_expert_distribution_record   - Stop recording");
    println!("  POST /dump_expert_distribution_record   - Write CSV and reset");
    println!("  POST /reset_expert_distribution_record  - Discard and reset");
    println!("  GET  /expert_distribution_record/status - Recorder status");
    println!();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| DistributionError::Server {
            reason: format!("Failed to bind: {e}"),
        })?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| DistributionError::Server {
            reason: format!("Server error: {e}"),
        })?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
    tracing::info!("shutting down");
}

fn run_simulation(config: RecorderConfig, sim: &SimulationConfig) -> Result<()> {
    let recorder = ExpertDistributionRecorder::with_host_device(config);

    recorder.start();
    let batches = simulate(&recorder, sim)?;
    recorder.stop();
    let report = recorder.dump()?;

    println!("Recorded {batches} routing batches");
    println!("  Layers:      {}", report.layers);
    println!("  Rows:        {}", report.rows);
    println!("  Activations: {}", report.total_activations);
    println!("  Artifact:    {}", report.path.display());
    Ok(())
}
