//! voxver - train and evaluate speaker verification models.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{EvalCommand, TrainCommand};

/// voxver - speaker verification training on VoxCeleb-style corpora.
///
/// Features are `.npy` matrices laid out as `<root>/id<digits>/.../<file>.npy`.
/// Verification is scored on a trial list of `<label> <enrol> <test>` lines.
#[derive(Parser)]
#[command(name = "voxver")]
#[command(about = "Speaker verification training and evaluation")]
#[command(version)]
pub struct Cli {
    /// Training config file (YAML); defaults apply when omitted
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Output file for the report (default: stdout)
    #[arg(short = 'o', long, global = true)]
    pub output: Option<String>,

    /// Output the report as JSON instead of YAML
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a model, evaluating and checkpointing every epoch
    Train(TrainCommand),
    /// Compute the EER of a checkpoint on a trial list
    Eval(EvalCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v.
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match &cli.command {
        Commands::Train(cmd) => cmd.run(&cli).await,
        Commands::Eval(cmd) => cmd.run(&cli).await,
    }
}
