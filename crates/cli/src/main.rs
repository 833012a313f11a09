use clap::{Parser, Subcommand};

mod commands;

use commands::{CalibrateArgs, CheckConfigArgs, RunArgs};

#[derive(Parser)]
#[command(name = "xarb")]
#[command(about = "Cross-venue arbitrage engine for Kalshi and Polymarket", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against paper venues
    Run(RunArgs),
    /// Load and validate a config file, then print the effective config
    CheckConfig(CheckConfigArgs),
    /// Refit race model parameters from a fill log
    Calibrate(CalibrateArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => commands::run_engine(args).await?,
        Commands::CheckConfig(args) => commands::run_check_config(&args)?,
        Commands::Calibrate(args) => commands::run_calibrate(&args)?,
    }

    Ok(())
}
