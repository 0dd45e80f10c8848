use clap::{Parser, Subcommand};

mod commands;

use commands::{CheckConfigArgs, ReplayArgs};

#[derive(Parser)]
#[command(name = "pairquote")]
#[command(about = "Paired UP/DOWN quoting engine for 15-minute binary markets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded JSONL session through the engine (always dry run)
    Replay(ReplayArgs),
    /// Load, validate and print the effective configuration
    CheckConfig(CheckConfigArgs),
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
        Commands::Replay(args) => commands::run_replay(args).await?,
        Commands::CheckConfig(args) => commands::run_check_config(&args)?,
    }

    Ok(())
}
