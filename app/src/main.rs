#![deny(
    clippy::all,
    clippy::nursery,
    clippy::pedantic,
    clippy::style,
    clippy::complexity,
    clippy::perf,
    clippy::correctness,
    clippy::suspicious,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(
    clippy::similar_names,
    clippy::missing_safety_doc,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod command;

use command::{
    CommandStrategy, ExtractInput, ExtractStrategy, InfoStrategy, InitStrategy, RunInput,
    RunStrategy, VersionStrategy,
};

#[derive(Parser)]
#[command(name = "cardrelay")]
#[command(about = "Relay recharge cards from chat channels", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration
    Init,
    /// Run the Telegram relay
    Run {
        /// Bot token (overrides config)
        #[arg(short = 't', long)]
        token: Option<String>,

        /// Keep forwarded records in memory only
        #[arg(long)]
        ephemeral: bool,
    },
    /// Print what the extractor finds in a message, as JSON
    Extract {
        /// Message text; read from stdin when omitted
        text: Option<String>,
    },
    /// Show configuration and record statistics
    Info,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => InitStrategy.execute(()).await,
        Commands::Run { token, ephemeral } => {
            RunStrategy
                .execute(RunInput { token, ephemeral })
                .await
        }
        Commands::Extract { text } => ExtractStrategy.execute(ExtractInput { text }).await,
        Commands::Info => InfoStrategy.execute(()).await,
        Commands::Version => VersionStrategy.execute(()).await,
    }
}
