use clap::Parser;
use shrike::config::ShrikeConfig;
use snafu::prelude::*;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cmd;

use cmd::{RunArgs, ValidateArgs};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Run error: {source}"))]
    Run { source: cmd::run::Error },

    #[snafu(display("Validate error: {source}"))]
    Validate { source: cmd::validate::Error },
}

#[derive(Parser, Debug)]
#[command(name = "shrike")]
#[command(version)]
#[command(about = "A concurrent, graph-based execution engine for declarative HTTP workflows", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Execute a workflow
    Run(RunArgs),
    /// Validate workflow(s) without executing
    Validate(ValidateArgs),
}

fn init_tracing(verbose: bool) {
    let filter_layer = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    let global_config = ShrikeConfig::load().unwrap_or_default();

    match cli.command {
        Commands::Run(args) => {
            init_tracing(args.verbose || global_config.run.verbose);
            cmd::run::handle_run(args, global_config).await.context(RunSnafu)
        }
        Commands::Validate(args) => {
            init_tracing(args.verbose);
            cmd::validate::handle_validate(args).await.context(ValidateSnafu)
        }
    }
}
