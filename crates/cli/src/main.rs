use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;

/// Bake packages inside disposable containers.
#[derive(Parser)]
#[command(name = "kiln", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble a recipe's build context and write it to a tar file
    Context(cmd::context::ContextOpts),

    /// Print the content key of a recipe's resolved source
    Key(cmd::key::KeyOpts),

    /// Show which source type claims a location
    Guess(cmd::guess::GuessOpts),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    match Cli::parse().command {
        Commands::Context(opts) => cmd::context::run(opts),
        Commands::Key(opts) => cmd::key::run(opts),
        Commands::Guess(opts) => cmd::guess::run(opts),
    }
}
