//! Sluice CLI entrypoint.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

use commands::{Commands, ConfigCommands};
use config::CliConfig;

#[derive(Parser)]
#[command(name = "sluice")]
#[command(author, version, about = "Sluice pipeline tooling", long_about = None)]
struct Cli {
    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = CliConfig::load().unwrap_or_default();

    match cli.command {
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Graph { path, format } => {
            handlers::graph(&path, format.unwrap_or(config.output_format))?
        }
        Commands::Schema => handlers::schema()?,
        Commands::Task(args) => handlers::run_task(&config, args).await?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config),
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    }

    Ok(())
}
