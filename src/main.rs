mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use nestscan::config::Config;
use nestscan::observability::init_logging;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let config = Config::load()?;
    init_logging(config.telemetry.log_format);

    match cli.command {
        Commands::Worker(args) => commands::worker(config, args.stage).await?,
        Commands::Submit(args) => commands::submit(config, args).await?,
        Commands::Explore(args) => commands::explore(config, args)?,
        Commands::Scan(args) => commands::scan(config, args).await?,
        Commands::Config => commands::show_config(&config)?,
    }

    Ok(())
}
