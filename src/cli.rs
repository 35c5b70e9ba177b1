use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nestscan")]
#[command(about = "Explore nested containers and scan their contents", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline worker against the configured broker
    Worker(WorkerArgs),
    /// Publish a scan specification for a path
    Submit(ScanArgs),
    /// List everything found below a path, without scanning it
    Explore(ExploreArgs),
    /// Explore and scan a path in-process, printing the results
    Scan(ScanArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Explorer,
    Processor,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Which stage this worker runs
    #[arg(value_enum)]
    pub stage: StageKind,
}

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Directory or file to scan
    pub path: PathBuf,

    /// Regular expression to look for; without one every object matches
    #[arg(long)]
    pub regex: Option<String>,

    #[arg(long)]
    pub case_sensitive: bool,

    /// Do not extract images from PDF pages
    #[arg(long)]
    pub skip_images: bool,

    /// Override the derived-source depth limit
    #[arg(long)]
    pub max_depth: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ExploreArgs {
    /// Directory or file to explore
    pub path: PathBuf,

    #[arg(long)]
    pub max_depth: Option<usize>,
}
