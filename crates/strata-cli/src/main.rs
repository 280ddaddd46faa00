use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use strata::config::Config;
use strata::embedding::{Embedder, HashEmbedder};
use strata::storage::MemoryStore;
use strata::{CallerIdentity, MemoryService};
use strata_cli::commands::{
    ConsolidateCommand, ContextCommand, MemoryCommand, RecallCommand, SearchCommand, StatsCommand,
    SweepCommand,
};
use strata_cli::error::CliResult;
use strata_cli::output::OutputFormat;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Strata CLI - Management tool for the agent memory engine")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(long, short = 'd', global = true, help = "Path to data directory")]
    pub data_dir: Option<PathBuf>,

    #[clap(long, short = 'c', global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    #[clap(long, short = 't', global = true, default_value = "default", help = "Tenant to act as")]
    pub tenant: String,

    #[clap(long, global = true, help = "Allow cross-tenant reads (operator tooling)")]
    pub elevated: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Memory management commands")]
    Memory(MemoryCommand),

    #[clap(about = "Ranked search across memory tiers")]
    Search(SearchCommand),

    #[clap(about = "Composite-scored recall of facts and rules")]
    Recall(RecallCommand),

    #[clap(about = "Assemble a budget-bounded context block")]
    Context(ContextCommand),

    #[clap(about = "Show per-tier counts and backlog health")]
    Stats(StatsCommand),

    #[clap(about = "Run the decay and hygiene sweeps")]
    Sweep(SweepCommand),

    #[clap(about = "Run the consolidation pipeline against the extraction agent")]
    Consolidate(ConsolidateCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(data_dir) = &cli.data_dir {
        config.storage.data_dir = data_dir.clone();
    }

    let store = Arc::new(MemoryStore::open(&config.storage.data_dir)?);
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new());
    let service = MemoryService::new(store, embedder.clone(), config.clone());

    let caller = if cli.elevated {
        CallerIdentity::elevated(&cli.tenant)
    } else {
        CallerIdentity::new(&cli.tenant)
    };

    match &cli.command {
        Command::Memory(cmd) => cmd.execute(&service, &caller, format),
        Command::Search(cmd) => cmd.execute(&service, &caller, format),
        Command::Recall(cmd) => cmd.execute(&service, &caller, format),
        Command::Context(cmd) => cmd.execute(&service, &caller, format),
        Command::Stats(cmd) => cmd.execute(&service, &caller, format),
        Command::Sweep(cmd) => cmd.execute(&service, &config, format),
        Command::Consolidate(cmd) => cmd.execute(&service, embedder, &config, format).await,
    }
}

fn load_config(path: Option<&Path>) -> CliResult<Config> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw).map_err(|e| format!("invalid config file: {e}").into())
        }
        None => Ok(Config::default()),
    }
}
