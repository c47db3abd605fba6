//! # pgudf-cli
//!
//! Runs loads described by a YAML task file against PostgreSQL.

mod input;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use pgudf_output::sql::{FunctionSql, set_search_path};
use pgudf_output::{Connector, FunctionName, LoadConfig, LoadOrchestrator, PostgresDriver};
use pgudf_page::Schema;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pgudf")]
#[command(about = "Bulk-load CSV files into PostgreSQL through a server-side function")]
#[command(version)]
struct Cli {
    /// Log filter, e.g. `info` or `pgudf_output=debug`; overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every input file as one partition
    Run {
        /// Task file
        #[arg(short, long)]
        config: PathBuf,

        /// CSV input; repeat for more partitions
        #[arg(short, long, required = true)]
        input: Vec<PathBuf>,

        /// Transaction time the function is named after (RFC 3339)
        #[arg(long)]
        at: Option<String>,
    },

    /// Print the SQL a load would run, without connecting
    Plan {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(long)]
        at: Option<String>,
    },

    /// Drop a function left behind by a failed load
    Cleanup {
        #[arg(short, long)]
        config: PathBuf,

        /// Generated name, e.g. fn_00000000550cb480075bcd15
        #[arg(short, long)]
        function: FunctionName,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;

    match cli.command {
        Commands::Run { config, input, at } => run(&config, &input, at.as_deref()).await,
        Commands::Plan { config, at } => plan(&config, at.as_deref()),
        Commands::Cleanup { config, function } => cleanup(&config, &function).await,
    }
}

fn init_tracing(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_config(path: &Path) -> Result<LoadConfig> {
    LoadConfig::from_path(path).with_context(|| format!("failed to load {}", path.display()))
}

fn transaction_time(at: Option<&str>) -> Result<DateTime<Utc>> {
    match at {
        Some(text) => Ok(DateTime::parse_from_rfc3339(text)
            .with_context(|| format!("invalid --at '{text}'"))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

fn orchestrator(config: LoadConfig, schema: Arc<Schema>) -> LoadOrchestrator {
    let connector = Connector::new(
        Arc::new(PostgresDriver),
        config.connect_properties(),
        config.namespace().map(str::to_string),
    );

    let token = connector.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling pending connection retries");
            token.cancel();
        }
    });

    LoadOrchestrator::new(config, schema, connector)
}

async fn run(config: &Path, inputs: &[PathBuf], at: Option<&str>) -> Result<()> {
    let config = load_config(config)?;
    let time = transaction_time(at)?;
    let schema = Arc::new(config.record_schema()?);

    let partitions = inputs
        .iter()
        .map(|path| input::read_partition(path, &schema))
        .collect::<Result<Vec<_>>>()?;
    info!(
        url = %config.url(),
        partitions = partitions.len(),
        "Starting load"
    );

    let report = orchestrator(config, schema)
        .transaction(time, partitions)
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn plan(config: &Path, at: Option<&str>) -> Result<()> {
    let config = load_config(config)?;
    let schema = config.record_schema()?;
    let function = FunctionName::from_transaction_time(transaction_time(at)?);
    let sql = FunctionSql::new(function.as_str(), &schema);

    if let Some(namespace) = config.namespace() {
        println!("{};", set_search_path(namespace));
    }
    println!("{};", sql.create(&config.function, &config.language));
    println!("{}", sql.call_template());
    println!("{};", sql.drop_if_exists());
    Ok(())
}

async fn cleanup(config: &Path, function: &FunctionName) -> Result<()> {
    let config = load_config(config)?;
    let schema = Arc::new(config.record_schema()?);
    orchestrator(config, schema)
        .cleanup_function(function)
        .await
        .with_context(|| format!("failed to drop {function}"))?;
    info!(function = %function, "Dropped load function");
    Ok(())
}
