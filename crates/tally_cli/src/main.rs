mod fixtures;

use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tally_ir::TransactionType;
use tally_runtime::{BookRequest, Engine, EngineConfig, RuntimeError, Value, init_datastore};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Transaction-type engine harness")]
struct Cli {
    /// Engine configuration (JSON); defaults apply when omitted
    #[arg(long, global = true, env = "TALLY_CONFIG")]
    config: Option<PathBuf>,
    /// Record store: `memory:` or a `sqlite:` url
    #[arg(long, global = true, env = "TALLY_STORE", default_value = "memory:")]
    store: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a transaction type for errors
    Validate { file: PathBuf },
    /// Evaluate one expression
    Eval {
        expr: String,
        /// JSON object of names visible to the expression
        #[arg(long)]
        names: Option<PathBuf>,
    },
    /// Run a booking request
    Book {
        request: PathBuf,
        /// JSON object mapping entity class to records, inserted before booking
        #[arg(long)]
        seed: Option<PathBuf>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: std::io::Error },
    #[error("{} is not valid JSON: {source}", path.display())]
    Json { path: PathBuf, source: serde_json::Error },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("{0}")]
    Seed(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tally_cli=info,tally_runtime=warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Validate { file } => {
            let tt: TransactionType = read_json(&file)?;
            let report = tally_runtime::validate(&tt);
            for issue in &report.issues {
                match &issue.rendered {
                    Some(rendered) => eprintln!("{}", rendered),
                    None => eprintln!("{}: {}", issue.location, issue.message),
                }
            }
            print_json(&report);
            Ok(if report.is_valid() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Commands::Eval { expr, names } => {
            let names: BTreeMap<String, Value> = match names {
                Some(path) => {
                    let raw: serde_json::Map<String, serde_json::Value> = read_json(&path)?;
                    raw.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect()
                }
                None => BTreeMap::new(),
            };
            let store = init_datastore(&cli.store).await.map_err(RuntimeError::from)?;
            let engine = Engine::new(store).with_config(config);
            match engine.eval(&expr, names).await {
                Ok(value) => {
                    print_json(&value.to_json());
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    eprintln!("{}: {}", err.category(), err);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Book { request, seed } => {
            let request: BookRequest = read_json(&request)?;
            let store = init_datastore(&cli.store).await.map_err(RuntimeError::from)?;
            if let Some(path) = seed {
                let records: serde_json::Value = read_json(&path)?;
                let inserted = fixtures::seed(store.as_ref(), &records).await?;
                info!(inserted, "seeded store");
            }
            let engine = Engine::new(store).with_config(config);
            let result = engine.book(request).await?;
            print_json(&result);
            Ok(if result.has_errors { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let content = fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("error: failed to serialize output: {}", e),
    }
}
