use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ledger_core::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ledger-cli")]
#[command(about = "Ledger Core CLI - run scripts and postings against an in-memory ledger")]
#[command(version = "1.0.0")]
struct Cli {
    /// Ledger name
    #[arg(short, long, default_value = "default", global = true)]
    ledger: String,

    /// JSON file with the ledger configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Execute without committing anything
    #[arg(long, global = true)]
    preview: bool,

    /// Accept transactions dated before the last committed one
    #[arg(long, global = true)]
    allow_past_timestamps: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Commit a JSON array of transaction data as one batch
    Txs {
        /// File holding `[{"postings": [...], "reference": ..., "metadata": ...}]`
        file: PathBuf,
    },

    /// Run a compiled program
    Script {
        /// File holding the JSON-serialized program
        program: PathBuf,

        /// Variables as a JSON object
        #[arg(long, default_value = "{}")]
        vars: String,

        /// Transaction reference
        #[arg(short, long)]
        reference: Option<String>,
    },

    /// Send an amount from one account to another
    Send {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        /// Asset, e.g. USD/2
        #[arg(long)]
        asset: String,

        #[arg(long)]
        amount: u64,

        /// Also print the compiled program
        #[arg(long)]
        print_program: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref(), cli.allow_past_timestamps)?;
    let ledger = Ledger::new(Arc::new(MemoryStore::new(cli.ledger.clone())), config);
    let options = WriteOptions {
        preview: cli.preview,
        idempotency_key: None,
    };

    let result = match cli.command {
        Commands::Txs { file } => handle_txs(&ledger, file, options).await,
        Commands::Script {
            program,
            vars,
            reference,
        } => handle_script(&ledger, program, vars, reference, options).await,
        Commands::Send {
            from,
            to,
            asset,
            amount,
            print_program,
        } => handle_send(&ledger, from, to, asset, amount, print_program, options).await,
    };
    ledger.close().await?;
    result?;

    let stats = ledger.stats().await?;
    println!("Transactions: {}", stats.transactions);
    println!("Accounts: {}", stats.accounts);
    Ok(())
}

fn load_config(path: Option<&PathBuf>, allow_past_timestamps: bool) -> anyhow::Result<LedgerConfig> {
    let config = match path {
        Some(path) => {
            let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => LedgerConfig::default(),
    };
    Ok(if allow_past_timestamps {
        config.with_past_timestamps(true)
    } else {
        config
    })
}

async fn handle_txs(ledger: &Ledger, file: PathBuf, options: WriteOptions) -> anyhow::Result<()> {
    let raw = fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
    let txs_data: Vec<TransactionData> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;

    let transactions = ledger.execute_txs_data(txs_data, options).await?.wait().await?;
    print_json(&transactions)
}

async fn handle_script(
    ledger: &Ledger,
    program: PathBuf,
    vars: String,
    reference: Option<String>,
    options: WriteOptions,
) -> anyhow::Result<()> {
    let plain = fs::read_to_string(&program).with_context(|| format!("reading {}", program.display()))?;
    let vars: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&vars).context("vars must be a JSON object")?;
    let script = ScriptData {
        plain,
        vars,
        reference,
        ..Default::default()
    };

    let transaction = ledger.execute_script(script, options).await?.wait().await?;
    print_json(&transaction)
}

async fn handle_send(
    ledger: &Ledger,
    from: String,
    to: String,
    asset: String,
    amount: u64,
    print_program: bool,
    options: WriteOptions,
) -> anyhow::Result<()> {
    let asset = Asset::parse(&asset)?;
    let mut builder = ProgramBuilder::new();
    builder.send(&from, &to, Monetary::new(asset, amount));
    let plain = serde_json::to_string(&builder.build())?;
    if print_program {
        println!("Program: {}", plain);
    }

    let transaction = ledger.execute_script(ScriptData::new(plain), options).await?.wait().await?;
    print_json(&transaction)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
