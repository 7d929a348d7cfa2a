use clap::Parser;
use miette::{IntoDiagnostic, Result};
use orderpay::application::engine::{PaymentEngine, Stores};
use orderpay::config::Settings;
use orderpay::infrastructure::gateways::build_registry;
use orderpay::interfaces::csv::order_writer::OrderWriter;
use orderpay::interfaces::csv::receipt_writer::ReceiptWriter;
use orderpay::interfaces::jsonl::command_reader::CommandReader;
use orderpay::interfaces::webhook::WebhookEndpoint;
use orderpay::telemetry;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input commands, one JSON object per line
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// TOML settings file; built-in defaults when omitted
    #[arg(long, env = "ORDERPAY_CONFIG")]
    config: Option<PathBuf>,

    /// Also write every receipt line item to this CSV file
    #[arg(long)]
    receipts_out: Option<PathBuf>,

    /// Log level for this crate when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    #[cfg(feature = "storage-rocksdb")]
    if let Some(path) = db_path {
        let store = orderpay::infrastructure::rocksdb::RocksDBStore::open(path).into_diagnostic()?;
        return Ok(Stores {
            orders: Arc::new(store.clone()),
            payments: Arc::new(store.clone()),
            receipts: Arc::new(store),
        });
    }

    #[cfg(not(feature = "storage-rocksdb"))]
    if let Some(path) = db_path {
        tracing::warn!(
            path = %path.display(),
            "Built without the storage-rocksdb feature; falling back to in-memory storage"
        );
    }

    Ok(Stores::in_memory())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.log_level).into_diagnostic()?;

    let settings = Settings::load(cli.config.as_deref()).into_diagnostic()?;
    let registry = build_registry(&settings.processors).into_diagnostic()?;
    let stores = open_stores(cli.db_path)?;
    let engine = Arc::new(PaymentEngine::new(registry, stores, &settings.engine));
    let webhook = WebhookEndpoint::new(engine.clone());

    // Process commands
    let file = File::open(&cli.input).into_diagnostic()?;
    let reader = CommandReader::new(file);
    for command in reader.commands() {
        match command {
            Ok(command) => {
                if let Err(e) = command.apply(&engine, &webhook).await {
                    error!(error = %e, "Error processing command");
                }
            }
            Err(e) => {
                error!(error = %e, "Error reading command");
            }
        }
    }

    let report = engine.recover().await.into_diagnostic()?;
    info!(receipts = report.receipts, orders = report.orders, "Run complete");

    let summaries = engine.order_summaries().await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = OrderWriter::new(stdout.lock());
    writer.write_orders(&summaries).into_diagnostic()?;

    if let Some(path) = cli.receipts_out {
        let receipts = engine.receipts().await.into_diagnostic()?;
        let file = File::create(path).into_diagnostic()?;
        ReceiptWriter::new(file)
            .write_receipts(&receipts)
            .into_diagnostic()?;
    }

    Ok(())
}
