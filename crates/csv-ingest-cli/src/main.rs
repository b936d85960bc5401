use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use csv_ingest_core::{parse_delimiter, ExistingTable, IngestOptions, IngestSummary, OverflowPolicy};
use csv_ingest_store_sqlite::ingest_with_options;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "ingest.v1";
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "ingest", version)]
#[command(about = "Load a CSV file into a SQLite table with one TEXT column per header field")]
struct Cli {
    /// SQLite database file; created if missing.
    destination: PathBuf,

    /// Delimited text file whose first record is the header.
    source: PathBuf,

    /// Drop and recreate the table if it already exists instead of failing.
    #[arg(long, default_value_t = false)]
    replace: bool,

    /// How to fit rows with more fields than the header.
    #[arg(long, value_enum, default_value_t = OverflowArg::Truncate)]
    overflow: OverflowArg,

    /// Field delimiter: a single ASCII character, or `\t` for tab.
    #[arg(long, default_value = ",", value_parser = parse_delimiter)]
    delimiter: u8,

    /// Print the ingestion summary as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OverflowArg {
    Truncate,
    MergeIntoLast,
}

impl Cli {
    fn options(&self) -> IngestOptions {
        IngestOptions {
            delimiter: self.delimiter,
            existing_table: if self.replace {
                ExistingTable::Replace
            } else {
                ExistingTable::Fail
            },
            overflow: match self.overflow {
                OverflowArg::Truncate => OverflowPolicy::Truncate,
                OverflowArg::MergeIntoLast => OverflowPolicy::MergeIntoLast,
            },
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn summary_json(cli: &Cli, summary: &IngestSummary) -> Result<Value> {
    let mut value = serde_json::to_value(summary)?;
    if let Value::Object(object) = &mut value {
        object.insert("source".to_string(), Value::String(cli.source.display().to_string()));
        object.insert(
            "destination".to_string(),
            Value::String(cli.destination.display().to_string()),
        );
        object.insert(
            "contract_version".to_string(),
            Value::String(CLI_CONTRACT_VERSION.to_string()),
        );
    }
    Ok(value)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let options = cli.options();
    tracing::debug!(?options, source = %cli.source.display(), "starting ingestion");
    let summary = ingest_with_options(&cli.destination, &cli.source, &options)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary_json(&cli, &summary)?)?);
    } else {
        println!(
            "Successfully converted {} to {} ({summary})",
            cli.source.display(),
            cli.destination.display()
        );
    }

    Ok(())
}
