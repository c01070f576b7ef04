use anyhow::{bail, Context};
use clap::Parser;
use dotenv::dotenv;
use indicator_extract::config::{ExtractionConfig, DEFAULT_BATCH_SIZE, DEFAULT_CONCURRENCY_LIMIT};
use indicator_extract::data::{
    HttpJobClient, HttpNormalizer, HttpUniverseSource, Symbol, SymbolUniverse, TemplateBook,
};
use indicator_extract::extraction::{MergeStore, Orchestrator, RunSnapshot};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "indicator_extract")]
#[command(about = "Extract per-indicator data for a list of stock symbols")]
struct Cli {
    /// Symbols to extract; ignored with --universe
    symbols: Vec<Symbol>,

    /// Extract every symbol of the master list at SYMBOL_UNIVERSE_URL
    #[arg(long)]
    universe: bool,

    /// Symbols per remote job
    #[arg(long, env = "EXTRACTION_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Maximum batches submitting or polling at once
    #[arg(long, env = "EXTRACTION_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY_LIMIT)]
    concurrency: usize,

    /// Seconds between poll rounds
    #[arg(long, env = "EXTRACTION_POLL_INTERVAL_SECS", default_value_t = 5)]
    poll_interval_secs: u64,

    /// Maximum concurrent normalization calls (unbounded if omitted)
    #[arg(long, env = "ENRICHMENT_CONCURRENCY")]
    enrichment_limit: Option<usize>,

    /// Bypass the extraction service cache
    #[arg(long)]
    invalidate_cache: bool,

    /// TOML file of per-indicator template overrides
    #[arg(long)]
    templates: Option<PathBuf>,

    /// Write the merged results as JSON to this file
    #[arg(long)]
    output: Option<PathBuf>,
}

impl Cli {
    fn config(&self) -> ExtractionConfig {
        ExtractionConfig {
            concurrency_limit: self.concurrency,
            batch_size: self.batch_size,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            enrichment_limit: self.enrichment_limit,
        }
    }
}

/// Resolves the symbols to extract from the command line or the master list.
async fn resolve_symbols(cli: &Cli) -> anyhow::Result<Vec<Symbol>> {
    if cli.universe {
        let source = HttpUniverseSource::from_env()?;
        let universe = SymbolUniverse::new(Arc::new(source));
        let symbols = universe
            .symbols()
            .await
            .context("Failed to load the symbol master list")?;
        return Ok(symbols.as_ref().clone());
    }

    if cli.symbols.is_empty() {
        bail!("No symbols given; pass symbols or --universe");
    }
    Ok(cli.symbols.clone())
}

/// Prints a progress line whenever the run snapshot changes, until the run
/// reaches a terminal status.
///
/// # Arguments
/// * `orchestrator`: The orchestrator running the extraction
async fn monitor_progress(orchestrator: &Orchestrator) {
    let mut updates = orchestrator.subscribe();
    loop {
        let snapshot = updates.borrow_and_update().clone();
        print_progress(&snapshot);
        if snapshot.status.is_terminal() {
            break;
        }
        if updates.changed().await.is_err() {
            break;
        }
    }
}

fn print_progress(snapshot: &RunSnapshot) {
    println!(
        "[{:?}] {}/{} symbols ({:.1}%) | queued {} | submitting {} | polling {} | failed {}",
        snapshot.status,
        snapshot.progress.completed,
        snapshot.progress.total,
        snapshot.progress.fraction() * 100.0,
        snapshot.queued,
        snapshot.submitting,
        snapshot.polling,
        snapshot.failed_batches,
    );
}

/// Prints how many indicators came back per symbol and how many of them
/// were normalized or failed.
///
/// # Arguments
/// * `store`: The merge store holding the run's results
/// * `symbols`: Symbols requested for the run, in request order
fn print_summary(store: &MergeStore, symbols: &[Symbol]) {
    println!("\nExtraction Summary:");
    for symbol in symbols {
        let items = store.items(symbol);
        if items.is_empty() {
            println!("{}: no results", symbol);
            continue;
        }
        let normalized = items.iter().filter(|item| item.is_normalized()).count();
        let failed = items.iter().filter(|item| !item.success).count();
        println!(
            "{}: {} indicators, {} normalized, {} failed",
            symbol,
            items.len(),
            normalized,
            failed
        );
    }
    println!(
        "Total: {} symbols, {} items",
        store.symbol_count(),
        store.item_count()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config();
    config.validate()?;

    let templates = match &cli.templates {
        Some(path) => TemplateBook::load(path)
            .with_context(|| format!("Failed to load templates from {}", path.display()))?,
        None => TemplateBook::default(),
    };

    let client = HttpJobClient::from_env()?;
    let normalizer = HttpNormalizer::from_env()?;
    let symbols = resolve_symbols(&cli).await?;

    let orchestrator = Orchestrator::spawn(
        config,
        Arc::new(client),
        Arc::new(normalizer),
        templates,
    )?;

    println!(
        "Extracting {} symbols in batches of {}",
        symbols.len(),
        cli.batch_size
    );
    orchestrator.start_extraction(symbols.clone(), cli.batch_size, cli.invalidate_cache)?;

    monitor_progress(&orchestrator).await;
    println!("Waiting for normalization to finish...");
    orchestrator.wait_until_settled().await;

    print_summary(orchestrator.store(), &symbols);

    if let Some(path) = &cli.output {
        let json = serde_json::to_string_pretty(&orchestrator.results())?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write results to {}", path.display()))?;
        println!("Results written to {}", path.display());
    }

    orchestrator.shutdown().await;
    Ok(())
}
