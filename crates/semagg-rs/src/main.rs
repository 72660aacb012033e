//! Run a semantic aggregate over JSON rows and print one result per group.
//!
//! Reads the API key from the `OPENROUTER_KEY` environment variable.
//!
//! # Examples
//!
//! ```sh
//! # Summarize every review in a file
//! semagg llm_reduce --prompt "Summarize the complaints" --rows reviews.jsonl
//!
//! # Most urgent ticket per team, rows piped in
//! cat tickets.json | semagg llm_first --prompt "most urgent" --stdin --group-by team
//!
//! # Rerank with a token budget and markdown tuples
//! semagg llm_rerank --prompt "best fit for a beginner" --rows courses.json \
//!   --policy token-budget --format markdown --context-window 32000 --stats
//! ```

use clap::Parser;
use semagg_rs::OpenRouterClient;
use semagg_rs::aggregate::AggregateKind;
use semagg_rs::budget::BudgetPolicy;
use semagg_rs::config::SemaggConfig;
use semagg_rs::engine::{Engine, EpisodeStats, LoggingHandler, cancel_pair};
use semagg_rs::input::{group_rows, parse_rows, read_rows};
use semagg_rs::model::openrouter::OpenRouterModel;
use semagg_rs::model::retry::RetryConfig;
use semagg_rs::prompt::TupleFormat;
use semagg_rs::row::Row;
use serde_json::json;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Run a semantic aggregate (llm_reduce, llm_first, llm_last, llm_rerank)
/// over JSON rows.
///
/// Reads the API key from the OPENROUTER_KEY environment variable.
#[derive(Parser)]
#[command(name = "semagg", version)]
struct Cli {
    /// Aggregate to run: llm_reduce, llm_first, llm_last, or llm_rerank
    function: AggregateKind,

    /// The user prompt driving the aggregate
    #[arg(long)]
    prompt: String,

    // ── Input ──────────────────────────────────────────────────
    /// JSON array or JSON Lines file of row objects
    #[arg(long, conflicts_with = "stdin", required_unless_present = "stdin")]
    rows: Option<PathBuf>,

    /// Read rows from stdin
    #[arg(long)]
    stdin: bool,

    /// Split rows into groups by this field
    #[arg(long)]
    group_by: Option<String>,

    // ── Model ──────────────────────────────────────────────────
    /// Model to call (overrides the config file)
    #[arg(long)]
    model: Option<String>,

    /// Maximum tokens per response
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Transport retries for transient HTTP failures
    #[arg(long)]
    retries: Option<u32>,

    // ── Planning ───────────────────────────────────────────────
    /// Rows per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Context window in tokens (token-budget policy)
    #[arg(long)]
    context_window: Option<usize>,

    /// Batch sizing policy: cardinality or token-budget
    #[arg(long)]
    policy: Option<BudgetPolicy>,

    /// Tuple serialization: xml, markdown, or json
    #[arg(long)]
    format: Option<TupleFormat>,

    /// Concurrent requests per round (0 = unbounded)
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    // ── Output ─────────────────────────────────────────────────
    /// Print episode statistics to stderr
    #[arg(long)]
    stats: bool,

    /// More logging (-v info, -vv debug, -vvv trace). RUST_LOG wins when set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

/// Layer CLI flags over the config file.
fn build_config(cli: &Cli) -> Result<SemaggConfig, String> {
    let mut config = match &cli.config {
        Some(path) => SemaggConfig::load(path).map_err(|e| e.to_string())?,
        None => SemaggConfig::default(),
    };

    if let Some(ref model) = cli.model {
        config.model.name = model.clone();
    }
    if let Some(tokens) = cli.max_tokens {
        config.model.max_output_tokens = tokens;
    }
    if let Some(temperature) = cli.temperature {
        config.model.temperature = temperature;
    }
    if let Some(retries) = cli.retries {
        config.retries = retries;
    }

    let mut engine = config.engine;
    if let Some(size) = cli.batch_size {
        engine = engine.with_batch_size(size);
    }
    if let Some(tokens) = cli.context_window {
        engine = engine.with_context_window(tokens);
    }
    if let Some(policy) = cli.policy {
        engine = engine.with_policy(policy);
    }
    if let Some(format) = cli.format {
        engine = engine.with_tuple_format(format);
    }
    if let Some(limit) = cli.max_in_flight {
        engine = engine.with_max_in_flight(limit);
    }
    engine.validate().map_err(|e| e.to_string())?;
    config.engine = engine;
    Ok(config)
}

fn load_rows(cli: &Cli) -> Result<Vec<Row>, String> {
    if cli.stdin {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("failed to read stdin: {e}"))?;
        return parse_rows(&buf);
    }
    match &cli.rows {
        Some(path) => read_rows(path),
        None => Err("provide --rows FILE or --stdin".to_string()),
    }
}

async fn run(cli: &Cli) -> Result<(), String> {
    let config = build_config(cli)?;
    let rows = load_rows(cli)?;
    let groups = group_rows(rows, cli.group_by.as_deref());
    info!(
        "{} over {} group(s) with {}",
        cli.function,
        groups.len(),
        config.model.name
    );

    let api_key = std::env::var("OPENROUTER_KEY")
        .map_err(|_| "OPENROUTER_KEY environment variable is not set".to_string())?;
    let client = OpenRouterClient::new(api_key)
        .map_err(|e| format!("failed to create API client: {e}"))?;
    let model = OpenRouterModel::new(client, config.model.clone())
        .with_retry(RetryConfig::with_retries(config.retries));

    let (cancel, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; abandoning in-flight requests");
            cancel.cancel();
        }
    });

    let engine = Engine::new(&model, config.engine.clone())
        .with_event_handler(&LoggingHandler)
        .with_cancel_signal(signal);

    let total = groups.len();
    let mut failed = 0;
    let mut totals = EpisodeStats::new("total");
    for (key, result) in engine
        .finalize_groups(cli.function, groups, &cli.prompt)
        .await
    {
        match result {
            Ok(episode) => {
                println!("{}", json!({ "group": key, "result": episode.value.to_json() }));
                totals.absorb(&episode.stats);
            }
            Err(e) => {
                failed += 1;
                println!("{}", json!({ "group": key, "error": e.to_string() }));
            }
        }
    }

    if cli.stats {
        eprintln!("{}", totals.summary());
    }
    if failed > 0 {
        return Err(format!("{failed} of {total} group(s) failed"));
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
