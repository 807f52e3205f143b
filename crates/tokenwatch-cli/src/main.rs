use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tokenwatch_analysis::{AnomalyScorer, ScoreOutcome};
use tokenwatch_cli::config::{PipelineArgs, PipelineConfig, ScoringArgs};
use tokenwatch_cli::scheduler::{CycleReport, Pipeline, Scheduler};
use tokenwatch_data::export::export_batch;
use tokenwatch_data::store::{Store, INGEST_CURSOR};
use tokenwatch_data::types::Transaction;
use tokenwatch_data::{LogSource, RpcLogSource};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tokenwatch")]
#[command(about = "ERC-20 transfer ingestion and anomaly scoring")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[arg(long, global = true, env = "TOKENWATCH_DB_PATH", default_value = "data/tokenwatch.sqlite")]
    db_path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest and score on a fixed interval until Ctrl-C.
    Run(PipelineArgs),
    /// Run a single ingestion and scoring cycle.
    Sync(PipelineArgs),
    /// Rescore the most recent transactions without ingesting.
    Score(ScoringArgs),
    /// Trailing-window metrics and ingestion progress.
    Status(WindowArgs),
    /// List transactions of the trailing window, newest first.
    List(ListArgs),
    /// Write the trailing window as a JSON blob.
    Export(ExportArgs),
}

#[derive(Args, Debug)]
struct WindowArgs {
    /// Size of the trailing window in hours.
    #[arg(long, default_value_t = 24)]
    hours: u64,
}

#[derive(Args, Debug)]
struct ListArgs {
    #[command(flatten)]
    window: WindowArgs,

    #[arg(long)]
    anomalies_only: bool,

    #[arg(long, default_value_t = 50)]
    limit: usize,

    /// Output format: table (default) or json.
    #[arg(long, default_value = "table")]
    output: String,
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[command(flatten)]
    window: WindowArgs,

    #[arg(long, env = "TOKENWATCH_EXPORT_DIR", default_value = "data/export")]
    dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    // A missing .env file is fine; real environment variables still apply.
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    match cli.command {
        Commands::Run(args) => handle_run(&cli.db_path, args).await,
        Commands::Sync(args) => handle_sync(&cli.db_path, args).await,
        Commands::Score(args) => handle_score(&cli.db_path, args),
        Commands::Status(args) => handle_status(&cli.db_path, args),
        Commands::List(args) => handle_list(&cli.db_path, args),
        Commands::Export(args) => handle_export(&cli.db_path, args).await,
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn open_store(db_path: &str) -> Result<Store> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    Store::new(db_path).wrap_err("failed to open SQLite store")
}

async fn connect(args: PipelineArgs) -> Result<(PipelineConfig, RpcLogSource)> {
    let config = args.into_config().wrap_err("invalid pipeline configuration")?;
    let source = RpcLogSource::new(&config.rpc_url).wrap_err("invalid RPC endpoint")?;
    // An unreachable endpoint is not fatal; each cycle retries it.
    match source.current_head().await {
        Ok(head) => info!(latest_block = head, "RPC endpoint reachable"),
        Err(err) => warn!(%err, "RPC endpoint not reachable yet, cycles will retry"),
    }
    Ok((config, source))
}

async fn handle_run(db_path: &str, args: PipelineArgs) -> Result<()> {
    let (config, source) = connect(args).await?;
    let store = open_store(db_path)?;
    let interval = config.poll_interval;
    info!(
        contract = %config.contract,
        interval_secs = interval.as_secs(),
        db_path,
        "starting scheduler"
    );

    let mut scheduler = Scheduler::new(Pipeline::new(source, &store, config), interval);
    let cycles = scheduler
        .run(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(%err, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .await;

    info!(cycles, "scheduler exited");
    Ok(())
}

async fn handle_sync(db_path: &str, args: PipelineArgs) -> Result<()> {
    let (config, source) = connect(args).await?;
    let store = open_store(db_path)?;
    let pipeline = Pipeline::new(source, &store, config);

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .wrap_err("failed to create progress style")?,
    );
    pb.set_message("fetching, persisting and scoring transfers");
    pb.enable_steady_tick(std::time::Duration::from_millis(100));

    let report = pipeline.run_cycle().await;
    pb.finish_and_clear();
    let report = report.wrap_err("sync cycle failed")?;

    print_cycle_report(&report);
    if !report.persist.is_complete() {
        return Err(eyre!(
            "{} batch(es) failed to persist; rerun sync to retry the range",
            report.persist.failed_batches()
        ));
    }
    Ok(())
}

fn handle_score(db_path: &str, args: ScoringArgs) -> Result<()> {
    let scoring = args.into_config().wrap_err("invalid scoring configuration")?;
    let store = open_store(db_path)?;

    let outcome = AnomalyScorer::new(&store, scoring.scorer)
        .score(scoring.window_size)
        .wrap_err("scoring pass failed")?;

    match outcome {
        ScoreOutcome::Skipped { available } => println!(
            "Skipped: {available} transaction(s) stored, need at least {}",
            scoring.scorer.min_rows
        ),
        ScoreOutcome::Scored { rows, anomalies } => {
            println!("Scored {rows} transaction(s), {anomalies} flagged as anomalous")
        }
    }
    Ok(())
}

fn handle_status(db_path: &str, args: WindowArgs) -> Result<()> {
    let store = open_store(db_path)?;
    let since = window_start(args.hours);

    let metrics = store
        .window_metrics(since)
        .wrap_err("failed to query window metrics")?;
    let total = store
        .transaction_count()
        .wrap_err("failed to count transactions")?;
    let cursor = store
        .cursor(INGEST_CURSOR)
        .wrap_err("failed to read ingestion cursor")?;

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Database Path", db_path]);
    table.add_row(vec![
        "Last Processed Block".to_string(),
        cursor.map_or_else(|| "N/A".to_string(), |b| b.to_string()),
    ]);
    table.add_row(vec!["Stored Transactions".to_string(), total.to_string()]);
    table.add_row(vec!["Window".to_string(), format!("last {} h", args.hours)]);
    table.add_row(vec![
        "Total Volume".to_string(),
        format!("{:.2}", metrics.total_volume),
    ]);
    table.add_row(vec![
        "Transactions".to_string(),
        metrics.transaction_count.to_string(),
    ]);
    table.add_row(vec![
        "Anomalies".to_string(),
        metrics.anomaly_count.to_string(),
    ]);

    println!("{table}");
    Ok(())
}

fn handle_list(db_path: &str, args: ListArgs) -> Result<()> {
    let store = open_store(db_path)?;
    let rows = store
        .transactions_since(window_start(args.window.hours), args.anomalies_only, args.limit)
        .wrap_err("failed to query transactions")?;

    match args.output.as_str() {
        "table" => print_transactions_table(&rows),
        "json" => {
            let json = serde_json::to_string_pretty(&rows).wrap_err("failed to serialize JSON")?;
            println!("{json}");
        }
        other => {
            return Err(eyre!(
                "unknown output format '{}'; use 'table' or 'json'",
                other
            ))
        }
    }
    Ok(())
}

async fn handle_export(db_path: &str, args: ExportArgs) -> Result<()> {
    let store = open_store(db_path)?;
    let mut rows = store
        .transactions_since(window_start(args.window.hours), false, i64::MAX as usize)
        .wrap_err("failed to query transactions")?;
    rows.reverse();

    let first_timestamp = rows.first().map(|t| t.timestamp);
    let path = export_batch(&args.dir, first_timestamp, &rows).await?;
    println!("Exported {} transaction(s) to {}", rows.len(), path.display());
    Ok(())
}

/// Unix timestamp `hours` before now.
fn window_start(hours: u64) -> u64 {
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    now.saturating_sub(hours.saturating_mul(3600))
}

fn format_timestamp(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

fn short(hex: &str) -> String {
    if hex.len() <= 14 {
        return hex.to_string();
    }
    format!("{}…{}", &hex[..8], &hex[hex.len() - 4..])
}

fn print_transactions_table(rows: &[Transaction]) {
    if rows.is_empty() {
        println!("No transactions in window");
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec![
        "Block", "Time (UTC)", "Tx", "From", "To", "Amount", "Score", "Anomaly",
    ]);
    for t in rows {
        table.add_row(vec![
            t.block_number.to_string(),
            format_timestamp(t.timestamp),
            short(&t.tx_hash),
            short(&t.from_address),
            short(&t.to_address),
            format!("{:.6}", t.amount),
            t.anomaly_score
                .map_or_else(|| "-".to_string(), |s| format!("{s:.4}")),
            if t.is_anomaly { "yes" } else { "" }.to_string(),
        ]);
    }
    println!("{table}");
}

fn print_cycle_report(report: &CycleReport) {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec![
        "Range".to_string(),
        report
            .range
            .map_or_else(|| "up to date".to_string(), |(s, e)| format!("{s} - {e}")),
    ]);
    table.add_row(vec!["Fetched".to_string(), report.fetched.to_string()]);
    table.add_row(vec![
        "Inserted".to_string(),
        report.persist.inserted_count().to_string(),
    ]);
    table.add_row(vec![
        "Already Stored".to_string(),
        report.persist.skipped.to_string(),
    ]);
    table.add_row(vec![
        "Failed Batches".to_string(),
        report.persist.failed_batches().to_string(),
    ]);
    table.add_row(vec![
        "Cursor Advanced".to_string(),
        report.cursor_advanced.to_string(),
    ]);
    let scoring = match &report.scoring {
        Ok(ScoreOutcome::Scored { rows, anomalies }) => format!("{rows} rows, {anomalies} anomalous"),
        Ok(ScoreOutcome::Skipped { available }) => format!("skipped ({available} rows)"),
        Err(err) => format!("failed: {err}"),
    };
    table.add_row(vec!["Scoring".to_string(), scoring]);
    if let Some(path) = &report.exported {
        table.add_row(vec!["Exported".to_string(), path.display().to_string()]);
    }
    println!("{table}");
}
