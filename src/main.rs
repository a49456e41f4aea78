use anyhow::{bail, Context, Result};
use catalog_ingest::config::{
    self, IngestConfig, DEFAULT_BATCH_SIZE, DEFAULT_DB_PORT, DEFAULT_DB_USER,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_QUEUE_CAPACITY,
};
use catalog_ingest::pipeline::{IngestOutcome, Pipeline};
use catalog_ingest::report;
use catalog_ingest::sink::{MemorySink, Sink, SqlSink};
use catalog_ingest::stats::IngestSummary;
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "catalog-ingest")]
#[command(about = "Load product catalog dumps into a relational database")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv); RUST_LOG overrides it
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a catalog dump and load it into the database
    Ingest(IngestArgs),
    /// Export fixed report queries to CSV files
    Report(ReportArgs),
}

#[derive(Args)]
struct DbArgs {
    /// Full connection URL (postgres://... or sqlite://...)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Postgres host, used when no URL is given
    #[arg(long)]
    db_host: Option<String>,

    #[arg(long, default_value_t = DEFAULT_DB_PORT)]
    db_port: u16,

    #[arg(long)]
    db_name: Option<String>,

    #[arg(long, default_value = DEFAULT_DB_USER)]
    db_user: String,

    #[arg(long, env = "DB_PASS", hide_env_values = true)]
    db_pass: Option<String>,

    /// Connection pool size
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: u32,
}

impl DbArgs {
    fn url(&self) -> Result<String> {
        if let Some(url) = &self.database_url {
            return Ok(url.clone());
        }
        match (&self.db_host, &self.db_name) {
            (Some(host), Some(name)) => Ok(config::postgres_url(
                host,
                self.db_port,
                name,
                &self.db_user,
                self.db_pass.as_deref(),
            )),
            _ => bail!("Either --database-url or both --db-host and --db-name are required"),
        }
    }

    async fn connect(&self) -> Result<SqlSink> {
        let url = self.url()?;
        SqlSink::connect(&url, self.max_connections)
            .await
            .context("Failed to connect to the database")
    }
}

#[derive(Args)]
struct IngestArgs {
    /// Path to the catalog dump (.gz, .bz2 or plain text)
    #[arg(short, long)]
    input: PathBuf,

    #[command(flatten)]
    db: DbArgs,

    /// Products per transaction
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Records buffered between the parser and the writer
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Limit number of records to process (for testing)
    #[arg(long)]
    limit: Option<u64>,

    /// Dry run - parse everything into memory, write nothing
    #[arg(long)]
    dry_run: bool,

    /// Assume the tables already exist
    #[arg(long)]
    skip_schema: bool,

    /// Write the run summary as JSON to this path
    #[arg(long)]
    summary_json: Option<PathBuf>,
}

#[derive(Args)]
struct ReportArgs {
    #[command(flatten)]
    db: DbArgs,

    /// Product asin for the per-product reports (q1-q3)
    #[arg(long)]
    asin: Option<String>,

    /// Output directory for CSV files
    #[arg(short, long, default_value = "out")]
    output: PathBuf,
}

async fn ingest(args: IngestArgs) -> Result<()> {
    let config = IngestConfig {
        batch_size: args.batch_size,
        queue_capacity: args.queue_capacity,
        limit: args.limit,
        show_progress: true,
    };
    config.validate()?;

    let summary = if args.dry_run {
        info!("Dry run: records are kept in memory only");
        let outcome = run_pipeline(Pipeline::new(config, MemorySink::new()), &args).await?;
        println!();
        println!("Dry run held {} products", outcome.sink.products.len());
        outcome.summary
    } else {
        let sink = args.db.connect().await?;
        if !args.skip_schema {
            sink.apply_schema()
                .await
                .context("Failed to apply schema")?;
        }
        run_pipeline(Pipeline::new(config, sink), &args).await?.summary
    };

    if let Some(path) = &args.summary_json {
        write_summary(path, &summary)?;
    }
    Ok(())
}

async fn run_pipeline<S: Sink>(
    pipeline: Pipeline<S>,
    args: &IngestArgs,
) -> Result<IngestOutcome<S>> {
    let stats = pipeline.stats();
    match pipeline.run_file(&args.input).await {
        Ok(outcome) => {
            outcome.summary.print();
            println!("Total time:          {:.2}s", outcome.elapsed.as_secs_f64());
            Ok(outcome)
        }
        Err(e) => {
            eprintln!("Ingest aborted; counters at failure:");
            stats.summary().print();
            Err(e)
        }
    }
}

fn write_summary(path: &Path, summary: &IngestSummary) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create summary file: {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), summary)
        .with_context(|| format!("Failed to write summary: {}", path.display()))?;
    info!(path = %path.display(), "Summary written");
    Ok(())
}

async fn export_reports(args: ReportArgs) -> Result<()> {
    let sink = args.db.connect().await?;
    let files = report::run_reports(sink.pool(), args.asin.as_deref(), &args.output).await?;
    println!();
    println!("{} report files written to {}", files.len(), args.output.display());
    Ok(())
}

fn init_tracing(verbose: u8) {
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("Failed to set tracing subscriber");
        return;
    }

    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .thread_name("catalog-ingest-worker")
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Ingest(args) => rt.block_on(ingest(args)),
        Commands::Report(args) => rt.block_on(export_reports(args)),
    };

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
