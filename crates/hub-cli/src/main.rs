use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hub_core::{IngestionRun, RowFilter};
use hub_pipeline::{ingest_all, maybe_build_scheduler, HubConfig, Pipeline, Projection, RecordQuery};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hub-cli")]
#[command(about = "Smart City Data Hub ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass for a source, or for every enabled source.
    Ingest { source: Option<String> },
    /// List registered sources.
    Sources,
    /// Query fully committed records of a source.
    Query {
        #[arg(long)]
        source: String,
        /// Column filter such as `intensity_forecast>=100` or `postcode=E1 6PU`.
        #[arg(long = "filter")]
        filters: Vec<String>,
        /// Return canonical documents instead of relational rows.
        #[arg(long)]
        document: bool,
        #[arg(long)]
        include_partial: bool,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = hub_pipeline::DEFAULT_QUERY_LIMIT)]
        limit: usize,
    },
    /// count/min/max/mean of one column.
    Summarize {
        #[arg(long)]
        source: String,
        #[arg(long)]
        column: String,
    },
    /// Distinct values of one column.
    Distinct {
        #[arg(long)]
        source: String,
        #[arg(long)]
        column: String,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_run(run: &IngestionRun) {
    let c = &run.counts;
    println!(
        "run {} source={} status={} fetched={} accepted={} repaired={} rejected={} created={} updated={} unchanged={} conflicts={} partially_written={}",
        run.run_id,
        run.source_id,
        run.status.as_str(),
        c.fetched,
        c.accepted,
        c.repaired,
        c.rejected,
        c.created,
        c.updated,
        c.unchanged,
        c.conflicts,
        c.partially_written
    );
    if let Some(error) = &run.error {
        println!("  error: {error}");
    }
}

async fn ingest(pipeline: &Pipeline, source: Option<String>) -> Result<()> {
    let runs = match source {
        Some(source_id) => vec![pipeline.ingest(&source_id)?.wait().await?],
        None => ingest_all(pipeline).await,
    };
    for run in &runs {
        print_run(run);
    }

    if !pipeline.pending_reconciliation().is_empty() {
        let report = pipeline.reconcile().await;
        println!(
            "reconciliation: attempted={} committed={} still_pending={}",
            report.attempted,
            report.committed,
            report.still_pending.len()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = HubConfig::from_env();
    let pipeline = Pipeline::from_config(&config).await?;

    match cli.command.unwrap_or(Commands::Ingest { source: None }) {
        Commands::Ingest { source } => ingest(&pipeline, source).await?,
        Commands::Sources => {
            for source_id in pipeline.source_ids() {
                println!("{source_id}");
            }
        }
        Commands::Query {
            source,
            filters,
            document,
            include_partial,
            offset,
            limit,
        } => {
            let mut query = RecordQuery::new(&source)
                .include_partial(include_partial)
                .page(offset, limit);
            if document {
                query = query.projection(Projection::Document);
            }
            for expr in &filters {
                let Some(filter) = RowFilter::parse(expr) else {
                    bail!("cannot parse filter {expr:?}");
                };
                query = query.filter(filter);
            }
            let result = pipeline.query(&query).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Summarize { source, column } => {
            let summary = pipeline.summarize(&source, &column).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Distinct { source, column } => {
            let values = pipeline.distinct(&source, &column).await?;
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
        Commands::Schedule => {
            let Some(sched) = maybe_build_scheduler(&pipeline, &config).await? else {
                bail!("scheduler disabled; set HUB_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
        }
    }

    Ok(())
}
