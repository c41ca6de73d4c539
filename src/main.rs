use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::error;

use pbis_collection::db::{self, PgStore};
use pbis_collection::{report, CollectionError, Collector, EngineConfig};

#[derive(Parser)]
#[command(name = "pbis-collection")]
#[command(about = "Weekly PBIS card collection: levels, team progress and prize drawings", long_about = None)]
struct Cli {
    /// JSON file overriding the default thresholds and counts
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demo teams, students and cards
    Seed,
    /// Import cards from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Show what a collection would do without writing anything
    Preview,
    /// Run a collection now
    Run,
    /// Finish a collection that stopped part way
    Resume,
    /// Close a stopped collection that cannot be resumed
    Abandon,
    /// Write a markdown report of the latest collection
    Report {
        #[arg(long, default_value = "pbis-report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} cards from {}.", csv.display());
        }
        Commands::Preview => {
            let collector = Collector::new(PgStore::new(pool.clone(), config.lock_key), config);
            let plan = collector.preview(Utc::now()).await?;
            let names = db::student_names(&pool).await?;
            print!("{}", report::render_plan(&plan, &names));
        }
        Commands::Run => {
            let collector = Collector::new(PgStore::new(pool, config.lock_key), config);
            match collector.run(Utc::now()).await {
                Ok(summary) => println!("Collection complete: {summary}."),
                Err(err) => return Err(explain(err)),
            }
        }
        Commands::Resume => {
            let collector = Collector::new(PgStore::new(pool, config.lock_key), config);
            match collector.resume().await {
                Ok(summary) => println!("Collection resumed and complete: {summary}."),
                Err(err) => return Err(explain(err)),
            }
        }
        Commands::Abandon => {
            let collector = Collector::new(PgStore::new(pool, config.lock_key), config);
            match collector.abandon().await {
                Ok(run_id) => println!("Run {run_id} abandoned. Steps it applied were kept."),
                Err(err) => return Err(explain(err)),
            }
        }
        Commands::Report { out } => {
            let mut conn = pool.acquire().await.context("failed to acquire a connection")?;
            let latest = db::fetch_recent_collections(&mut conn, 1).await?;
            let Some(record) = latest.into_iter().next() else {
                println!("No collections have been run yet.");
                return Ok(());
            };
            let teams = db::fetch_teams(&mut conn).await?;
            let names = db::student_names(&pool).await?;
            let report = report::build_report(
                &record,
                &teams,
                &names,
                config.levels_per_school_wide_level,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

/// Logs a failed run with what the operator should do next.
fn explain(err: CollectionError) -> anyhow::Error {
    match &err {
        CollectionError::PartialApplyFailure {
            run_id,
            completed,
            failed_step,
            summary,
            ..
        } => {
            error!(%run_id, %failed_step, completed = completed.len(), "collection stopped part way");
            println!("Collection stopped at '{failed_step}'. Planned: {summary}.");
            println!("Run `pbis-collection resume` to finish it.");
            println!("If it keeps failing on the same step, `pbis-collection abandon` closes it.");
        }
        CollectionError::UnfinishedRun { .. } => {
            println!("Run `pbis-collection resume` first.");
        }
        CollectionError::AbandonAfterMarking { .. } => {
            println!("Run `pbis-collection resume` to record the finished run.");
        }
        other if other.is_retryable() => {
            println!("Nothing was written; it is safe to try again.");
        }
        _ => {}
    }
    err.into()
}
