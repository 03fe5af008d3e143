use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use playdex_etl::{report_markdown, LoadPipeline, Settings};
use playdex_storage::{CatalogStore, MemoryStore, PgStore};
use tracing::info;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "playdex")]
#[command(about = "Play Store dataset normalizer, record API and reports")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Normalize a CSV export and load it into the catalog database.
    Load {
        csv: PathBuf,
        /// Run against an empty in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
        /// Skip the run report directory.
        #[arg(long)]
        no_report: bool,
    },
    /// Apply the embedded schema migrations.
    Migrate,
    /// Serve the record API and reports.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the most recent load runs as markdown.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info")?;
    let cli = Cli::parse();
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };
    let mut settings = Settings::from_env()?;

    match command {
        Commands::Load {
            csv,
            dry_run,
            no_report,
        } => {
            if no_report {
                settings.write_reports = false;
            }
            let store: Arc<dyn CatalogStore> = if dry_run {
                Arc::new(MemoryStore::new())
            } else {
                let store = PgStore::connect(&settings.database)
                    .await
                    .with_context(|| format!("connecting to {}", settings.database.describe()))?;
                store.migrate().await.context("applying migrations")?;
                Arc::new(store)
            };
            let summary = LoadPipeline::new(settings, store)
                .dry_run(dry_run)
                .run_file(&csv)
                .await?;
            println!(
                "load complete: run_id={} input={} duplicates={} missing_key={} unresolved={} inserted={} existing={} reports={}",
                summary.run_id,
                summary.input_rows,
                summary.duplicate_rows,
                summary.missing_key_rows,
                summary.unresolved_rows,
                summary.applications_inserted,
                summary.applications_existing,
                summary.reports_dir.as_deref().unwrap_or("-")
            );
        }
        Commands::Migrate => {
            let target = settings.database.describe();
            let store = PgStore::connect(&settings.database)
                .await
                .with_context(|| format!("connecting to {target}"))?;
            store.migrate().await.context("applying migrations")?;
            store.close().await;
            info!(%target, "migrations applied");
            println!("migrations applied to {target}");
        }
        Commands::Serve { port } => {
            if let Some(port) = port {
                settings.web_port = port;
            }
            playdex_web::serve(&settings).await?;
        }
        Commands::Report { runs } => {
            println!("{}", report_markdown(runs, &settings.reports_dir)?);
        }
    }

    Ok(())
}
