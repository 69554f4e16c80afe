use anyhow::Result;
use clap::{Parser, Subcommand};
use cohort_core::RunState;
use cohort_storage::{PgRecordStore, PgRunHistory, RunHistory};
use cohort_sync::PullConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cohort-cli")]
#[command(about = "Admissions results ingestion and analysis")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one pull in the foreground.
    Pull {
        /// New records to scan for; defaults to TARGET_NEW_RECORDS.
        #[arg(long)]
        target: Option<u32>,
    },
    /// Serve the HTTP control surface.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Recompute and cache the analysis snapshot.
    Analyze,
    /// Print the most recent recorded pull.
    Status,
    /// Print the newest stored records.
    Recent {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_run(run: &RunState) {
    let c = &run.counters;
    println!(
        "pull {}: run_id={} range={}..{} processed={} inserted={} duplicates={} failed_batches={} elapsed={}s",
        run.status.as_str(),
        run.run_id.map(|id| id.to_string()).unwrap_or_else(|| "n/a".into()),
        run.range_start.map(|v| v.to_string()).unwrap_or_default(),
        run.range_end.map(|v| v.to_string()).unwrap_or_default(),
        c.processed,
        c.inserted,
        c.duplicates,
        c.failed_batches,
        run.elapsed_seconds(),
    );
    if let Some(err) = &run.error {
        println!("error: {err}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Commands::Pull { target: None });
    info!(?command, "dispatching");

    match command {
        Commands::Pull { target } => {
            let run = cohort_sync::run_pull_once_from_env(target).await?;
            print_run(&run);
        }
        Commands::Serve => cohort_web::serve_from_env().await?,
        Commands::Migrate => {
            let pool = cohort_sync::connect(&PullConfig::from_env()).await?;
            cohort_storage::migrate(&pool).await?;
            println!("migrations applied");
        }
        Commands::Analyze => {
            let runtime = cohort_sync::bootstrap(PullConfig::from_env()).await?;
            let snapshot = runtime.analysis.refresh().await?;
            println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
        }
        Commands::Status => {
            let pool = cohort_sync::connect(&PullConfig::from_env()).await?;
            match PgRunHistory::new(pool).latest().await? {
                Some(run) => print_run(&run),
                None => println!("no pulls recorded"),
            }
        }
        Commands::Recent { limit } => {
            let pool = cohort_sync::connect(&PullConfig::from_env()).await?;
            for row in PgRecordStore::new(pool).latest(limit).await? {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
    }

    Ok(())
}
