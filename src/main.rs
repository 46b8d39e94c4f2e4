//! metadata-updater: asks the VRT request API to refresh the metadata of
//! every MediaHaven item of one media type.
//!
//! Items are discovered page by page from the MediaHaven REST API and tracked
//! in a local SQLite database; each is then submitted to the request API once,
//! throttled, with its outcome recorded so interrupted runs resume where they
//! stopped and failed items are retried on the next run.

#![warn(clippy::all)]

mod cli;
mod config;
mod mediahaven;
mod progress;
pub mod retry;
mod server;
mod shutdown;
mod state;
mod sync;
mod types;
mod update;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use config::{Config, Overrides};
use mediahaven::MediahavenClient;
use progress::ProgressReporter;
use state::{ItemStore, SqliteItemStore};
use sync::Synchronizer;
use update::UpdateRequester;

/// Open the store and wire up both API clients.
async fn build_synchronizer(
    config: &Config,
) -> anyhow::Result<(Synchronizer, Arc<dyn ItemStore>)> {
    let db = SqliteItemStore::open(&config.database).await?;
    tracing::debug!("Item database opened at {}", db.path().display());
    let store: Arc<dyn ItemStore> = Arc::new(db);

    let source = Arc::new(MediahavenClient::new(config.mediahaven_settings())?);
    let updater = Arc::new(UpdateRequester::new(
        &config.request_api_url,
        config.retry.clone(),
        config.request_timeout,
    )?);

    let synchronizer = Synchronizer::new(source, updater, store.clone(), config.sync_config());
    Ok((synchronizer, store))
}

/// Run the sync command.
async fn run_sync(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        media_type = %config.media_type,
        page_size = config.page_size,
        max_amount = config.max_amount,
        "Starting metadata-updater"
    );
    let (synchronizer, _) = build_synchronizer(&config).await?;
    let shutdown_token = shutdown::install_signal_handler()?;

    let report = synchronizer.run(shutdown_token).await?;
    if report.failed > 0 {
        tracing::warn!(
            "{} update requests failed; they are retried on the next run",
            report.failed
        );
    }
    Ok(())
}

/// Run the serve command.
async fn run_serve(config: Config) -> anyhow::Result<()> {
    let (synchronizer, store) = build_synchronizer(&config).await?;
    let shutdown_token = shutdown::install_signal_handler()?;

    let state = server::AppState::new(
        Arc::new(synchronizer),
        ProgressReporter::new(store),
        shutdown_token.clone(),
    );
    server::serve(config.bind, state, shutdown_token).await
}

/// Run the status command.
async fn run_status(db_path: &Path) -> anyhow::Result<()> {
    if !db_path.exists() {
        println!("No item database found at {}", db_path.display());
        println!("Run a sync first to create the database.");
        return Ok(());
    }

    let store: Arc<dyn ItemStore> = Arc::new(SqliteItemStore::open(db_path).await?);
    let progress = ProgressReporter::new(store.clone()).report().await;

    println!("Item Database: {}", db_path.display());
    println!();
    println!("Items:");
    println!("  Total:     {}", progress.total);
    println!("  Pending:   {}", progress.pending);
    println!("  Succeeded: {}", progress.succeeded);
    println!("  Failed:    {}", progress.failed);
    println!();

    if let Some(run) = store.last_sync_run().await? {
        println!(
            "Last sync (#{}) started: {}",
            run.id,
            run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        match run.completed_at {
            Some(completed) => {
                println!(
                    "Last sync completed:    {}",
                    completed.format("%Y-%m-%d %H:%M:%S UTC")
                );
                println!(
                    "  {} discovered, {} updated, {} failed{}",
                    run.stats.discovered,
                    run.stats.updated,
                    run.stats.failed,
                    if run.stats.interrupted {
                        " (interrupted)"
                    } else {
                        ""
                    }
                );
            }
            None => println!("Last sync has not completed"),
        }
    }

    Ok(())
}

/// Run the reset-state command.
async fn run_reset_state(db_path: &Path, yes: bool) -> anyhow::Result<()> {
    if !db_path.exists() {
        println!("No item database found at {}", db_path.display());
        return Ok(());
    }

    if !yes {
        println!("This will delete the item database at:");
        println!("  {}", db_path.display());
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    std::fs::remove_file(db_path)?;
    println!("Item database deleted.");

    // SQLite names its side files by appending to the full file name.
    for suffix in ["-wal", "-shm"] {
        let mut side = db_path.as_os_str().to_owned();
        side.push(suffix);
        let _ = std::fs::remove_file(side);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter()));
    match cli.log_format {
        types::LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        types::LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    let config_path = Path::new(&cli.config);
    let mut overrides = Overrides {
        database: cli.database,
        password: cli.mediahaven_password,
        ..Overrides::default()
    };

    match cli.command {
        Command::Status => {
            let db_path = config::database_path(config_path, overrides.database.as_deref())?;
            run_status(&db_path).await
        }
        Command::ResetState(args) => {
            let db_path = config::database_path(config_path, overrides.database.as_deref())?;
            run_reset_state(&db_path, args.yes).await
        }
        Command::Sync(args) => {
            overrides.run = args.run;
            overrides.no_progress_bar = args.no_progress_bar;
            run_sync(Config::load(config_path, overrides)?).await
        }
        Command::Serve(args) => {
            overrides.run = args.run;
            overrides.bind = args.bind;
            // No terminal to draw on behind the HTTP trigger.
            overrides.no_progress_bar = true;
            run_serve(Config::load(config_path, overrides)?).await
        }
    }
}
