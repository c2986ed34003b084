use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use calimg::api::{self, AppState};
use calimg::cache::{HistoryMode, ImageCache};
use calimg::clock::{Clock, SystemClock};
use calimg::config::{ConfigStore, watcher};
use calimg::dispatch::Dispatcher;
use calimg::fetch::HttpFetcher;
use calimg::history::{HistoryLedger, Trigger};
use calimg::naming::ConfigId;
use calimg::pipeline::{Pipeline, PipelineRunner, RunOptions};
use calimg::render::TemplateRenderer;
use calimg::scheduler::Scheduler;
use calimg::settings::Settings;
use calimg::worker::{WorkerPool, ipc};

#[derive(Parser)]
#[command(name = "calimg")]
#[command(version)]
#[command(about = "Pre-rendered calendar images over HTTP")]
#[command(long_about = "\
calimg serves pre-rendered images (PNG/JPEG/BMP) derived from iCalendar
feeds and auxiliary JSON sources, keyed by configuration id.

Configs are JSON files in CONFIG_DIR (one per id); generated artifacts,
their metadata, and per-config checksum history live in CACHE_DIR.
Configs with a preGenerateInterval cron expression are regenerated in the
background by isolated worker processes; everything else renders on
demand.

ENVIRONMENT VARIABLES:
    CONFIG_DIR      Config directory (default: ./config)
    CACHE_DIR       Cache directory (default: ./cache)
    TEMPLATES_DIR   Template directory (default: ./templates)
    RUST_LOG        Log filter (default: calimg=info)")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: HTTP server, scheduler, and config watcher
    Serve {
        /// HTTP port
        #[arg(long, default_value = "3000", env = "PORT")]
        port: u16,

        /// Bind address
        #[arg(long, default_value = "0.0.0.0", env = "CALIMG_BIND_ADDR")]
        bind_addr: String,
    },

    /// Generate one config's image from the CLI and cache it
    Generate {
        /// Config id (file stem under CONFIG_DIR)
        id: String,
    },

    /// Worker-pool child entry point (spawned by the daemon)
    #[command(hide = true)]
    Worker {
        /// Config id to generate
        #[arg(long)]
        id: String,

        /// Provenance tag for the run
        #[arg(long, default_value = "scheduled")]
        trigger: String,
    },
}

/// Everything the commands share, wired once.
struct App {
    configs: Arc<ConfigStore>,
    cache: Arc<ImageCache>,
    ledger: Arc<HistoryLedger>,
    pipeline: Arc<dyn PipelineRunner>,
}

/// `history_mode` must be [`HistoryMode::Awaited`] for the one-shot
/// commands: their runtime is dropped right after the run, which would
/// cancel a detached append.
fn compose(settings: &Settings, clock: Arc<dyn Clock>, history_mode: HistoryMode) -> App {
    let configs = ConfigStore::new(&settings.config_dir);
    let ledger = HistoryLedger::new(&settings.cache_dir, Arc::clone(&clock));
    let cache = ImageCache::with_history_mode(
        &settings.cache_dir,
        Arc::clone(&ledger),
        Arc::clone(&clock),
        history_mode,
    );
    let fetcher = HttpFetcher::new();
    let renderer = TemplateRenderer::new(&settings.templates_dir);
    let pipeline: Arc<dyn PipelineRunner> = Pipeline::new(
        Arc::clone(&configs),
        Arc::clone(&cache),
        Arc::clone(&fetcher) as _,
        fetcher as _,
        renderer as _,
        clock,
    );
    App {
        configs,
        cache,
        ledger,
        pipeline,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs always go to stderr; the worker child's stdout is a framed
    // IPC channel and must stay clean.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("calimg=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_env();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Commands::Serve { port, bind_addr } => serve(&settings, clock, &bind_addr, port).await,
        Commands::Generate { id } => generate(&settings, clock, &id).await,
        Commands::Worker { id, trigger } => worker(&settings, clock, &id, &trigger).await,
    }
}

async fn serve(
    settings: &Settings,
    clock: Arc<dyn Clock>,
    bind_addr: &str,
    port: u16,
) -> anyhow::Result<()> {
    tracing::info!(
        config_dir = %settings.config_dir.display(),
        cache_dir = %settings.cache_dir.display(),
        templates_dir = %settings.templates_dir.display(),
        "Starting calimg daemon"
    );

    let app = compose(settings, Arc::clone(&clock), HistoryMode::Detached);

    // Scheduled runs render out of process: a fresh child per run, so
    // renderer state never accumulates in the daemon.
    let pool = WorkerPool::from_current_exe()?;
    let scheduler = Scheduler::new(
        Arc::clone(&app.configs),
        Arc::clone(&app.cache),
        Arc::clone(&app.ledger),
        pool,
        Arc::clone(&clock),
    );
    scheduler.init().await?;

    let (events, watch_handle) =
        watcher::spawn(Arc::clone(&app.configs), watcher::WatchOptions::default());
    tokio::spawn(Arc::clone(&scheduler).watch(events));

    let dispatcher = Dispatcher::new(
        app.configs,
        app.cache,
        app.ledger,
        app.pipeline,
    );

    let state = AppState {
        dispatcher,
        scheduler,
    };
    let result = api::run_server(state, bind_addr, port).await;
    watch_handle.abort();
    result
}

async fn generate(settings: &Settings, clock: Arc<dyn Clock>, id: &str) -> anyhow::Result<()> {
    let app = compose(settings, clock, HistoryMode::Awaited);
    app.cache.ensure_dir().await?;
    app.ledger.init().await?;

    let id = ConfigId::new(id)?;
    let output = app
        .pipeline
        .run(
            &id,
            RunOptions {
                trigger: Trigger::OnDemand,
                save_cache: true,
            },
        )
        .await?;
    tracing::info!(
        id = %id,
        crc32 = %output.crc32,
        size = output.bytes.len(),
        duration_ms = output.duration_ms,
        event_count = output.event_count,
        changed = output.changed,
        "Generation complete"
    );
    Ok(())
}

async fn worker(
    settings: &Settings,
    clock: Arc<dyn Clock>,
    id: &str,
    trigger: &str,
) -> anyhow::Result<()> {
    let app = compose(settings, clock, HistoryMode::Awaited);
    app.cache.ensure_dir().await?;
    app.ledger.init().await?;

    let id = ConfigId::new(id)?;
    let trigger = Trigger::from_str(trigger).unwrap_or(Trigger::Unknown);
    ipc::run_child(app.pipeline.as_ref(), &id, trigger).await
}
