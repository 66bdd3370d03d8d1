//! sspm-worker entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use sspm_config::{LoadedConfig, Settings};
use sspm_sync::{
    is_no_connectors_due, is_no_enabled_connectors, is_sync_already_running, is_sync_queued,
    RunRequest, TriggerRequest,
};
use sspm_worker::{boot::WorkerRuntime, routes, state::AppState};

#[derive(Parser)]
#[command(name = "sspm-worker")]
#[command(about = "SaaS posture sync worker", long_about = None)]
struct Cli {
    /// Layered YAML config paths in merge order.
    #[arg(long = "config")]
    config_paths: Vec<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker: scheduler, trigger listeners and admin surface.
    Serve,

    /// Apply embedded database migrations.
    Migrate,

    /// Enqueue a resync via the trigger bus and print the outcome.
    Resync {
        /// Restrict to one connector kind.
        #[arg(long)]
        kind: Option<String>,

        /// Restrict to one source name (requires --kind).
        #[arg(long)]
        name: Option<String>,

        /// Target the discovery pass instead of both modes.
        #[arg(long)]
        discovery: bool,
    },

    /// Connectivity check plus recent sync runs.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();

    let loaded = if cli.config_paths.is_empty() {
        LoadedConfig::empty()
    } else {
        let path_refs: Vec<&str> = cli.config_paths.iter().map(|s| s.as_str()).collect();
        sspm_config::load_layered_yaml(&path_refs)?
    };
    let settings = Settings::resolve(&loaded.config_json)?;

    init_tracing(&settings);
    info!(config_hash = %loaded.config_hash, "configuration loaded");

    match cli.cmd {
        Commands::Serve => serve(settings).await,
        Commands::Migrate => {
            let pool = sspm_store::connect_from_env().await?;
            sspm_store::migrate(&pool).await?;
            println!("migrations_applied=true");
            Ok(())
        }
        Commands::Resync {
            kind,
            name,
            discovery,
        } => resync(settings, kind, name, discovery).await,
        Commands::Status => status().await,
    }
}

async fn serve(settings: Settings) -> Result<()> {
    let pool = sspm_store::connect_from_env().await?;
    sspm_store::migrate(&pool).await?;

    let addr: SocketAddr = settings
        .worker_addr
        .parse()
        .with_context(|| format!("invalid worker addr {}", settings.worker_addr))?;

    let runtime = WorkerRuntime::build(settings, pool)?;
    let cancel = CancellationToken::new();
    runtime.spawn_sync_loop(cancel.clone());

    let shared = Arc::new(AppState::new(
        runtime.store.clone(),
        runtime.trigger_composite.clone(),
        runtime.trigger_discovery.clone(),
    ));

    let app = routes::build_router(shared)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    info!("sspm-worker listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
        .context("server crashed")?;

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
    cancel.cancel();
}

async fn resync(
    settings: Settings,
    kind: Option<String>,
    name: Option<String>,
    discovery: bool,
) -> Result<()> {
    let pool = sspm_store::connect_from_env().await?;
    let runtime = WorkerRuntime::build(settings, pool)?;

    let scope = TriggerRequest::normalized(
        kind.as_deref().unwrap_or(""),
        name.as_deref().unwrap_or(""),
    );
    let req = RunRequest::forced(scope, CancellationToken::new());
    let runner = if discovery {
        &runtime.trigger_discovery
    } else {
        &runtime.trigger_composite
    };

    match runner.run_once(&req).await {
        Ok(()) => println!("outcome=ok"),
        Err(err) if is_sync_queued(&err) => println!("outcome=queued"),
        Err(err) if is_sync_already_running(&err) => println!("outcome=busy"),
        Err(err) if is_no_enabled_connectors(&err) || is_no_connectors_due(&err) => {
            println!("outcome=no-op")
        }
        Err(err) => return Err(err),
    }
    Ok(())
}

async fn status() -> Result<()> {
    let pool = sspm_store::connect_from_env().await?;
    let store = sspm_store::PgStore::new(pool);
    let runs = sspm_store::Store::list_recent_sync_runs(&store, 20).await?;

    println!("db_ok=true recent_runs={}", runs.len());
    for run in runs {
        println!(
            "run_id={} source={}/{} status={} finished_at={}",
            run.id,
            run.source_kind,
            run.source_name,
            run.status.as_str(),
            run.finished_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

fn init_tracing(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level));

    if settings.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
