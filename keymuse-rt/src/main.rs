//! KeyMuse realtime pipeline service (keymuse-rt) - Main entry point
//!
//! Wires the session store, connection pool, analysis worker pool and
//! background tasks together, then serves the WebSocket gateway until a
//! shutdown signal arrives.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keymuse_common::config::Config;
use keymuse_rt::analysis::{EmotionMapper, PatternExtractor};
use keymuse_rt::api::{self, AppContext};
use keymuse_rt::collab::{LoggingSink, LoggingTrigger, TokenIsSessionValidator};
use keymuse_rt::qos::{self, ConnectionPool};
use keymuse_rt::scheduler::{self, AnalysisContext, AnalysisPool};
use keymuse_rt::session::SessionStore;

/// Command-line arguments for keymuse-rt
#[derive(Parser, Debug)]
#[command(name = "keymuse-rt")]
#[command(about = "Realtime typing-to-emotion pipeline for KeyMuse")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "5870", env = "KEYMUSE_PORT")]
    port: u16,

    /// Path to a TOML config file (falls back to KEYMUSE_CONFIG, then
    /// ./keymuse.toml, then compiled defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keymuse_rt=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Arc::new(Config::resolve(args.config.as_deref()));

    info!("Starting KeyMuse realtime pipeline on port {}", args.port);

    let store = Arc::new(SessionStore::new(
        config.qos.buffer_capacity,
        config.qos.max_sessions,
    ));
    let connections = Arc::new(ConnectionPool::new(
        config.qos.rate_limit_per_sec,
        config.qos.max_latency_ms,
    ));

    let analysis_ctx = Arc::new(AnalysisContext {
        store: Arc::clone(&store),
        connections: Arc::clone(&connections),
        extractor: PatternExtractor::new(config.analysis.clone()),
        mapper: EmotionMapper::new(config.analysis.clone()),
        sink: Arc::new(LoggingSink),
        trigger: Arc::new(LoggingTrigger),
    });
    let analysis_pool = AnalysisPool::new(config.qos.worker_threads, Arc::clone(&analysis_ctx));

    // Background tasks share one shutdown signal and are joined at teardown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = scheduler::spawn_scheduler(
        Arc::clone(&analysis_ctx),
        analysis_pool,
        &config.qos,
        shutdown_rx.clone(),
    );
    let gc_task = scheduler::spawn_gc(Arc::clone(&store), &config.qos, shutdown_rx.clone());
    let reaper_task = qos::spawn_reaper(
        Arc::clone(&connections),
        Duration::from_secs(config.qos.reap_interval_secs),
        Duration::from_secs(config.qos.idle_timeout_secs),
        shutdown_rx,
    );

    let app = api::create_router(AppContext {
        store,
        connections,
        extractor: Arc::new(PatternExtractor::new(config.analysis.clone())),
        validator: Arc::new(TokenIsSessionValidator),
        config: Arc::clone(&config),
        started_at: Instant::now(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Draining background tasks");
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(scheduler_task, gc_task, reaper_task);

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        }
    }
}
