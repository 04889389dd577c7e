use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;

mod handlers;
mod jobs;
mod middleware;
mod routes;
mod state;

use common::broadcast::{BroadcastBus, ConnectionRegistry, PubSubTransport, RedisTransport};
use common::config::Settings;
use common::db::{DbPool, TaskRepository, TaskStore};
use common::scheduler::{SchedulerConfig, SchedulerCore};
use common::telemetry;
use state::AppState;

/// Connect the store and start the scheduler for this process
#[tracing::instrument(skip(settings, bus))]
async fn start_scheduler(
    settings: &Settings,
    bus: Arc<BroadcastBus>,
) -> Result<(Arc<SchedulerCore>, DbPool)> {
    let db_pool = DbPool::new(&settings.database).await?;
    tracing::info!("Database connection pool established");

    if settings.database.run_migrations {
        db_pool.run_migrations().await?;
        tracing::info!("Database migrations applied");
    }

    let store: Arc<dyn TaskStore> = Arc::new(TaskRepository::new(db_pool.clone()));
    let registry = Arc::new(jobs::build_registry(bus));
    let config = SchedulerConfig::from_settings(&settings.scheduler)?;

    let scheduler = Arc::new(SchedulerCore::new(config, registry, store));
    scheduler.start().await?;
    Ok((scheduler, db_pool))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(&settings.observability)?;
    tracing::info!(
        host = %settings.server.host,
        port = %settings.server.port,
        scheduler_enabled = settings.scheduler.enabled,
        "Starting Chronocast API server"
    );

    let metrics_handle = if settings.observability.metrics_enabled {
        Some(telemetry::init_metrics()?)
    } else {
        None
    };

    // Notification bus: every process runs the subscriber loop
    let connections = Arc::new(ConnectionRegistry::new());
    let transport: Option<Arc<dyn PubSubTransport>> = if settings.redis.url.is_empty() {
        tracing::warn!("Redis URL not configured, notification bus is local-only");
        None
    } else {
        let transport = RedisTransport::new(&settings.redis)?;
        if let Err(e) = transport.health_check().await {
            tracing::warn!(error = %e, "Redis not reachable at startup, publishing falls back to local delivery");
        }
        let transport: Arc<dyn PubSubTransport> = Arc::new(transport);
        Some(transport)
    };
    let bus = Arc::new(BroadcastBus::new(&settings.broadcast, transport, connections));
    bus.start().await;

    // Scheduler: exactly one process sharing a store should enable it
    let mut state = AppState::new(settings.clone(), bus.clone());
    if settings.scheduler.enabled {
        let (scheduler, db_pool) = start_scheduler(&settings, bus.clone()).await?;
        state = state.with_scheduler(scheduler, Some(db_pool));
    } else {
        tracing::info!("Scheduler disabled in this process");
    }
    if let Some(handle) = metrics_handle {
        state = state.with_metrics(handle);
    }

    let scheduler = state.scheduler.clone();
    let db_pool = state.db_pool.clone();
    let app = routes::create_router(state);

    // Start server
    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));
    tracing::info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Graceful shutdown: scheduler, subscriber loop, pool, tracer
    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }
    bus.stop().await;
    if let Some(pool) = db_pool {
        pool.close().await;
    }
    telemetry::shutdown_tracer();

    tracing::info!("API server stopped");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }

    tracing::info!("Initiating graceful shutdown");
}
