//! Courier webhook delivery service.
//!
//! Main entry point. Loads configuration, prepares the database, runs the
//! delivery engine and coordinates graceful shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{storage::schema, RealClock};
use courier_delivery::DeliveryEngine;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log)?;

    info!("Starting Courier webhook delivery service");
    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        workers = config.worker_pool_size,
        create_limit_per_hour = config.to_registry_config().create_limit,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    schema::migrate(&db_pool).await.context("Failed to bootstrap database schema")?;
    info!("Database schema ready");

    let mut engine = DeliveryEngine::postgres(
        db_pool.clone(),
        config.to_delivery_config()?,
        Arc::new(RealClock::new()),
    )
    .context("Failed to create delivery engine")?;
    engine.start().await.context("Failed to start delivery engine")?;

    match engine.delivery_stats().await {
        Ok(stats) => info!(
            active_subscriptions = stats.active_subscriptions,
            pending_attempts = stats.pending_attempts,
            dead_letters = stats.dead_letters,
            "Courier is delivering webhooks"
        ),
        Err(e) => {
            warn!(error = %e, "Failed to read delivery stats");
            info!("Courier is delivering webhooks");
        },
    }

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "Delivery engine did not stop cleanly");
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("Courier shutdown complete");
    Ok(())
}

/// Initializes tracing, preferring `RUST_LOG` from the environment.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("Invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
