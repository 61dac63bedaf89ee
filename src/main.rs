//! Anchorage reconciler daemon.
//!
//! Publishes pending anchors, retries failures, reclaims abandoned leases
//! and confirms posted roots until asked to stop.

use std::{sync::Arc, time::Duration};

use anchorage_core::{
    storage::{schema, Storage},
    AnchorStore, Clock, EventHandler, PostgresAnchorStore, RealClock, TracingEventHandler,
};
use anchorage_ledger::{HttpLedgerClient, LedgerClient, Poster, Reconciler};
use anchorage_service::Config;
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    info!(
        database_url = %config.database_url_masked(),
        ledger_network = %config.ledger_network,
        endpoints = config.ledger_urls().len(),
        "configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    schema::migrate(&pool).await.context("Failed to run database migrations")?;
    info!("database ready");

    let storage = Arc::new(Storage::new(pool.clone()));
    for backlog in storage.anchors.count_by_status().await.context("Failed to count anchors")? {
        info!(status = %backlog.status, count = backlog.count, "anchor backlog");
    }

    let store: Arc<dyn AnchorStore> = Arc::new(PostgresAnchorStore::new(storage));
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let events: Arc<dyn EventHandler> = Arc::new(TracingEventHandler);

    let mut ledgers: Vec<Arc<dyn LedgerClient>> = Vec::new();
    for url in config.ledger_urls() {
        let client = HttpLedgerClient::new(url.clone(), config.to_client_config())
            .with_context(|| format!("Failed to build ledger client for {url}"))?;
        ledgers.push(Arc::new(client));
    }

    let poster = Arc::new(
        Poster::new(store.clone(), ledgers, config.to_poster_config(), clock.clone())
            .context("Failed to build poster")?
            .with_event_handler(events.clone()),
    );
    let reconciler = Reconciler::new(store, poster, clock, config.to_reconciler_config())
        .context("Failed to build reconciler")?
        .with_event_handler(events);

    let token = CancellationToken::new();
    let worker = tokio::spawn({
        let token = token.clone();
        async move { reconciler.run(token).await }
    });

    info!("anchorage reconciler running");
    shutdown_signal().await?;
    info!("shutdown signal received, stopping reconciler");
    token.cancel();

    let grace = config.shutdown_grace();
    match tokio::time::timeout(grace, worker).await {
        Ok(Ok(())) => info!("reconciler stopped"),
        Ok(Err(e)) => warn!(error = %e, "reconciler task ended abnormally"),
        Err(_) => warn!(grace_secs = grace.as_secs(), "shutdown grace period expired"),
    }

    pool.close().await;
    info!("anchorage shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter =
        EnvFilter::try_new(&config.rust_log).context("Invalid log filter in configuration")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Opens the pool, retrying while the database comes up.
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
                Storage::new(pool.clone())
                    .health_check()
                    .await
                    .context("Failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = ctrl_c => {
                result.context("Failed to listen for CTRL+C")?;
                info!("received CTRL+C");
            },
            _ = terminate.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("Failed to listen for CTRL+C")?;
        info!("received CTRL+C");
    }

    Ok(())
}
