//! Process entry point: loads configuration, connects the Durable Log
//! and Arbiter, recovers any auctions left LIVE by an unplanned
//! restart, then serves the HTTP control plane and realtime channel.

use std::sync::Arc;

use auctionhouse::arbiter::{ArbiterClient, InMemoryArbiter, RedisArbiter};
use auctionhouse::http::{self, AppState};
use auctionhouse::identity::{SharedIdentityVerifier, SharedSecretIdentityVerifier};
use auctionhouse::storage::{PostgresLog, SharedLog};
use auctionhouse::{Config, Coordinator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.rust_log.clone()))
        .init();

    tracing::info!(bind_addr = %config.bind_addr, "starting auctionhouse");

    let log = PostgresLog::connect(&config.database_url).await?;
    log.migrate().await?;
    let log: SharedLog = Arc::new(log);

    let arbiter: Arc<dyn ArbiterClient> = match &config.arbiter_url {
        Some(url) => {
            tracing::info!("connecting to redis arbiter");
            Arc::new(RedisArbiter::connect(url).await?)
        }
        None => {
            tracing::warn!("no arbiter_url configured; using in-memory arbiter (single process only)");
            Arc::new(InMemoryArbiter::new())
        }
    };

    let coordinator = Coordinator::new(log.clone(), arbiter);
    coordinator.recover().await?;

    let identity: SharedIdentityVerifier =
        Arc::new(SharedSecretIdentityVerifier::new(config.identity_secret.clone()));

    let state = AppState {
        coordinator,
        identity,
        log,
    };
    let app = http::router(state, &config.cors_origins);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(bind_addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
