//! Seatlock flash-sale demo.
//!
//! Stocks a show, lets a crowd of clients race for its seats, pays for
//! some of the reservations and leaves the rest to expire.
//!
//! # Usage
//!
//! ```bash
//! # Against Redis
//! SEATLOCK_REDIS_URL=redis://127.0.0.1:6379 cargo run --bin seatlock
//!
//! # Without external services
//! SEATLOCK_REDIS_URL=memory SEATLOCK_PAYMENT_WINDOW_SECS=5 cargo run --bin seatlock
//! ```

use anyhow::Context;
use seatlock_core::store::SharedStore;
use seatlock_core::{InMemoryStore, SeatlockConfig, StoreError};
use seatlock_redis::RedisStore;
use seatlock_runtime::metrics::MetricsServer;
use seatlock_runtime::retry::retry_with_predicate;
use seatlock_runtime::{ContextExecutor, RetryPolicy, TaskContext};
use seatlock_ticketing::{BookingError, PlatformBuilder, ReservationService, ReserveRequest, TicketingConfig};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SHOW: &str = "opening-night";
const SEATS: u32 = 10;
const CLIENTS: usize = 40;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,seatlock=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting seatlock...");

    let config = SeatlockConfig::from_env();
    config.validate().context("invalid coordination configuration")?;
    let ticketing = TicketingConfig::from_env();
    info!(
        prefix = %config.store.key_prefix,
        partitions = config.delay.partitions,
        payment_window_secs = ticketing.payment_window.as_secs(),
        "Configuration loaded"
    );

    let _metrics = match ticketing.metrics_addr {
        Some(addr) => {
            let mut server = MetricsServer::new(addr);
            server.start().context("failed to install metrics recorder")?;
            Some(server)
        }
        None => None,
    };

    let store = connect(&config.store.url).await?;
    let platform = PlatformBuilder::new(config, store).ticketing(ticketing).build()?;

    let (shutdown, _) = broadcast::channel(1);
    let running = platform.start(&shutdown).await?;

    run_flash_sale(platform.service()).await?;

    info!("Flash sale finished; unpaid reservations expire in the background. Press Ctrl+C to stop");
    shutdown_signal().await;

    running.shutdown().await;
    info!(available = platform.service().available(SHOW).await?, "Shutdown complete");
    Ok(())
}

async fn connect(url: &str) -> anyhow::Result<Arc<dyn SharedStore>> {
    if url == "memory" {
        warn!("Using the in-memory store; locks and queues are local to this process");
        return Ok(Arc::new(InMemoryStore::new()));
    }

    info!("Connecting to Redis...");
    let store = retry_with_predicate(
        &RetryPolicy::default(),
        || RedisStore::connect(url),
        StoreError::is_transient,
    )
    .await
    .context("failed to connect to Redis")?;
    Ok(Arc::new(store))
}

async fn run_flash_sale(service: &Arc<ReservationService>) -> anyhow::Result<()> {
    service.stock(SHOW, SEATS).await?;
    info!(show = SHOW, seats = SEATS, clients = CLIENTS, "Sale open");

    let executor = ContextExecutor::new("flash-sale-client");
    let handles: Vec<_> = (0..CLIENTS)
        .map(|index| {
            let service = Arc::clone(service);
            let client = format!("client-{index}");
            let ctx = TaskContext::new().with_attribute("client", client.clone());
            executor.spawn(ctx, move |_| async move {
                let outcome = service.reserve(ReserveRequest::new(client.clone(), SHOW, 1)).await;
                (client, outcome)
            })
        })
        .collect();

    let mut reserved = Vec::new();
    let (mut sold_out, mut retry_later, mut failed) = (0_usize, 0_usize, 0_usize);
    for handle in handles {
        match handle.await? {
            (client, Ok(reservation)) => reserved.push((client, reservation)),
            (_, Err(BookingError::SoldOut { .. })) => sold_out += 1,
            (client, Err(error)) if error.is_retry_later() => {
                info!(client = %client, error = %error, "Told to retry later");
                retry_later += 1;
            }
            (client, Err(error)) => {
                error!(client = %client, error = %error, "Reservation failed");
                failed += 1;
            }
        }
    }
    info!(
        reserved = reserved.len(),
        sold_out,
        retry_later,
        failed,
        available = service.available(SHOW).await?,
        "Reservations settled"
    );

    // Every other winner pays; the rest let their window run out.
    for (client, reservation) in reserved.iter().step_by(2) {
        match service.pay(client, &reservation.id, true).await {
            Ok(paid) => info!(client = %client, reservation = %paid.id, "Paid"),
            Err(error) => warn!(client = %client, reservation = %reservation.id, error = %error, "Payment failed"),
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            error!(error = %error, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                error!(error = %error, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
