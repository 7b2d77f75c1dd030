//! Application assembly.
//!
//! [`PlatformBuilder`] wires the booking service, the expiry handler and
//! the delay dispatcher over one shared store; [`Platform::start`] spawns
//! the background tasks and [`Running::shutdown`] stops them.

use crate::cancellation::ExpiryHandler;
use crate::config::TicketingConfig;
use crate::error::Result;
use crate::inventory::{Inventory, StoreInventory};
use crate::service::ReservationService;
use seatlock_core::environment::{Clock, SystemClock};
use seatlock_core::store::SharedStore;
use seatlock_core::SeatlockConfig;
use seatlock_delay::{DelayDispatcher, DispatcherHandle, TopicRegistry};
use seatlock_locks::LocalLockCache;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Builder for a [`Platform`].
pub struct PlatformBuilder {
    config: SeatlockConfig,
    ticketing: TicketingConfig,
    store: Arc<dyn SharedStore>,
    inventory: Option<Arc<dyn Inventory>>,
    clock: Arc<dyn Clock>,
}

impl PlatformBuilder {
    /// Start from the coordination configuration and a store.
    #[must_use]
    pub fn new(config: SeatlockConfig, store: Arc<dyn SharedStore>) -> Self {
        Self {
            config,
            ticketing: TicketingConfig::default(),
            store,
            inventory: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Booking settings.
    #[must_use]
    pub fn ticketing(mut self, ticketing: TicketingConfig) -> Self {
        self.ticketing = ticketing;
        self
    }

    /// Replace the store-backed inventory.
    #[must_use]
    pub fn inventory(mut self, inventory: Arc<dyn Inventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Clock for windows, leases and due times.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and wire everything.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Config`](crate::BookingError::Config) for
    /// invalid settings, or the component's own configuration error.
    pub fn build(self) -> Result<Platform> {
        self.config.validate()?;
        let prefix = self.config.store.key_prefix.clone();

        let inventory = self
            .inventory
            .unwrap_or_else(|| Arc::new(StoreInventory::new(Arc::clone(&self.store), prefix.clone())));
        let local = Arc::new(LocalLockCache::new(&self.config.local));
        let service = Arc::new(ReservationService::new(
            Arc::clone(&self.store),
            &self.config,
            self.ticketing,
            inventory,
            Arc::clone(&local),
            Arc::clone(&self.clock),
        )?);

        let registry = TopicRegistry::new().register(Arc::new(ExpiryHandler::new(Arc::clone(&service))))?;
        let dispatcher = DelayDispatcher::new(self.store, prefix, Arc::new(registry), self.config.delay.clone())
            .with_clock(self.clock);

        Ok(Platform {
            config: self.config,
            service,
            dispatcher,
            local,
        })
    }
}

/// An assembled booking platform.
#[derive(Debug)]
pub struct Platform {
    config: SeatlockConfig,
    service: Arc<ReservationService>,
    dispatcher: DelayDispatcher,
    local: Arc<LocalLockCache>,
}

impl Platform {
    /// The booking service.
    #[must_use]
    pub const fn service(&self) -> &Arc<ReservationService> {
        &self.service
    }

    /// The delay dispatcher delivering expiries.
    #[must_use]
    pub const fn dispatcher(&self) -> &DelayDispatcher {
        &self.dispatcher
    }

    /// Start the expiry listeners and the local lock sweeper. Both stop
    /// when `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns a delay dispatcher error, typically a partition mismatch.
    pub async fn start(&self, shutdown: &broadcast::Sender<()>) -> Result<Running> {
        let dispatcher = self.dispatcher.start(shutdown).await?;
        let sweeper = self
            .local
            .spawn_sweeper(self.config.local.sweep_interval, shutdown.subscribe());
        tracing::info!(listeners = dispatcher.listeners(), "Platform started");
        Ok(Running { dispatcher, sweeper })
    }
}

/// Background tasks of a started [`Platform`].
#[derive(Debug)]
pub struct Running {
    dispatcher: DispatcherHandle,
    sweeper: JoinHandle<()>,
}

impl Running {
    /// Signal shutdown and wait for the background tasks to finish.
    pub async fn shutdown(self) {
        self.dispatcher.shutdown().await;
        if let Err(error) = self.sweeper.await {
            tracing::error!(error = %error, "Local lock sweeper ended abnormally");
        }
        tracing::info!("Platform stopped");
    }
}
