//! The booking flow.
//!
//! A reservation passes, in order:
//!
//! 1. the rate gate for `reserve` and the payment challenge gate
//! 2. the repeat guard on (client, show)
//! 3. process-local locks on the show and the client
//! 4. the cluster lock on the show's inventory
//! 5. the seat check and decrement, then an expiry message on the delay
//!    dispatcher that returns the seats if payment does not arrive in time
//!
//! Gate errors refuse the request: admission fails closed.

use crate::cancellation::{ReservationTimeout, EXPIRY_TOPIC};
use crate::config::TicketingConfig;
use crate::error::{BookingError, Result};
use crate::inventory::{Inventory, Reservation, ReservationStatus};
use seatlock_admission::{ChallengeGate, Gate, RateGate};
use seatlock_core::environment::Clock;
use seatlock_core::store::{duration_ms, SharedStore};
use seatlock_core::SeatlockConfig;
use seatlock_delay::{DelayProducer, DelayReceipt};
use seatlock_locks::{
    CallArgs, LocalLockCache, LockError, LockManager, LockOptions, RepeatGuard, ResolverRegistry, ServiceLock,
    Submission, TimeoutPolicy,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Rate gate endpoint and repeat-guard name for reservations.
pub const RESERVE: &str = "reserve";

/// Rate gate endpoint and challenge action for payments.
pub const PAY: &str = "pay";

const INVENTORY_LOCK: &str = "inventory";

/// A request for seats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveRequest {
    /// Client asking
    pub client: String,
    /// Show wanted
    pub show: String,
    /// Seats wanted
    pub seats: u32,
}

impl ReserveRequest {
    /// Build a request.
    pub fn new(client: impl Into<String>, show: impl Into<String>, seats: u32) -> Self {
        Self {
            client: client.into(),
            show: show.into(),
            seats,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.client.is_empty() || self.show.is_empty() {
            return Err(BookingError::InvalidRequest("client and show are required".to_string()));
        }
        if self.seats == 0 {
            return Err(BookingError::InvalidRequest("at least one seat must be requested".to_string()));
        }
        Ok(())
    }
}

/// Reservations, payments and expiries for flash sales.
pub struct ReservationService {
    inventory: Arc<dyn Inventory>,
    rate: RateGate,
    challenge: ChallengeGate,
    repeat: RepeatGuard,
    local: Arc<LocalLockCache>,
    locks: ServiceLock,
    reserve_lock: LockOptions<ReserveRequest, Reservation, BookingError>,
    expiry: DelayProducer,
    config: TicketingConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ReservationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationService")
            .field("rate", &self.rate)
            .field("challenge", &self.challenge)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReservationService {
    /// Wire the flow over `store`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error from the gates, the lock resolvers or
    /// the expiry producer.
    pub fn new(
        store: Arc<dyn SharedStore>,
        config: &SeatlockConfig,
        ticketing: TicketingConfig,
        inventory: Arc<dyn Inventory>,
        local: Arc<LocalLockCache>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let prefix = config.store.key_prefix.as_str();
        let resolvers = Arc::new(ResolverRegistry::with_builtins(prefix));
        let manager = Arc::new(LockManager::with_clock(
            Arc::clone(&store),
            config.locks.clone(),
            Arc::clone(&clock),
        ));

        let rate = RateGate::from_config(Arc::clone(&store), prefix, &config.admission)?.with_clock(Arc::clone(&clock));
        let challenge = ChallengeGate::from_config(Arc::clone(&store), prefix, &config.admission)?;
        let repeat = RepeatGuard::new(Arc::clone(&store), &resolvers)?;
        let expiry = DelayProducer::new(store, prefix, EXPIRY_TOPIC, config.delay.partitions)?
            .with_clock(Arc::clone(&clock));

        // A held show lock means another request is taking seats right now;
        // the client is told to come back rather than queued.
        let reserve_lock = LockOptions::new(INVENTORY_LOCK)
            .keys(["#request.show"])
            .on_timeout(TimeoutPolicy::fallback(|request: ReserveRequest| async move {
                Err(BookingError::Busy { show: request.show })
            }));

        Ok(Self {
            inventory,
            rate,
            challenge,
            repeat,
            local,
            locks: ServiceLock::new(manager, resolvers),
            reserve_lock,
            expiry,
            config: ticketing,
            clock,
        })
    }

    /// Booking configuration.
    #[must_use]
    pub const fn config(&self) -> &TicketingConfig {
        &self.config
    }

    /// Set the seats on sale for `show`.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn stock(&self, show: &str, seats: u32) -> Result<()> {
        self.inventory.stock(show, seats).await
    }

    /// Seats left for `show`.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn available(&self, show: &str) -> Result<u32> {
        self.inventory.available(show).await
    }

    /// Look up a reservation.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn reservation(&self, id: &str) -> Result<Option<Reservation>> {
        self.inventory.load(id).await
    }

    /// Reserve seats and start the payment window.
    ///
    /// # Errors
    ///
    /// Returns the gate refusals, [`BookingError::DuplicateSubmission`],
    /// [`BookingError::Busy`] when the show stays locked,
    /// [`BookingError::SoldOut`], or an infrastructure error. Refusals
    /// that may pass later answer `true` to
    /// [`BookingError::is_retry_later`].
    pub async fn reserve(&self, request: ReserveRequest) -> Result<Reservation> {
        request.validate()?;
        self.admit(&request.client, RESERVE).await?;

        let submission = self
            .repeat
            .submit(RESERVE, &[request.client.clone(), request.show.clone()], self.config.repeat_window)
            .await?;
        let Submission::Accepted(marker) = submission else {
            return Err(BookingError::DuplicateSubmission);
        };

        let outcome = self.reserve_locally(request).await;
        if outcome.is_err() {
            // A failed attempt may be retried at once.
            if let Err(error) = self.repeat.clear(&marker).await {
                tracing::warn!(marker = %marker, error = %error, "Failed to clear repeat marker");
            }
        }
        outcome
    }

    /// Settle payment for a reservation. A declined payment counts toward
    /// the client's challenge threshold; a successful one clears it.
    ///
    /// # Errors
    ///
    /// Returns the gate refusals, [`BookingError::NotFound`] for unknown
    /// or foreign reservations, [`BookingError::PaymentDeclined`],
    /// [`BookingError::Expired`], or an infrastructure error.
    pub async fn pay(&self, client: &str, reservation_id: &str, approved: bool) -> Result<Reservation> {
        self.admit(client, PAY).await?;

        let reservation = self
            .inventory
            .load(reservation_id)
            .await?
            .filter(|reservation| reservation.client == client)
            .ok_or_else(|| BookingError::NotFound(reservation_id.to_string()))?;

        if !approved {
            let decision = self.challenge.record_failure(client, PAY).await?;
            tracing::info!(
                client = %client,
                reservation = %reservation_id,
                failures = decision.failures,
                "Payment declined"
            );
            return Err(BookingError::PaymentDeclined {
                failures: decision.failures,
            });
        }

        let options = LockOptions::new(INVENTORY_LOCK).keys(["#show"]);
        let call = CallArgs::new().with("show", reservation.show.as_str());
        let paid = self
            .locks
            .execute(&options, &call, reservation_id.to_string(), |id| self.confirm(id))
            .await?;

        if let Err(error) = self.challenge.clear(client, PAY).await {
            tracing::warn!(client = %client, error = %error, "Failed to clear payment failures");
        }
        tracing::info!(client = %client, reservation = %paid.id, show = %paid.show, "Reservation paid");
        Ok(paid)
    }

    /// Release an unpaid reservation and return its seats. Returns `false`
    /// if the reservation is gone or already paid.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Lock`] when the show stays locked, or an
    /// infrastructure error.
    pub async fn expire(&self, reservation_id: &str) -> Result<bool> {
        let Some(reservation) = self.inventory.load(reservation_id).await? else {
            return Ok(false);
        };
        if reservation.status == ReservationStatus::Paid {
            return Ok(false);
        }

        let options = LockOptions::new(INVENTORY_LOCK).keys(["#show"]);
        let call = CallArgs::new().with("show", reservation.show.as_str());
        self.locks
            .execute(&options, &call, reservation_id.to_string(), |id| self.release_unpaid(id))
            .await
    }

    /// Offer an expiry message for `reservation_id`, due after `delay`.
    ///
    /// # Errors
    ///
    /// Returns a delay dispatcher error.
    pub async fn schedule_expiry(&self, reservation_id: &str, delay: Duration) -> Result<DelayReceipt> {
        let timeout = ReservationTimeout {
            reservation_id: reservation_id.to_string(),
        };
        Ok(self.expiry.offer_json(&timeout, delay).await?)
    }

    async fn admit(&self, client: &str, endpoint: &str) -> Result<()> {
        let rate = self.rate.evaluate(client, endpoint).await.inspect_err(|error| {
            tracing::warn!(client = %client, endpoint = %endpoint, error = %error, "Rate gate unavailable, refusing");
        })?;
        if !rate.within_limit {
            return Err(BookingError::RateLimited {
                count: rate.current_count,
            });
        }

        let challenge = self.challenge.evaluate(client, PAY).await.inspect_err(|error| {
            tracing::warn!(client = %client, error = %error, "Challenge gate unavailable, refusing");
        })?;
        if challenge.require_challenge {
            return Err(BookingError::ChallengeRequired {
                failures: challenge.failures,
            });
        }
        Ok(())
    }

    async fn reserve_locally(&self, request: ReserveRequest) -> Result<Reservation> {
        let keys = [format!("show:{}", request.show), format!("client:{}", request.client)];
        let show = request.show.clone();
        match self
            .local
            .run_locked(keys, false, self.config.local_wait, || self.reserve_in_cluster(request))
            .await
        {
            Ok(outcome) => outcome,
            Err(LockError::Timeout { .. }) => Err(BookingError::Busy { show }),
            Err(error) => Err(error.into()),
        }
    }

    async fn reserve_in_cluster(&self, request: ReserveRequest) -> Result<Reservation> {
        let call = CallArgs::new().with_serialized("request", &request)?;
        self.locks
            .execute(&self.reserve_lock, &call, request, |request| self.commit(request))
            .await
    }

    /// Runs under the show's cluster lock.
    async fn commit(&self, request: ReserveRequest) -> Result<Reservation> {
        if !self.inventory.take(&request.show, request.seats).await? {
            let available = self.inventory.available(&request.show).await?;
            return Err(BookingError::SoldOut {
                show: request.show,
                requested: request.seats,
                available,
            });
        }

        let created_at = self.clock.now();
        let reservation = Reservation {
            id: uuid::Uuid::new_v4().to_string(),
            show: request.show,
            client: request.client,
            seats: request.seats,
            status: ReservationStatus::Pending,
            created_at,
            expires_at: created_at + chrono::Duration::milliseconds(duration_ms(self.config.payment_window)),
        };

        if let Err(error) = self.inventory.save(&reservation).await {
            self.roll_back(&reservation, false).await;
            return Err(error);
        }
        match self.schedule_expiry(&reservation.id, self.config.payment_window).await {
            Ok(receipt) => {
                tracing::info!(
                    client = %reservation.client,
                    show = %reservation.show,
                    seats = reservation.seats,
                    reservation = %reservation.id,
                    partition = receipt.partition,
                    "Seats reserved"
                );
                Ok(reservation)
            }
            Err(error) => {
                // Without an expiry message nothing would ever return the seats.
                self.roll_back(&reservation, true).await;
                Err(error)
            }
        }
    }

    async fn roll_back(&self, reservation: &Reservation, saved: bool) {
        if saved {
            if let Err(error) = self.inventory.remove(&reservation.id).await {
                tracing::error!(reservation = %reservation.id, error = %error, "Rollback failed to remove reservation");
            }
        }
        if let Err(error) = self.inventory.give_back(&reservation.show, reservation.seats).await {
            tracing::error!(
                reservation = %reservation.id,
                show = %reservation.show,
                seats = reservation.seats,
                error = %error,
                "Rollback failed to return seats"
            );
        }
    }

    /// Runs under the show's cluster lock.
    async fn confirm(&self, reservation_id: String) -> Result<Reservation> {
        let mut reservation = self
            .inventory
            .load(&reservation_id)
            .await?
            .ok_or_else(|| BookingError::NotFound(reservation_id.clone()))?;

        match reservation.status {
            ReservationStatus::Paid => Ok(reservation),
            ReservationStatus::Pending if reservation.is_expired_at(self.clock.now()) => {
                Err(BookingError::Expired { reservation: reservation_id })
            }
            ReservationStatus::Pending => {
                reservation.status = ReservationStatus::Paid;
                self.inventory.save(&reservation).await?;
                Ok(reservation)
            }
        }
    }

    /// Runs under the show's cluster lock.
    async fn release_unpaid(&self, reservation_id: String) -> Result<bool> {
        let Some(reservation) = self.inventory.load(&reservation_id).await? else {
            return Ok(false);
        };
        if reservation.status == ReservationStatus::Paid {
            return Ok(false);
        }

        self.inventory.remove(&reservation.id).await?;
        self.inventory.give_back(&reservation.show, reservation.seats).await?;
        tracing::info!(
            reservation = %reservation.id,
            show = %reservation.show,
            seats = reservation.seats,
            "Unpaid reservation released"
        );
        Ok(true)
    }
}
