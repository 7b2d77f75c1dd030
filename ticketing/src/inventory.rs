//! Seat inventory and reservations.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use seatlock_core::store::SharedStore;
use seatlock_core::StoreError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Reservation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Seats held, payment outstanding.
    Pending,
    /// Paid; the seats are sold.
    Paid,
}

/// Seats held for one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation id
    pub id: String,
    /// Show the seats belong to
    pub show: String,
    /// Client holding the seats
    pub client: String,
    /// Number of seats
    pub seats: u32,
    /// Current status
    pub status: ReservationStatus,
    /// When the reservation was made
    pub created_at: DateTime<Utc>,
    /// End of the payment window
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    /// `true` if still unpaid at `now` after its payment window.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Pending && now >= self.expires_at
    }
}

/// Seat counts and reservation records.
///
/// Implementations need not be atomic: the booking flow calls the
/// mutating methods of a show only while holding that show's cluster lock.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Set the seats available for `show`.
    async fn stock(&self, show: &str, seats: u32) -> Result<()>;

    /// Seats currently available.
    async fn available(&self, show: &str) -> Result<u32>;

    /// Take `seats` if that many are available. Returns `false` otherwise.
    async fn take(&self, show: &str, seats: u32) -> Result<bool>;

    /// Return `seats` to the show.
    async fn give_back(&self, show: &str, seats: u32) -> Result<()>;

    /// Insert or replace a reservation.
    async fn save(&self, reservation: &Reservation) -> Result<()>;

    /// Look up a reservation.
    async fn load(&self, id: &str) -> Result<Option<Reservation>>;

    /// Delete a reservation. Returns `true` if it existed.
    async fn remove(&self, id: &str) -> Result<bool>;
}

/// Inventory kept in the shared store, so every instance sees the same
/// seat counts.
#[derive(Debug, Clone)]
pub struct StoreInventory {
    store: Arc<dyn SharedStore>,
    prefix: String,
}

impl StoreInventory {
    /// Inventory under `prefix`.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn seats_key(&self, show: &str) -> String {
        format!("{}:seats:{show}", self.prefix)
    }

    fn reservation_key(&self, id: &str) -> String {
        format!("{}:reservation:{id}", self.prefix)
    }
}

#[async_trait]
impl Inventory for StoreInventory {
    async fn stock(&self, show: &str, seats: u32) -> Result<()> {
        self.store.set(&self.seats_key(show), &seats.to_string(), None).await?;
        tracing::info!(show = %show, seats, "Show stocked");
        Ok(())
    }

    async fn available(&self, show: &str) -> Result<u32> {
        let key = self.seats_key(show);
        match self.store.get(&key).await? {
            Some(raw) => Ok(raw
                .parse()
                .map_err(|_| StoreError::Protocol(format!("seat count `{raw}` under `{key}` is not a number")))?),
            None => Ok(0),
        }
    }

    async fn take(&self, show: &str, seats: u32) -> Result<bool> {
        let available = self.available(show).await?;
        if available < seats {
            return Ok(false);
        }
        let left = available - seats;
        self.store.set(&self.seats_key(show), &left.to_string(), None).await?;
        tracing::debug!(show = %show, taken = seats, left, "Seats taken");
        Ok(true)
    }

    async fn give_back(&self, show: &str, seats: u32) -> Result<()> {
        let now = self.store.increment(&self.seats_key(show), i64::from(seats)).await?;
        tracing::debug!(show = %show, returned = seats, available = now, "Seats returned");
        Ok(())
    }

    async fn save(&self, reservation: &Reservation) -> Result<()> {
        let body = serde_json::to_string(reservation)?;
        self.store.set(&self.reservation_key(&reservation.id), &body, None).await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Reservation>> {
        match self.store.get(&self.reservation_key(id)).await? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.store.delete(&self.reservation_key(id)).await?)
    }
}
