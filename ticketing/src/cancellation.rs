//! Automatic release of unpaid reservations.

use crate::service::ReservationService;
use async_trait::async_trait;
use seatlock_delay::{DelayError, DelayHandler, DelayMessage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Topic of reservation expiry messages.
pub const EXPIRY_TOPIC: &str = "reservation-timeout";

/// Payload of an expiry message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationTimeout {
    /// Reservation whose payment window closed
    pub reservation_id: String,
}

/// Releases a reservation once its payment window has passed.
///
/// Paid and already released reservations are left alone, so redelivered
/// messages are harmless. When the show is locked the expiry is offered
/// again after [`TicketingConfig::expiry_retry`](crate::TicketingConfig).
#[derive(Debug, Clone)]
pub struct ExpiryHandler {
    service: Arc<ReservationService>,
}

impl ExpiryHandler {
    /// Handler releasing through `service`.
    #[must_use]
    pub const fn new(service: Arc<ReservationService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl DelayHandler for ExpiryHandler {
    fn topic(&self) -> &str {
        EXPIRY_TOPIC
    }

    async fn execute(&self, message: DelayMessage) -> seatlock_delay::Result<()> {
        let timeout: ReservationTimeout = message.json()?;
        let reservation = timeout.reservation_id.as_str();

        match self.service.expire(reservation).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::debug!(reservation = %reservation, attempt = message.attempt, "Reservation already settled");
                Ok(())
            }
            Err(error) if error.is_retry_later() => {
                let delay = self.service.config().expiry_retry;
                tracing::warn!(
                    reservation = %reservation,
                    error = %error,
                    retry_in_ms = delay.as_millis(),
                    "Expiry postponed"
                );
                self.service
                    .schedule_expiry(reservation, delay)
                    .await
                    .map_err(|error| DelayError::handler(EXPIRY_TOPIC, error))?;
                Ok(())
            }
            Err(error) => Err(DelayError::handler(EXPIRY_TOPIC, error)),
        }
    }
}
