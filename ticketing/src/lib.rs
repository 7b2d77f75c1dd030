//! # Seatlock Ticketing
//!
//! Reference flash-sale booking flow on top of the coordination layer.
//!
//! ```text
//! reserve ─► rate gate ─► challenge gate ─► repeat guard
//!         ─► local locks (show, client) ─► cluster lock (show)
//!         ─► take seats ─► offer expiry ──(payment window)──► release if unpaid
//! ```
//!
//! The binary (`seatlock`) runs a small flash sale against Redis, or an
//! in-memory store when `SEATLOCK_REDIS_URL=memory`.

pub mod app;
pub mod cancellation;
pub mod config;
pub mod error;
pub mod inventory;
pub mod service;

pub use app::{Platform, PlatformBuilder, Running};
pub use cancellation::{ExpiryHandler, ReservationTimeout, EXPIRY_TOPIC};
pub use config::TicketingConfig;
pub use error::{BookingError, Result};
pub use inventory::{Inventory, Reservation, ReservationStatus, StoreInventory};
pub use service::{ReservationService, ReserveRequest, PAY, RESERVE};
