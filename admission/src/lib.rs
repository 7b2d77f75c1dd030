//! # Seatlock Admission
//!
//! Gates evaluated before business logic runs. Each evaluation is one
//! atomic script against shared counters, so check-and-increment never
//! races across service instances.
//!
//! - [`RateGate`]: fixed-window request counting per client and endpoint
//! - [`ChallengeGate`]: demands a human-verification challenge after
//!   repeated failures
//!
//! Both return a decision carrying the counters that produced it, or a
//! [`GateError`] when the store could not be consulted. Whether to admit or
//! refuse on error is left to the caller.

pub mod challenge;
pub mod decision;
pub mod error;
pub mod rate;

pub use challenge::ChallengeGate;
pub use decision::{ChallengeDecision, Gate, RateDecision, Verdict};
pub use error::{GateError, Result};
pub use rate::RateGate;
