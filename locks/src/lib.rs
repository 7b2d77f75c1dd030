//! # Seatlock Locks
//!
//! Layered locking for contended inventory:
//!
//! - [`manager`]: cluster locks of four kinds (reentrant, fair, read,
//!   write) kept in the shared store
//! - [`naming`] and [`expression`]: canonical lock identifiers from
//!   business names, explicit keys or key expressions over call arguments
//! - [`service`]: run work under a cluster lock with a timeout policy
//! - [`local`]: process-local mutexes with ordered multi-key acquisition
//! - [`repeat`]: refuse repeated submissions within a window
//!
//! ## Typical order
//!
//! ```text
//! local lock(s) (sorted) ──► cluster lock ──► work ──► release (reverse)
//! ```

pub mod error;
pub mod expression;
pub mod kinds;
pub mod local;
pub mod locker;
pub mod manager;
pub mod naming;
pub mod repeat;
pub mod service;

pub use error::{LockError, Result};
pub use expression::{CallArgs, KeyExpression};
pub use kinds::LockKind;
pub use local::{LocalLockCache, LocalMutex, MultiLockGuard};
pub use locker::{HolderId, Locker};
pub use manager::LockManager;
pub use naming::{LockIdentifier, LockInfoResolver, PrefixResolver, ResolverRegistry, REPEAT_LIMIT, SERVICE_LOCK};
pub use repeat::{RepeatGuard, Submission};
pub use service::{LockOptions, ServiceLock, TimeoutPolicy};
