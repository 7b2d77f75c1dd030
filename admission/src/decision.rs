//! Gate decisions and the common gate contract.

use crate::error::Result;
use async_trait::async_trait;

/// What a gate asks the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Let the request through.
    Allow,
    /// Refuse the request for now.
    Block,
    /// Demand a human-verification challenge first.
    RequireChallenge,
}

impl Verdict {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::RequireChallenge => "challenge",
        }
    }
}

/// Rate gate outcome: the post-increment count of the caller's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Count is at most the threshold
    pub within_limit: bool,
    /// Requests seen in this window, this one included
    pub current_count: u64,
}

impl RateDecision {
    /// [`Verdict::Allow`] within the limit, [`Verdict::Block`] beyond it.
    #[must_use]
    pub const fn verdict(&self) -> Verdict {
        if self.within_limit {
            Verdict::Allow
        } else {
            Verdict::Block
        }
    }
}

/// Challenge gate outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeDecision {
    /// Failures reached the threshold
    pub require_challenge: bool,
    /// Failures remembered for the caller
    pub failures: u64,
}

impl ChallengeDecision {
    /// [`Verdict::RequireChallenge`] once the threshold is reached.
    #[must_use]
    pub const fn verdict(&self) -> Verdict {
        if self.require_challenge {
            Verdict::RequireChallenge
        } else {
            Verdict::Allow
        }
    }
}

/// An atomic check against shared counters for one (client, subject)
/// pair. For the rate gate the subject is an endpoint, for the challenge
/// gate an action.
#[async_trait]
pub trait Gate: Send + Sync {
    /// Decision type.
    type Decision: Send;

    /// Gate name, used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Evaluate the gate as one atomic store operation.
    ///
    /// # Errors
    ///
    /// Returns [`GateError`](crate::GateError) when no decision could be
    /// made.
    async fn evaluate(&self, client: &str, subject: &str) -> Result<Self::Decision>;
}

pub(crate) fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}
