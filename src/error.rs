// =============================================================================
// Core Error Taxonomy
// =============================================================================
//
// Every subsystem that can fail classifies its failure into one of these five
// buckets so that callers can react uniformly: retry, halt, veto, trip the
// kill switch, or degrade gracefully.
// =============================================================================

use thiserror::Error;

/// A classified engine error.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Worth retrying — network blips, rate limits, 5xx responses.
    #[error("transient error: {0}")]
    Transient(String),

    /// Not worth retrying — bad credentials, malformed request, programmer
    /// error. Propagates to the caller unchanged.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// A domain rule vetoed the action (gatekeeper gate, inventory guard).
    /// Never logged as an error — this is an expected outcome.
    #[error("blocked by {gate}: {reason}")]
    DomainBlocked { gate: String, reason: String },

    /// An invariant that must always hold was violated. Trips the kill
    /// switch.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A dependency is unavailable and the engine is operating in a reduced
    /// capacity (e.g. exchange adapter down, falling back to cached data).
    #[error("degraded: {0}")]
    Degraded(String),
}

impl CoreError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn blocked(gate: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DomainBlocked {
            gate: gate.into(),
            reason: reason.into(),
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn degraded(msg: impl Into<String>) -> Self {
        Self::Degraded(msg.into())
    }

    /// Whether this error class is safe to retry through [`crate::retry::RetryExecutor`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(CoreError::transient("timeout").is_retryable());
        assert!(!CoreError::fatal("bad request").is_retryable());
        assert!(!CoreError::blocked("daily_loss", "limit hit").is_retryable());
        assert!(!CoreError::invariant("negative inventory").is_retryable());
        assert!(!CoreError::degraded("adapter unavailable").is_retryable());
    }

    #[test]
    fn display_messages_are_readable() {
        let e = CoreError::blocked("cooldown_by_symbol", "BTCUSDT BUY on cooldown");
        assert_eq!(
            e.to_string(),
            "blocked by cooldown_by_symbol: BTCUSDT BUY on cooldown"
        );
    }
}
