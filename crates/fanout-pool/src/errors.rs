//! Pool error types.

use fanout_balancer::BalancerError;
use thiserror::Error;

/// Errors returned when attaching instances.
///
/// Fan-out failures are not errors: they are logged per instance and
/// counted in a [`BroadcastReport`](crate::BroadcastReport).
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool already holds its maximum number of instances.
    #[error("pool limit exceeded: {max} instances")]
    PoolLimitExceeded {
        /// Configured maximum.
        max: usize,
    },

    /// Registering the instance's node failed.
    #[error(transparent)]
    Balancer(#[from] BalancerError),
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
