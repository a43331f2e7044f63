//! Service and top-level error types.

use fanout_balancer::BalancerError;
use fanout_core::TransportError;
use fanout_pool::PoolError;
use fanout_settings::SettingsError;
use thiserror::Error;

/// Errors returned by [`ConnectionService`](crate::service::ConnectionService).
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The operation needs a single instance's view of rooms or presence.
    #[error("{operation} is not supported in pooled mode")]
    UnsupportedInPooledMode {
        /// Name of the rejected operation.
        operation: &'static str,
    },

    /// The operation manages pool membership but pooling is disabled.
    #[error("{operation} requires pooled mode")]
    PoolDisabled {
        /// Name of the rejected operation.
        operation: &'static str,
    },

    /// The underlying instance rejected the operation.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Every error the fanout server can surface, one variant per domain.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// Configuration could not be loaded or validated.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// Balancer configuration error.
    #[error(transparent)]
    Balancer(#[from] BalancerError),

    /// Pool membership error.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Service-level rejection.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Listener bind or accept failure.
    #[error("server i/o error: {0}")]
    Io(#[from] std::io::Error),
}
