//! # fanout-pool
//!
//! Runs several [`RealtimeInstance`](fanout_core::RealtimeInstance)s behind
//! one [`LoadBalancer`](fanout_balancer::LoadBalancer).
//!
//! - **Instances**: each attached instance is bound 1:1 to a balancer node;
//!   a background task counts its connections from lifecycle events and
//!   pushes the resulting load to the balancer
//! - **Fan-out**: broadcasts to all / a room / a user are issued to every
//!   healthy instance concurrently; one failing instance never aborts the
//!   others
//! - **Monitoring**: a periodic probe corrects connection-count drift and
//!   records latency; a periodic diagnostic reports load skew
//! - **Removal**: connections are told to reconnect, disconnected, and the
//!   instance is shut down before its node leaves the balancer

#![deny(unsafe_code)]

pub mod errors;
pub mod health;
pub mod instance;
pub mod monitor;
pub mod pool;

#[cfg(test)]
pub(crate) mod test_support;

pub use errors::{PoolError, Result};
pub use health::{BroadcastReport, InstanceHealth, LoadDiagnostic, PoolHealth};
pub use instance::{PooledInstance, ServerOptions};
pub use pool::ConnectionPool;
