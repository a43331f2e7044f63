//! Balancer error types.

use fanout_core::NodeId;
use thiserror::Error;

/// Errors returned by registry operations.
///
/// Most operations on unknown nodes are warning no-ops, and "no capacity"
/// is `None` from selection, so this enum stays small.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// A node with this id is already registered.
    #[error("node already registered: {0}")]
    NodeExists(NodeId),
}

/// Result type for balancer operations.
pub type Result<T> = std::result::Result<T, BalancerError>;
