//! # fanout-balancer
//!
//! Chooses which server instance a new connection lands on.
//!
//! - **Registry**: [`Node`] records with live connection count, load factor,
//!   response time and a derived health flag
//! - **Strategies**: round-robin, least-connections, weighted round-robin and
//!   hash-based selection over healthy nodes ([`strategy`])
//! - **Sticky sessions**: advisory `session_id → node` pinning
//! - **Health**: periodic staleness / latency / capacity checks ([`health`])
//! - **Rebalance**: periodic recompute of over/under-loaded nodes. Live
//!   connections are never migrated; the result only informs future
//!   assignments.
//! - **Events**: [`BalancerEvent`] on a broadcast channel

#![deny(unsafe_code)]

pub mod balancer;
pub mod errors;
pub mod events;
pub mod health;
pub mod node;
pub mod stats;
pub mod strategy;

pub use balancer::LoadBalancer;
pub use errors::{BalancerError, Result};
pub use events::BalancerEvent;
pub use health::{HealthReason, HealthThresholds};
pub use node::Node;
pub use stats::{BalancerStats, NodeStats, RebalanceSummary};
pub use strategy::{HashFn, SelectionRequest, fnv1a_32};
