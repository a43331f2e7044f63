//! Liveness watchdog for one client.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::connection::ClientConnection;

/// Why the watchdog stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// Nothing was heard from the client for longer than the timeout.
    TimedOut,
    /// The session ended first.
    Cancelled,
}

/// Check every `interval` whether the client has been silent for at least
/// `timeout`. Any inbound frame counts as a sign of life (see
/// [`ClientConnection::touch`]).
///
/// A `timeout` shorter than `interval` is honoured at the next check, so the
/// effective bound is `max(timeout, interval)`.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut checks = time::interval_at(time::Instant::now() + interval, interval);
    checks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = checks.tick() => {
                if connection.silent_for() >= timeout {
                    return HeartbeatResult::TimedOut;
                }
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}
