//! Process-wide stop signal and task draining.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Grace period given to background tasks once the stop signal fires.
const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Tasks that finished inside the grace period.
    pub finished: usize,
    /// Tasks aborted when the grace period ran out.
    pub aborted: usize,
}

/// Owns the stop signal shared by the listener, the pool loops and the
/// presence tracker.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    grace: Duration,
}

impl ShutdownCoordinator {
    /// Coordinator with the default 30s grace period.
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GRACE)
    }

    /// Coordinator with a custom grace period.
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace,
        }
    }

    /// Token that background tasks select on.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Fire the stop signal. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Whether the stop signal has fired.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fire the stop signal and wait for `handles`. Tasks still running
    /// after the grace period are aborted.
    pub async fn drain(&self, handles: Vec<JoinHandle<()>>) -> DrainReport {
        self.trigger();
        let total = handles.len();
        let aborters: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        let wait = futures::future::join_all(handles);
        if tokio::time::timeout(self.grace, wait).await.is_ok() {
            info!(tasks = total, "background tasks drained");
            return DrainReport {
                finished: total,
                aborted: 0,
            };
        }

        let aborted = aborters.iter().filter(|a| !a.is_finished()).count();
        for aborter in &aborters {
            aborter.abort();
        }
        warn!(
            aborted,
            grace_secs = self.grace.as_secs_f64(),
            "grace period elapsed, aborting remaining tasks"
        );
        DrainReport {
            finished: total - aborted,
            aborted,
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
