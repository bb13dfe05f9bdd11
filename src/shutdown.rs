use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::connection::CloseReason;
use crate::error::ShutdownError;
use crate::registry::Registry;

// stand-in deadline when the requested one overflows `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections that were active when shutdown began.
    pub closed: usize,
    pub elapsed: Duration,
}

/// Graceful stop: no new accepts, every live connection asked to close, then
/// a bounded wait for all tracked tasks. Nothing is aborted.
pub struct ShutdownCoordinator {
    signal: CancellationToken,
    registry: Registry,
    tracker: TaskTracker,
    accept: JoinHandle<()>,
}

impl ShutdownCoordinator {
    pub fn new(signal: CancellationToken, registry: Registry, tracker: TaskTracker, accept: JoinHandle<()>) -> Self {
        Self {
            signal,
            registry,
            tracker,
            accept,
        }
    }

    pub async fn shutdown(self, deadline: Duration) -> Result<ShutdownReport, ShutdownError> {
        let started = Instant::now();
        let until = started.checked_add(deadline).unwrap_or(started + FAR_FUTURE);
        let timed_out = |tracker: &TaskTracker| ShutdownError::Timeout {
            deadline,
            pending: tracker.len(),
        };

        self.signal.cancel();
        self.tracker.close();

        // the listener is dropped when the accept loop returns
        if tokio::time::timeout_at(until, self.accept).await.is_err() {
            warn!("accept loop did not stop before the shutdown deadline");
            return Err(timed_out(&self.tracker));
        }

        let open = self.registry.snapshot();
        info!(connections = open.len(), "closing connections");

        for conn in &open {
            conn.close(CloseReason::Shutdown);
            self.registry.deregister(conn.id());
        }

        if tokio::time::timeout_at(until, self.tracker.wait()).await.is_err() {
            let err = timed_out(&self.tracker);
            warn!(%err, "graceful shutdown incomplete");
            return Err(err);
        }

        let report = ShutdownReport {
            closed: open.len(),
            elapsed: started.elapsed(),
        };
        info!(closed = report.closed, elapsed_ms = report.elapsed.as_millis() as u64, "shutdown complete");

        Ok(report)
    }
}
