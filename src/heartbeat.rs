use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::{CloseReason, ConnectionId};
use crate::events::{Events, ServerEvent};
use crate::registry::Registry;

/// Evicts connections that have been silent for longer than `timeout`.
/// Liveness is purely passive: any inbound line counts, the server never
/// probes.
pub struct HeartbeatMonitor {
    registry: Registry,
    events: Events,
    timeout: Duration,
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(registry: Registry, events: Events, timeout: Duration, interval: Duration) -> Self {
        Self {
            registry,
            events,
            timeout,
            interval,
        }
    }

    /// One pass over the registry. Returns the evicted identities.
    pub fn sweep(&self) -> Vec<ConnectionId> {
        let now = Instant::now();
        let mut evicted = Vec::new();

        for conn in self.registry.snapshot() {
            let idle = conn.idle_for(now);
            if idle <= self.timeout {
                continue;
            }

            let first = conn.close(CloseReason::HeartbeatTimeout);
            self.registry.deregister(conn.id());

            if first {
                self.events.emit(ServerEvent::Evicted {
                    id: conn.id(),
                    name: conn.name().to_string(),
                    idle,
                });
                evicted.push(conn.id());
            }
        }

        evicted
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }

        debug!("heartbeat monitor stopped");
    }
}
