use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::connection::{CloseReason, ConnectionId};

/// Lifecycle facts the server reports to whoever is listening.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Connected {
        id: ConnectionId,
        peer: SocketAddr,
        name: String,
    },
    Disconnected {
        id: ConnectionId,
        name: String,
        reason: CloseReason,
    },
    Evicted {
        id: ConnectionId,
        name: String,
        idle: Duration,
    },
    Dropped {
        id: ConnectionId,
        name: String,
        total: u64,
    },
}

pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: ServerEvent);
}

pub type Events = Arc<dyn EventSink>;

/// Writes events to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { id, peer, name } => {
                info!(conn = %id, %peer, %name, "connected");
            }
            ServerEvent::Disconnected { id, name, reason } => {
                info!(conn = %id, %name, %reason, "disconnected");
            }
            ServerEvent::Evicted { id, name, idle } => {
                warn!(conn = %id, %name, idle_ms = idle.as_millis() as u64, "evicted idle connection");
            }
            ServerEvent::Dropped { id, name, total } => {
                debug!(conn = %id, %name, total, "outbound buffer full, dropped message");
            }
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ServerEvent) {}
}
