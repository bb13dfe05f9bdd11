use std::sync::Arc;
use std::time::SystemTime;

use crate::config::OverflowPolicy;
use crate::connection::{CloseReason, Connection, ConnectionId, SendOutcome};
use crate::events::{Events, ServerEvent};
use crate::registry::Registry;

const SERVER_LABEL: &str = "server";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    pub sender: Option<ConnectionId>,
    pub label: String,
    pub payload: String,
    pub timestamp: SystemTime,
}

impl BroadcastMessage {
    /// A chat line from `sender`, shown as `[<name>] <payload>`.
    pub fn chat(sender: &Connection, payload: impl Into<String>) -> Self {
        Self {
            sender: Some(sender.id()),
            label: sender.name().to_string(),
            payload: payload.into(),
            timestamp: SystemTime::now(),
        }
    }

    /// A server notice. `about` is excluded from delivery like a sender.
    pub fn notice(about: Option<ConnectionId>, text: impl Into<String>) -> Self {
        Self {
            sender: about,
            label: SERVER_LABEL.to_string(),
            payload: text.into(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn render(&self) -> String {
        format!("[{}] {}\n", self.label, self.payload)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub queued: usize,
    pub dropped: usize,
    pub disconnected: usize,
}

#[derive(Clone)]
pub struct BroadcastHub {
    registry: Registry,
    events: Events,
    echo_suppression: bool,
    overflow: OverflowPolicy,
}

impl BroadcastHub {
    pub fn new(registry: Registry, events: Events, echo_suppression: bool, overflow: OverflowPolicy) -> Self {
        Self {
            registry,
            events,
            echo_suppression,
            overflow,
        }
    }

    /// Queues `msg` on every active connection. Never waits on a recipient:
    /// each delivery is a non-blocking enqueue.
    pub fn publish(&self, msg: &BroadcastMessage) -> PublishReport {
        let line: Arc<str> = msg.render().into();
        let mut report = PublishReport::default();

        for conn in self.registry.snapshot() {
            if self.echo_suppression && msg.sender == Some(conn.id()) {
                continue;
            }

            match conn.send(line.clone()) {
                SendOutcome::Queued => report.queued += 1,
                SendOutcome::Dropped => {
                    report.dropped += 1;
                    self.events.emit(ServerEvent::Dropped {
                        id: conn.id(),
                        name: conn.name().to_string(),
                        total: conn.dropped(),
                    });

                    if self.overflow == OverflowPolicy::Disconnect && conn.close(CloseReason::SlowConsumer) {
                        self.registry.deregister(conn.id());
                        report.disconnected += 1;
                    }
                }
                SendOutcome::Closed => {}
            }
        }

        report
    }
}
