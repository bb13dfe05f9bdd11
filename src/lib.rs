//! Line-oriented TCP chat server.
//!
//! Each client gets a read task and a write task. Accepted connections live in
//! a [`Registry`](registry::Registry) while active, chat lines fan out through
//! the [`BroadcastHub`](hub::BroadcastHub) into bounded per-connection buffers,
//! a [`HeartbeatMonitor`](heartbeat::HeartbeatMonitor) evicts silent clients and
//! [`ShutdownCoordinator`](shutdown::ShutdownCoordinator) stops everything with a
//! deadline.

mod codegen;
mod conn;

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod shutdown;

pub use config::{Config, OverflowPolicy};
pub use connection::{CloseReason, ConnState, Connection, ConnectionId, SendOutcome};
pub use error::{ServerError, ShutdownError};
pub use events::{EventSink, ServerEvent, TracingSink};
pub use hub::{BroadcastHub, BroadcastMessage, PublishReport};
pub use registry::Registry;
pub use server::{RunningServer, Server};
pub use shutdown::ShutdownReport;
