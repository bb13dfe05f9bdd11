use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ServerError, ShutdownError};
use crate::events::{Events, NullSink};
use crate::heartbeat::HeartbeatMonitor;
use crate::hub::BroadcastHub;
use crate::registry::Registry;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Everything a connection task needs, cheap to clone.
#[derive(Clone)]
pub(crate) struct ServerState {
    pub registry: Registry,
    pub hub: BroadcastHub,
    pub events: Events,
    pub config: Arc<Config>,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
}

pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Config,
    events: Events,
}

impl Server {
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: config.listen.clone(),
            source,
        })?;

        Ok(Self {
            listener,
            local_addr,
            config,
            events: Arc::new(NullSink),
        })
    }

    pub fn with_events(mut self, events: Events) -> Self {
        self.events = events;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the accept loop and the heartbeat monitor.
    pub fn start(self) -> RunningServer {
        let registry = Registry::default();
        let hub = BroadcastHub::new(
            registry.clone(),
            self.events.clone(),
            !self.config.echo_self,
            self.config.overflow,
        );
        let monitor = HeartbeatMonitor::new(
            registry.clone(),
            self.events.clone(),
            self.config.heartbeat_timeout,
            self.config.sweep_interval(),
        );

        let state = ServerState {
            registry,
            hub,
            events: self.events,
            config: Arc::new(self.config),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };

        state.tracker.spawn(monitor.run(state.shutdown.clone()));
        let accept = state.tracker.spawn(accept_loop(self.listener, state.clone()));

        info!(addr = %self.local_addr, "listening");

        RunningServer {
            state,
            accept,
            local_addr: self.local_addr,
        }
    }
}

pub struct RunningServer {
    state: ServerState,
    accept: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Registry {
        self.state.registry.clone()
    }

    pub fn hub(&self) -> BroadcastHub {
        self.state.hub.clone()
    }

    /// Resolves when the server stops accepting on its own (fatal accept
    /// error) or shutdown has begun.
    pub async fn stopped(&self) {
        self.state.shutdown.cancelled().await
    }

    pub async fn shutdown(self, deadline: Duration) -> Result<ShutdownReport, ShutdownError> {
        ShutdownCoordinator::new(
            self.state.shutdown,
            self.state.registry,
            self.state.tracker,
            self.accept,
        )
        .shutdown(deadline)
        .await
    }
}

async fn accept_loop(listener: TcpListener, state: ServerState) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => break,
            res = listener.accept() => res,
        };

        match accepted {
            Ok((socket, peer)) => {
                debug!(%peer, "accepted");

                let conn_state = state.clone();
                state.tracker.spawn(async move {
                    if let Err(err) = crate::conn::handle(conn_state, socket, peer).await {
                        warn!(%peer, "connection error: {err:#}");
                    }
                });
            }

            Err(err) if is_transient(&err) => {
                warn!(error = %err, "transient accept error, retrying");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }

            Err(err) => {
                error!(error = %err, "accept failed, no longer accepting connections");
                state.shutdown.cancel();
                break;
            }
        }
    }

    debug!("accept loop stopped");
}

fn is_transient(err: &io::Error) -> bool {
    use std::io::ErrorKind::*;

    if matches!(
        err.kind(),
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock | TimedOut
    ) {
        return true;
    }

    // out of file descriptors clears up as connections close
    #[cfg(unix)]
    {
        const ENFILE: i32 = 23;
        const EMFILE: i32 = 24;
        if matches!(err.raw_os_error(), Some(ENFILE | EMFILE)) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
        #[cfg(unix)]
        assert!(is_transient(&io::Error::from_raw_os_error(24)));
    }

    #[tokio::test]
    async fn bind_rejects_invalid_config() {
        let config = Config {
            listen: "127.0.0.1:0".into(),
            outbound_capacity: 0,
            ..Config::default()
        };

        assert!(matches!(Server::bind(config).await, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn bind_reports_unusable_address() {
        let config = Config {
            listen: "not-an-address".into(),
            ..Config::default()
        };

        assert!(matches!(Server::bind(config).await, Err(ServerError::Bind { .. })));
    }
}
