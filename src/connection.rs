use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Identity of one accepted socket. Allocated from a monotonic counter and
/// never reused for the lifetime of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnState::Connecting,
            1 => ConnState::Active,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Quit,
    PeerClosed,
    ReadError,
    WriteError,
    WriteTimeout,
    HandshakeTimeout,
    HeartbeatTimeout,
    SlowConsumer,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Quit => "quit",
            CloseReason::PeerClosed => "peer closed",
            CloseReason::ReadError => "read error",
            CloseReason::WriteError => "write error",
            CloseReason::WriteTimeout => "write timeout",
            CloseReason::HandshakeTimeout => "handshake timeout",
            CloseReason::HeartbeatTimeout => "heartbeat timeout",
            CloseReason::SlowConsumer => "slow consumer",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Buffer full; the payload was discarded.
    Dropped,
    /// The connection is closing or closed.
    Closed,
}

pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    session: String,
    name: OnceLock<String>,
    outbound: mpsc::Sender<Arc<str>>,
    state: AtomicU8,
    created: Instant,
    // millis since `created`
    last_activity: AtomicU64,
    dropped: AtomicU64,
    close_reason: OnceLock<CloseReason>,
    closed: CancellationToken,
}

impl Connection {
    /// Creates a connection in `Connecting` state along with the receiving
    /// end of its outbound buffer, which belongs to the write task.
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        session: String,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity);

        let conn = Arc::new(Self {
            id,
            peer,
            session,
            name: OnceLock::new(),
            outbound: tx,
            state: AtomicU8::new(ConnState::Connecting as u8),
            created: Instant::now(),
            last_activity: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            close_reason: OnceLock::new(),
            closed: CancellationToken::new(),
        });

        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Display name from the handshake, or `""` before it completes.
    pub fn name(&self) -> &str {
        self.name.get().map(String::as_str).unwrap_or("")
    }

    /// Sets the display name once; later calls are ignored.
    pub fn set_name(&self, name: impl Into<String>) -> bool {
        self.name.set(name.into()).is_ok()
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnState::Active
    }

    /// Enqueues a payload without waiting. A full buffer drops the payload.
    pub fn send(&self, payload: impl Into<Arc<str>>) -> SendOutcome {
        if matches!(self.state(), ConnState::Closing | ConnState::Closed) {
            return SendOutcome::Closed;
        }

        match self.outbound.try_send(payload.into()) {
            Ok(()) => SendOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    pub fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(elapsed, Ordering::AcqRel);
    }

    pub fn last_activity(&self) -> Instant {
        self.created + Duration::from_millis(self.last_activity.load(Ordering::Acquire))
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// `Connecting -> Active`. Fails if the connection is already closing.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                ConnState::Connecting as u8,
                ConnState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves the connection to `Closing` and wakes its tasks. Returns `false`
    /// if it was already closing; only the first reason is kept.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            if current >= ConnState::Closing as u8 {
                return false;
            }

            match self.state.compare_exchange_weak(
                current,
                ConnState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let _ = self.close_reason.set(reason);
        self.closed.cancel();
        true
    }

    /// Terminal state, set once the socket has been released.
    pub fn mark_closed(&self) {
        self.state.store(ConnState::Closed as u8, Ordering::Release);
    }

    /// Resolves once `close` has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_conn(raw: u64, name: &str, capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Arc<str>>) {
    let peer: SocketAddr = ([127, 0, 0, 1], 40000 + raw as u16).into();
    let (conn, rx) = Connection::new(ConnectionId::new(raw), peer, format!("TEST{raw}"), capacity);
    conn.set_name(name);
    (conn, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let (conn, mut rx) = test_conn(1, "alice", 2);

        assert_eq!(conn.send("a\n"), SendOutcome::Queued);
        assert_eq!(conn.send("b\n"), SendOutcome::Queued);
        assert_eq!(conn.send("c\n"), SendOutcome::Dropped);
        assert_eq!(conn.dropped(), 1);

        assert_eq!(&*rx.recv().await.unwrap(), "a\n");
        assert_eq!(conn.send("d\n"), SendOutcome::Queued);
        assert_eq!(&*rx.recv().await.unwrap(), "b\n");
        assert_eq!(&*rx.recv().await.unwrap(), "d\n");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_keeps_first_reason() {
        let (conn, _rx) = test_conn(1, "alice", 4);
        assert!(conn.activate());

        assert!(conn.close(CloseReason::Quit));
        assert!(!conn.close(CloseReason::HeartbeatTimeout));
        assert_eq!(conn.state(), ConnState::Closing);
        assert_eq!(conn.close_reason(), Some(CloseReason::Quit));
        assert_eq!(conn.send("late\n"), SendOutcome::Closed);

        // already cancelled, resolves immediately
        conn.closed().await;

        conn.mark_closed();
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(!conn.close(CloseReason::Shutdown));
    }

    #[tokio::test]
    async fn closed_connection_cannot_activate() {
        let (conn, _rx) = test_conn(1, "alice", 4);

        assert!(conn.close(CloseReason::HandshakeTimeout));
        assert!(!conn.activate());
        assert!(!conn.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_idle_time() {
        let (conn, _rx) = test_conn(1, "alice", 4);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(conn.idle_for(Instant::now()), Duration::from_secs(3));

        conn.touch();
        assert_eq!(conn.idle_for(Instant::now()), Duration::ZERO);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(conn.idle_for(Instant::now()), Duration::from_millis(1500));
    }

    #[test]
    fn name_is_set_once() {
        let (conn, _rx) = test_conn(7, "bob", 1);

        assert!(!conn.set_name("mallory"));
        assert_eq!(conn.name(), "bob");
        assert_eq!(conn.id().to_string(), "#7");
    }
}
