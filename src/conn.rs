use anyhow::Result;
use chrono::Local;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codegen;
use crate::connection::{CloseReason, Connection};
use crate::events::ServerEvent;
use crate::hub::BroadcastMessage;
use crate::protocol::{Command, LineReader, parse_line, validate_name};
use crate::server::ServerState;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

// upper bound on flushing queued lines after close
const CLOSE_GRACE: Duration = Duration::from_millis(500);

enum Flow {
    Continue,
    Quit,
}

/// Runs one client from accept to socket release: handshake, registration,
/// then the read loop. The write task is spawned alongside and awaited at the
/// end so the connection is only marked closed once the socket is gone.
pub async fn handle(state: ServerState, socket: TcpStream, peer: SocketAddr) -> Result<()> {
    socket.set_nodelay(true)?;
    let (reader, writer) = socket.into_split();

    let (conn, outbound) = Connection::new(
        state.registry.next_id(),
        peer,
        codegen::make_code(codegen::CODE_LEN),
        state.config.outbound_capacity,
    );

    let write_task = state
        .tracker
        .spawn(write_loop(conn.clone(), writer, outbound, state.config.write_timeout));

    conn.send(format!(
        "[server] welcome to chatwire, session {}\n[server] what's your name?\n",
        conn.session()
    ));

    let mut lines = LineReader::new(reader, state.config.max_line_len);

    let mut joined = false;
    let reason = match handshake(&state, &conn, &mut lines).await {
        Ok(name) => {
            conn.set_name(name);
            conn.touch();
            match join(&state, &conn) {
                Ok(()) => {
                    joined = true;
                    read_loop(&state, &conn, &mut lines).await
                }
                Err(reason) => reason,
            }
        }
        Err(reason) => reason,
    };

    conn.close(reason);
    state.registry.deregister(conn.id());

    let reason = conn.close_reason().unwrap_or(reason);
    if joined && reason != CloseReason::Shutdown {
        state
            .hub
            .publish(&BroadcastMessage::notice(Some(conn.id()), format!("{} left.", conn.name())));
    }

    drop(lines);
    await_writer(&conn, write_task).await;
    conn.mark_closed();

    if joined {
        state.events.emit(ServerEvent::Disconnected {
            id: conn.id(),
            name: conn.name().to_string(),
            reason,
        });
    }

    Ok(())
}

async fn handshake(
    state: &ServerState,
    conn: &Connection,
    lines: &mut LineReader<OwnedReadHalf>,
) -> Result<String, CloseReason> {
    let deadline = tokio::time::sleep(state.config.heartbeat_timeout);
    tokio::pin!(deadline);

    loop {
        let line = tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => return Err(CloseReason::Shutdown),
            _ = conn.closed() => return Err(conn.close_reason().unwrap_or(CloseReason::Shutdown)),
            _ = &mut deadline => return Err(CloseReason::HandshakeTimeout),
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => match validate_name(&line) {
                Ok(name) => return Ok(name),
                Err(e) => {
                    conn.send(format!("[error] {e}\n"));
                }
            },
            Ok(None) => return Err(CloseReason::PeerClosed),
            Err(e) => {
                debug!(conn = %conn.id(), error = %e, "read failed during handshake");
                return Err(CloseReason::ReadError);
            }
        }
    }
}

/// Registers the named connection and announces it.
fn join(state: &ServerState, conn: &Arc<Connection>) -> Result<(), CloseReason> {
    if !state.registry.register(conn.clone()) {
        return Err(conn.close_reason().unwrap_or(CloseReason::Shutdown));
    }
    // shutdown may have taken its snapshot before we registered
    if state.shutdown.is_cancelled() {
        return Err(CloseReason::Shutdown);
    }

    state.events.emit(ServerEvent::Connected {
        id: conn.id(),
        peer: conn.peer(),
        name: conn.name().to_string(),
    });

    state
        .hub
        .publish(&BroadcastMessage::notice(Some(conn.id()), format!("{} joined.", conn.name())));
    conn.send(format!("[ok] hello {}, {} online\n", conn.name(), state.registry.active_len()));

    Ok(())
}

async fn read_loop(state: &ServerState, conn: &Connection, lines: &mut LineReader<OwnedReadHalf>) -> CloseReason {
    loop {
        let line = tokio::select! {
            biased;
            _ = conn.closed() => break conn.close_reason().unwrap_or(CloseReason::Shutdown),
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                conn.touch();

                let Some(cmd) = parse_line(&line) else {
                    continue;
                };

                if let Flow::Quit = handle_command(state, conn, cmd) {
                    break CloseReason::Quit;
                }
            }
            Ok(None) => break CloseReason::PeerClosed,
            Err(e) => {
                debug!(conn = %conn.id(), error = %e, "read failed");
                break CloseReason::ReadError;
            }
        }
    }
}

fn handle_command(state: &ServerState, conn: &Connection, cmd: Command) -> Flow {
    match cmd {
        Command::Quit => {
            conn.send("[server] bye\n");
            return Flow::Quit;
        }

        Command::Ping => {
            conn.send("pong\n");
        }

        Command::Time => {
            conn.send(format!("{}\n", Local::now().format(TIME_FORMAT)));
        }

        Command::Date => {
            conn.send(format!("{}\n", Local::now().format(DATE_FORMAT)));
        }

        Command::Echo(text) => {
            conn.send(format!("{text}\n"));
        }

        Command::EchoUsage => {
            conn.send("usage: echo:<text>\n");
        }

        Command::Who => {
            let names: Vec<_> = state.registry.roster().into_iter().map(|(_, name)| name).collect();
            conn.send(format!("[server] online: {}\n", names.join(", ")));
        }

        Command::Say(text) => {
            state.hub.publish(&BroadcastMessage::chat(conn, text));
        }
    }

    Flow::Continue
}

/// Drains the outbound buffer to the socket. Once the connection closes, the
/// buffer is closed to new sends and whatever is already queued gets one
/// short, overall grace period to reach the peer before the socket is dropped.
async fn write_loop(
    conn: Arc<Connection>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Arc<str>>,
    write_timeout: Duration,
) {
    let mut healthy = true;

    loop {
        let line = tokio::select! {
            biased;
            _ = conn.closed() => break,
            line = outbound.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            res = write_line(&mut writer, &line, write_timeout) => res,
            // a write blocked on a peer that stopped reading must not outlive close
            _ = conn.closed() => {
                healthy = false;
                break;
            }
        };

        if let Err(reason) = written {
            conn.close(reason);
            healthy = false;
            break;
        }
    }

    outbound.close();

    if healthy {
        let grace = write_timeout.min(CLOSE_GRACE);
        let _ = tokio::time::timeout(grace, async {
            while let Ok(line) = outbound.try_recv() {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
            }
            let _ = writer.shutdown().await;
        })
        .await;
    }
}

/// Waits for the write task. Returns `false` if it panicked or was cancelled.
async fn await_writer(conn: &Connection, task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(err) => {
            warn!(conn = %conn.id(), "write task failed: {err}");
            false
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str, write_timeout: Duration) -> Result<(), CloseReason> {
    match tokio::time::timeout(write_timeout, writer.write_all(line.as_bytes())).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(CloseReason::WriteError),
        Err(_) => Err(CloseReason::WriteTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_conn;

    async fn explode() {
        panic!("writer blew up");
    }

    #[tokio::test]
    async fn panicking_writer_is_reported() {
        let (conn, _rx) = test_conn(1, "alice", 4);

        let task = tokio::spawn(explode());
        assert!(!await_writer(&conn, task).await);

        let task = tokio::spawn(async {});
        assert!(await_writer(&conn, task).await);
    }
}
