use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::ServerError;

// timers further out than this are treated as misconfiguration
const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// What the hub does when a recipient's outbound buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OverflowPolicy {
    /// Discard the new message for that recipient and count the drop.
    #[default]
    Drop,
    /// Close the recipient as a slow consumer.
    Disconnect,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "chatwire", version, about = "Line-oriented TCP chat broadcaster")]
pub struct Config {
    /// Address to listen on (host:port)
    #[arg(long, env = "CHATWIRE_LISTEN", default_value = "0.0.0.0:7000")]
    pub listen: String,

    /// Disconnect clients silent for longer than this
    #[arg(long, env = "CHATWIRE_HEARTBEAT_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub heartbeat_timeout: Duration,

    /// How often idle clients are swept (defaults to half the heartbeat timeout)
    #[arg(long, env = "CHATWIRE_SWEEP_INTERVAL", value_parser = parse_duration)]
    pub sweep_interval: Option<Duration>,

    /// Pending outbound lines kept per client
    #[arg(long, env = "CHATWIRE_OUTBOUND_CAPACITY", default_value_t = 64)]
    pub outbound_capacity: usize,

    /// How long shutdown waits for connection tasks to finish
    #[arg(long, env = "CHATWIRE_SHUTDOWN_DEADLINE", default_value = "5s", value_parser = parse_duration)]
    pub shutdown_deadline: Duration,

    /// Deadline for a single socket write
    #[arg(long, env = "CHATWIRE_WRITE_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub write_timeout: Duration,

    /// Longest inbound line in bytes; longer lines are split
    #[arg(long = "max-line", env = "CHATWIRE_MAX_LINE", default_value_t = 4096)]
    pub max_line_len: usize,

    /// Policy for full outbound buffers
    #[arg(long, env = "CHATWIRE_OVERFLOW", value_enum, default_value_t = OverflowPolicy::Drop)]
    pub overflow: OverflowPolicy,

    /// Deliver a client's own messages back to it
    #[arg(long, env = "CHATWIRE_ECHO_SELF")]
    pub echo_self: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7000".to_string(),
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: None,
            outbound_capacity: 64,
            shutdown_deadline: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            max_line_len: 4096,
            overflow: OverflowPolicy::Drop,
            echo_self: false,
        }
    }
}

impl Config {
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval.unwrap_or(self.heartbeat_timeout / 2)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        let zero = |what: &str| Err(ServerError::Config(format!("{what} must be greater than zero")));

        if self.heartbeat_timeout.is_zero() {
            return zero("heartbeat timeout");
        }
        if self.sweep_interval().is_zero() {
            return zero("sweep interval");
        }
        if self.write_timeout.is_zero() {
            return zero("write timeout");
        }
        if self.outbound_capacity == 0 {
            return zero("outbound capacity");
        }
        if self.max_line_len == 0 {
            return zero("max line length");
        }

        for (what, value) in [
            ("heartbeat timeout", self.heartbeat_timeout),
            ("sweep interval", self.sweep_interval()),
            ("write timeout", self.write_timeout),
            ("shutdown deadline", self.shutdown_deadline),
        ] {
            if value > MAX_DURATION {
                return Err(ServerError::Config(format!("{what} must be at most {MAX_DURATION:?}")));
            }
        }

        Ok(())
    }
}

/// Accepts `250ms`, `2s` or a bare number of seconds (`1.5`).
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();

    if let Some(ms) = raw.strip_suffix("ms") {
        return ms
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| format!("invalid milliseconds '{raw}': {e}"));
    }

    let secs = raw.strip_suffix('s').unwrap_or(raw).trim();
    let secs: f64 = secs
        .parse()
        .map_err(|e| format!("invalid duration '{raw}': {e}"))?;

    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("invalid duration '{raw}'"));
    }

    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration '{raw}': {e}"))
}
