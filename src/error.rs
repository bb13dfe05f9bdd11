use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Tasks were still running when the deadline passed. They are left to
    /// finish on their own.
    #[error("shutdown deadline of {deadline:?} elapsed with {pending} task(s) still running")]
    Timeout { deadline: Duration, pending: usize },
}
