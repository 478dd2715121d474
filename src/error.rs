//! Error types for the forwarder.
//!
//! [`ForwardError`] covers the "fatal environment" row of the error table: conditions
//! that leave the process unable to keep serving anyone, which propagate out of
//! `main` and end the run. [`SessionFault`] covers the "protocol violation" row:
//! conditions that are local to one session and are handled by tearing that session
//! down while the rest of the table keeps running.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("readiness wait failed: {0}")]
    Readiness(#[source] io::Error),
}

/// A per-session fault: a protocol violation or an I/O error severe enough to end
/// the session. Never escapes past the session boundary; the readiness loop logs it
/// and tears the session down.
#[derive(Debug, Error)]
pub enum SessionFault {
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
