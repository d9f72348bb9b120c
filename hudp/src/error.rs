//! Transport-level error type shared by every role.

use std::net::SocketAddr;

use thiserror::Error;

use crate::socket::SocketError;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not bind the local UDP socket.  Fatal at startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Socket(#[from] SocketError),

    /// A loop hit its consecutive-error budget and gave up.
    #[error("socket failed {consecutive} times in a row")]
    PersistentIo { consecutive: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("metrics snapshot: {0}")]
    Snapshot(String),

    /// The transport has already been shut down.
    #[error("transport closed")]
    Closed,
}
