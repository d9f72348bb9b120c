//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::packet::Packet`] as well as raw datagrams.  All protocol logic
//! lives elsewhere; this module owns only byte I/O and the bookkeeping for
//! transient I/O failures ([`ErrorBudget`]).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

use crate::error::TransportError;
use crate::packet::{Packet, PacketError};

/// Maximum UDP payload size (theoretical limit; in practice kept much smaller).
pub const MAX_DATAGRAM: usize = 65_535;

/// Consecutive I/O failures a loop tolerates before aborting its role.
pub const MAX_CONSECUTIVE_IO_ERRORS: u32 = 16;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The received datagram could not be decoded as a valid packet.
    #[error("packet decode error: {0}")]
    Packet(#[from] PacketError),
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, datagram-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks behind
/// an `Arc`.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `127.0.0.1:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, TransportError> {
        let inner = UdpSocket::bind(local_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: local_addr,
                source,
            })?;
        let local_addr = inner.local_addr().map_err(|source| TransportError::Bind {
            addr: local_addr,
            source,
        })?;
        Ok(Self { local_addr, inner })
    }

    /// Encode `packet` and send it as a single UDP datagram to `dest`.
    pub async fn send_to(&self, packet: &Packet, dest: SocketAddr) -> Result<(), SocketError> {
        self.send_raw(&packet.encode(), dest).await
    }

    /// Send already-encoded bytes as one datagram.
    pub async fn send_raw(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), SocketError> {
        self.inner.send_to(bytes, dest).await?;
        Ok(())
    }

    /// Receive the next datagram without interpreting it.
    pub async fn recv_raw(&self) -> Result<(Vec<u8>, SocketAddr), SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf, addr))
    }
}

// ---------------------------------------------------------------------------
// ErrorBudget
// ---------------------------------------------------------------------------

/// Counts consecutive I/O failures for one loop.
///
/// A success resets the count; exceeding the limit turns a transient error
/// into [`TransportError::PersistentIo`].
#[derive(Debug)]
pub struct ErrorBudget {
    consecutive: u32,
    limit: u32,
}

impl Default for ErrorBudget {
    fn default() -> Self {
        Self::new(MAX_CONSECUTIVE_IO_ERRORS)
    }
}

impl ErrorBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            limit,
        }
    }

    pub fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Record one failure; `Err` once the budget is exhausted.
    pub fn failure(&mut self) -> Result<(), TransportError> {
        self.consecutive += 1;
        if self.consecutive >= self.limit {
            Err(TransportError::PersistentIo {
                consecutive: self.consecutive,
            })
        } else {
            Ok(())
        }
    }
}

/// [`ErrorBudget`] shared between a loop and the tasks it spawns.
///
/// Any task may record outcomes; the owning loop awaits
/// [`SharedErrorBudget::exhausted`] to learn that the limit was reached.
#[derive(Debug)]
pub struct SharedErrorBudget {
    consecutive: AtomicU32,
    limit: u32,
    tripped: Notify,
}

impl SharedErrorBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            consecutive: AtomicU32::new(0),
            limit,
            tripped: Notify::new(),
        }
    }

    pub fn success(&self) {
        self.consecutive.store(0, Ordering::Relaxed);
    }

    pub fn failure(&self) -> Result<(), TransportError> {
        let consecutive = self.consecutive.fetch_add(1, Ordering::Relaxed) + 1;
        if consecutive >= self.limit {
            self.tripped.notify_one();
            Err(TransportError::PersistentIo { consecutive })
        } else {
            Ok(())
        }
    }

    /// Resolves once some task has exhausted the budget.
    pub async fn exhausted(&self) -> TransportError {
        self.tripped.notified().await;
        TransportError::PersistentIo {
            consecutive: self.consecutive.load(Ordering::Relaxed),
        }
    }
}
