//! Tunables for the sender and receiver transports.
//!
//! All fields default to the values the protocol was tuned with: a 40 ms
//! retransmission interval checked every 10 ms, five retries, so a reliable
//! message is resolved within roughly 200 ms.  The emulator's settings live
//! in [`crate::emulator::EmulatorConfig`].

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::TransportError;
use crate::metrics::DEFAULT_LATENCY_SAMPLES;
use crate::socket::MAX_CONSECUTIVE_IO_ERRORS;
use crate::timer::RtoPolicy;

pub const DEFAULT_RTO: Duration = Duration::from_millis(40);
pub const DEFAULT_MAX_RTO: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);
pub const DEFAULT_DEDUP_WINDOW: usize = 1024;
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);
/// How long ordered delivery waits for a missing reliable message before
/// skipping past it.
pub const DEFAULT_GAP_TIMEOUT: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// SenderConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Where DATA packets go: the receiver, or the emulator in front of it.
    pub peer: SocketAddr,
    /// Initial (or fixed) retransmission timeout.
    pub rto: Duration,
    /// Retransmissions allowed before a message is Failed.
    /// `u32::MAX` retries forever.
    pub max_retries: u32,
    /// How often the retransmission timer scans pending entries.
    pub tick: Duration,
    /// Use an RFC 6298 estimator instead of a fixed RTO.
    pub adaptive_rto: bool,
    /// Ceiling for the adaptive estimator.
    pub max_rto: Duration,
    pub latency_samples: usize,
    /// Consecutive socket errors tolerated per loop.
    pub max_io_errors: u32,
}

impl SenderConfig {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            rto: DEFAULT_RTO,
            max_retries: DEFAULT_MAX_RETRIES,
            tick: DEFAULT_TICK,
            adaptive_rto: false,
            max_rto: DEFAULT_MAX_RTO,
            latency_samples: DEFAULT_LATENCY_SAMPLES,
            max_io_errors: MAX_CONSECUTIVE_IO_ERRORS,
        }
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.rto.is_zero() {
            return Err(TransportError::Config("rto must be non-zero".into()));
        }
        if self.tick.is_zero() {
            return Err(TransportError::Config("tick must be non-zero".into()));
        }
        if self.latency_samples == 0 {
            return Err(TransportError::Config(
                "latency_samples must be non-zero".into(),
            ));
        }
        if self.max_io_errors == 0 {
            return Err(TransportError::Config("max_io_errors must be non-zero".into()));
        }
        Ok(())
    }

    pub fn rto_policy(&self) -> RtoPolicy {
        if self.adaptive_rto {
            RtoPolicy::adaptive(self.rto, self.max_rto)
        } else {
            RtoPolicy::fixed(self.rto)
        }
    }
}

// ---------------------------------------------------------------------------
// ReceiverConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Recent sequence numbers remembered per channel for duplicate
    /// suppression.
    pub dedup_window: usize,
    pub latency_samples: usize,
    /// Period of the metrics snapshot loop.
    pub snapshot_interval: Duration,
    /// Hand reliable payloads to the application in sequence order.
    pub ordered_reliable: bool,
    /// With `ordered_reliable`, how long a gap may block delivery.
    pub gap_timeout: Duration,
    /// Consecutive socket errors tolerated on the receive and ACK paths.
    pub max_io_errors: u32,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            dedup_window: DEFAULT_DEDUP_WINDOW,
            latency_samples: DEFAULT_LATENCY_SAMPLES,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            ordered_reliable: false,
            gap_timeout: DEFAULT_GAP_TIMEOUT,
            max_io_errors: MAX_CONSECUTIVE_IO_ERRORS,
        }
    }
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.dedup_window == 0 {
            return Err(TransportError::Config("dedup_window must be non-zero".into()));
        }
        if self.latency_samples == 0 {
            return Err(TransportError::Config(
                "latency_samples must be non-zero".into(),
            ));
        }
        if self.snapshot_interval.is_zero() {
            return Err(TransportError::Config(
                "snapshot_interval must be non-zero".into(),
            ));
        }
        if self.ordered_reliable && self.gap_timeout.is_zero() {
            return Err(TransportError::Config("gap_timeout must be non-zero".into()));
        }
        if self.max_io_errors == 0 {
            return Err(TransportError::Config("max_io_errors must be non-zero".into()));
        }
        Ok(())
    }
}
