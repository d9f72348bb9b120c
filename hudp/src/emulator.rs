//! Loss/delay emulator: a transparent UDP relay between sender and receiver.
//!
//! Real networks drop, delay, and jitter packets.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! the [`Emulator`] sits on the wire path and applies a configurable fault
//! model to every datagram, independently:
//!
//! | Fault    | Description                                              |
//! |----------|----------------------------------------------------------|
//! | Loss     | Drop with probability `loss`.  Never answered or ACKed.  |
//! | Delay    | Hold for `base_delay + jitter_sample`, clamped at zero.  |
//! | Jitter   | Uniform in `[-jitter, +jitter]` or Gaussian, σ = jitter. |
//!
//! Payloads are opaque: the relay never decodes them, never rewrites them,
//! and preserves datagram boundaries.  Each accepted datagram is forwarded
//! by its own spawned task, so a long delay never holds back the datagrams
//! behind it.
//!
//! ```text
//!  sender ──▶ ┌──────────┐ ──▶ receiver
//!             │ emulator │
//!  sender ◀── └──────────┘ ◀── receiver
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::socket::{ErrorBudget, SharedErrorBudget, Socket, MAX_CONSECUTIVE_IO_ERRORS};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Shape of the per-datagram jitter sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterDistribution {
    /// Uniform in `[-jitter, +jitter]`.
    #[default]
    Uniform,
    /// Normal with mean 0 and standard deviation `jitter`.
    Gaussian,
}

/// Configuration for the fault-injection model.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Probability in `[0.0, 1.0]` that a datagram is silently dropped.
    pub loss: f64,
    /// Mean one-way delay added to every forwarded datagram.
    pub base_delay: Duration,
    /// Jitter magnitude; see [`JitterDistribution`].
    pub jitter: Duration,
    pub distribution: JitterDistribution,
    /// RNG seed for reproducible runs.  `None` = seeded from the OS.
    pub seed: Option<u64>,
    /// Consecutive receive failures, or consecutive forward failures,
    /// that stop the relay.
    pub max_io_errors: u32,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            loss: 0.0,
            base_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            distribution: JitterDistribution::Uniform,
            seed: None,
            max_io_errors: MAX_CONSECUTIVE_IO_ERRORS,
        }
    }
}

impl EmulatorConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if !(0.0..=1.0).contains(&self.loss) {
            return Err(TransportError::Config(format!(
                "loss must be in [0, 1], got {}",
                self.loss
            )));
        }
        if self.max_io_errors == 0 {
            return Err(TransportError::Config("max_io_errors must be non-zero".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Impairment
// ---------------------------------------------------------------------------

/// Fate of one datagram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Drop,
    Forward(Duration),
}

/// Draws an independent [`Decision`] for each datagram.
#[derive(Debug)]
pub struct Impairment {
    config: EmulatorConfig,
    rng: StdRng,
}

impl Impairment {
    pub fn new(config: EmulatorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { config, rng }
    }

    pub fn decide(&mut self) -> Decision {
        if self.config.loss > 0.0 && self.rng.random::<f64>() < self.config.loss {
            return Decision::Drop;
        }

        let base_ms = self.config.base_delay.as_secs_f64() * 1000.0;
        let delay_ms = (base_ms + self.jitter_sample_ms()).max(0.0);
        Decision::Forward(Duration::from_secs_f64(delay_ms / 1000.0))
    }

    /// Signed jitter offset in ms.
    fn jitter_sample_ms(&mut self) -> f64 {
        let j = self.config.jitter.as_secs_f64() * 1000.0;
        if j == 0.0 {
            return 0.0;
        }
        match self.config.distribution {
            JitterDistribution::Uniform => j * (2.0 * self.rng.random::<f64>() - 1.0),
            JitterDistribution::Gaussian => {
                // Box–Muller; u1 in (0, 1] keeps ln() finite.
                let u1 = 1.0 - self.rng.random::<f64>();
                let u2 = self.rng.random::<f64>();
                let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
                j * z
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Live counters, updated from the relay loop and every forward task.
#[derive(Debug, Default)]
pub struct EmulatorStats {
    pub received: AtomicU64,
    pub dropped: AtomicU64,
    pub forwarded: AtomicU64,
    pub bytes_forwarded: AtomicU64,
    pub unknown_source: AtomicU64,
}

/// Plain copy of [`EmulatorStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmulatorReport {
    pub received: u64,
    pub dropped: u64,
    pub forwarded: u64,
    pub bytes_forwarded: u64,
    pub unknown_source: u64,
}

impl EmulatorStats {
    pub fn report(&self) -> EmulatorReport {
        EmulatorReport {
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            unknown_source: self.unknown_source.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Emulator
// ---------------------------------------------------------------------------

/// The two fixed ends of the relayed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub sender: SocketAddr,
    pub receiver: SocketAddr,
}

impl Endpoints {
    /// Destination for a datagram from `from`, and whether `from` is one of
    /// the two endpoints.  Unknown sources are sent on toward the receiver.
    fn route(&self, from: SocketAddr) -> (SocketAddr, bool) {
        if from == self.sender {
            (self.receiver, true)
        } else if from == self.receiver {
            (self.sender, true)
        } else {
            (self.receiver, false)
        }
    }
}

/// A bound, not yet running emulator.
pub struct Emulator {
    socket: Arc<Socket>,
    endpoints: Endpoints,
    impairment: Impairment,
    stats: Arc<EmulatorStats>,
    max_io_errors: u32,
}

impl Emulator {
    pub async fn bind(
        listen: SocketAddr,
        endpoints: Endpoints,
        config: EmulatorConfig,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let socket = Socket::bind(listen).await?;
        log::info!(
            "[emulator] {} relaying sender {} <-> receiver {} (loss={:.1}% delay={:?} jitter={:?} {:?})",
            socket.local_addr,
            endpoints.sender,
            endpoints.receiver,
            config.loss * 100.0,
            config.base_delay,
            config.jitter,
            config.distribution,
        );
        Ok(Self {
            socket: Arc::new(socket),
            endpoints,
            max_io_errors: config.max_io_errors,
            impairment: Impairment::new(config),
            stats: Arc::new(EmulatorStats::default()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn stats(&self) -> Arc<EmulatorStats> {
        Arc::clone(&self.stats)
    }

    /// Spawn the relay loop.
    pub fn start(self) -> EmulatorHandle {
        let (shutdown, rx) = broadcast::channel(1);
        let stats = Arc::clone(&self.stats);
        let local_addr = self.socket.local_addr;
        let task = tokio::spawn(self.run(rx));
        EmulatorHandle {
            local_addr,
            stats,
            shutdown,
            task,
        }
    }

    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), TransportError> {
        let mut budget = ErrorBudget::new(self.max_io_errors);
        let forwards = Arc::new(SharedErrorBudget::new(self.max_io_errors));

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,

                err = forwards.exhausted() => {
                    log::error!("[emulator] relay aborted, forwarding keeps failing: {err}");
                    return Err(err);
                }

                result = self.socket.recv_raw() => {
                    let (data, from) = match result {
                        Ok(v) => {
                            budget.success();
                            v
                        }
                        Err(e) => {
                            log::warn!("[emulator] recv failed: {e}");
                            if let Err(fatal) = budget.failure() {
                                log::error!("[emulator] relay loop aborted: {fatal}");
                                return Err(fatal);
                            }
                            continue;
                        }
                    };
                    self.stats.received.fetch_add(1, Ordering::Relaxed);

                    let (dest, known) = self.endpoints.route(from);
                    if !known {
                        self.stats.unknown_source.fetch_add(1, Ordering::Relaxed);
                        log::debug!("[emulator] datagram from unknown {from}, forwarding to receiver");
                    }

                    let delay = match self.impairment.decide() {
                        Decision::Drop => {
                            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                            log::debug!("[emulator] DROP {} bytes {from} -> {dest}", data.len());
                            continue;
                        }
                        Decision::Forward(delay) => delay,
                    };

                    log::debug!("[emulator] {} bytes {from} -> {dest} in {delay:?}", data.len());
                    let socket = Arc::clone(&self.socket);
                    let stats = Arc::clone(&self.stats);
                    let forwards = Arc::clone(&forwards);
                    tokio::spawn(async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        match socket.send_raw(&data, dest).await {
                            Ok(()) => {
                                forwards.success();
                                stats.forwarded.fetch_add(1, Ordering::Relaxed);
                                stats
                                    .bytes_forwarded
                                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                            }
                            Err(e) => {
                                log::warn!("[emulator] forward to {dest} failed: {e}");
                                // Exhaustion is reported by the relay loop.
                                let _ = forwards.failure();
                            }
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

/// Handle to a running emulator.
pub struct EmulatorHandle {
    pub local_addr: SocketAddr,
    stats: Arc<EmulatorStats>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<(), TransportError>>,
}

impl EmulatorHandle {
    pub fn stats(&self) -> EmulatorReport {
        self.stats.report()
    }

    /// The relay loop has stopped on its own (a fatal I/O error).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop relaying.  Forwards already scheduled still fire.
    pub async fn shutdown(self) -> Result<EmulatorReport, TransportError> {
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(result) => result?,
            Err(join) => log::error!("[emulator] relay task panicked: {join}"),
        }
        let report = self.stats.report();
        log::info!(
            "[emulator] received={} dropped={} forwarded={} bytes={}",
            report.received,
            report.dropped,
            report.forwarded,
            report.bytes_forwarded
        );
        Ok(report)
    }
}
