//! Sender transport: sequence numbering, retransmission and ACK matching.
//!
//! The module is split the same way as the receive side:
//!
//! - [`SendState`] is the pure state machine.  It assigns sequence numbers,
//!   owns the Pending-Ack table and the outbound metrics, and decides what to
//!   resend or fail on each timer tick.  It never touches a socket and takes
//!   `now` as an argument, so every transition is unit-testable.
//! - [`Sender`] wraps a `SendState` in a mutex and drives it from two
//!   background tasks (ACK receive loop and retransmission timer loop) plus
//!   the caller's own [`Sender::send`] calls.  The lock is never held across
//!   an `.await`.
//!
//! # Reliable message lifecycle
//!
//! ```text
//!            send()                 ACK(seq)
//!   ──────────────────▶ Pending ─────────────────▶ Acked
//!                        │   ▲
//!       tick: idle > RTO │   │ retransmit, retry_count += 1
//!                        └───┘
//!                        │
//!                        │ tick: idle > RTO and retry_count ≥ max_retries
//!                        ▼
//!                      Failed
//! ```
//!
//! Unreliable sends are fire-and-forget and resolve immediately as
//! [`Submitted::Sent`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SenderConfig;
use crate::error::TransportError;
use crate::metrics::{MetricsSnapshot, SenderMetrics};
use crate::packet::{now_micros, Channel, Kind, Packet};
use crate::socket::{ErrorBudget, Socket};
use crate::timer::RtoPolicy;

/// Resolved sequence numbers remembered for [`SendState::status`]; older
/// ones report [`ReliableStatus::Unknown`].
pub const STATUS_HISTORY: usize = 4096;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Immediate result of [`Sender::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Unreliable message transmitted once; nothing more will happen.
    Sent { seq: u32 },
    /// Reliable message in flight; its [`Completion`] arrives later.
    Pending { seq: u32 },
}

impl Submitted {
    pub fn seq(&self) -> u32 {
        match *self {
            Submitted::Sent { seq } | Submitted::Pending { seq } => seq,
        }
    }
}

/// Terminal outcome of one reliable message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReliableOutcome {
    /// ACK matched.  `latency` is half the time from first send to ACK.
    Delivered { latency: Duration },
    /// Retransmissions exhausted.
    Failed { retries: u32 },
}

/// Completion notification for a reliable sequence number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Completion {
    pub seq: u32,
    pub outcome: ReliableOutcome,
}

/// Polled view of a reliable sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliableStatus {
    Pending,
    Acked,
    Failed,
    /// Never sent on the reliable channel, or abandoned at shutdown.
    Unknown,
}

// ---------------------------------------------------------------------------
// PendingEntry
// ---------------------------------------------------------------------------

/// One unacknowledged reliable message.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    /// Encoded datagram, resent byte-for-byte so the embedded `send_time`
    /// keeps its first-transmission value.
    pub bytes: Vec<u8>,
    /// Fixed at creation; the latency formula is measured from here.
    pub first_send: Instant,
    /// Refreshed on every retransmission.
    pub last_send: Instant,
    pub retry_count: u32,
}

/// Work produced by one timer tick.
#[derive(Debug, Default)]
pub struct TickActions {
    /// Datagrams to put back on the wire, in sequence order.
    pub resend: Vec<(u32, Vec<u8>)>,
    /// Messages that just moved to Failed.
    pub failed: Vec<Completion>,
}

// ---------------------------------------------------------------------------
// SendState
// ---------------------------------------------------------------------------

/// Sender-side protocol state for one run.
#[derive(Debug)]
pub struct SendState {
    /// Next DATA sequence number, per channel.
    next_seq: [u32; 2],
    /// Pending-Ack table, keyed by reliable sequence number.
    pending: BTreeMap<u32, PendingEntry>,
    /// Terminal states, kept for [`SendState::status`].
    resolved: HashMap<u32, ReliableStatus>,
    /// Resolution order of `resolved`, oldest first.
    resolved_order: VecDeque<u32>,
    rto: RtoPolicy,
    max_retries: u32,
    pub metrics: SenderMetrics,
}

impl SendState {
    pub fn new(rto: RtoPolicy, max_retries: u32, latency_samples: usize) -> Self {
        Self {
            next_seq: [0; 2],
            pending: BTreeMap::new(),
            resolved: HashMap::new(),
            resolved_order: VecDeque::new(),
            rto,
            max_retries,
            metrics: SenderMetrics::new(latency_samples),
        }
    }

    /// Assign the next sequence number on `channel` and encode the DATA
    /// packet.
    ///
    /// Reliable packets enter the Pending-Ack table here and are counted as
    /// sent; unreliable ones are counted by the caller once the socket
    /// accepts them ([`SendState::record_sent`]).
    pub fn next_packet(
        &mut self,
        channel: Channel,
        payload: Vec<u8>,
        send_time: u64,
        now: Instant,
    ) -> (u32, Vec<u8>) {
        let slot = &mut self.next_seq[channel.index()];
        let seq = *slot;
        *slot = slot.wrapping_add(1);

        let payload_len = payload.len();
        let bytes = Packet::data(channel, seq, send_time, payload).encode();

        if channel == Channel::Reliable {
            self.pending.insert(
                seq,
                PendingEntry {
                    bytes: bytes.clone(),
                    first_send: now,
                    last_send: now,
                    retry_count: 0,
                },
            );
            self.record_sent(channel, payload_len);
        }
        (seq, bytes)
    }

    pub fn record_sent(&mut self, channel: Channel, payload_len: usize) {
        self.metrics.on_send(channel, payload_len);
    }

    /// Match an ACK against the Pending-Ack table.
    ///
    /// Returns `None` for a duplicate or unknown ACK (already resolved,
    /// never sent, or arriving after Failed).
    pub fn on_ack(&mut self, seq: u32, now: Instant) -> Option<Completion> {
        let entry = self.pending.remove(&seq)?;
        let rtt = now.saturating_duration_since(entry.first_send);
        let latency = rtt / 2;

        // Karn's rule: a retransmitted message gives an ambiguous RTT.
        if entry.retry_count == 0 {
            self.rto.record_sample(rtt);
        }
        self.metrics.on_delivered(latency);
        self.resolve(seq, ReliableStatus::Acked);

        Some(Completion {
            seq,
            outcome: ReliableOutcome::Delivered { latency },
        })
    }

    /// Scan the Pending-Ack table at a retransmission instant.
    ///
    /// Every entry idle for longer than the current RTO is either resent
    /// (`retry_count += 1`, `last_send = now`) or, if it has already used
    /// `max_retries` retransmissions, removed and reported Failed.
    pub fn on_tick(&mut self, now: Instant) -> TickActions {
        let rto = self.rto.current();
        let mut actions = TickActions::default();

        let mut expired = Vec::new();
        for (&seq, entry) in self.pending.iter_mut() {
            if now.saturating_duration_since(entry.last_send) <= rto {
                continue;
            }
            if entry.retry_count >= self.max_retries {
                expired.push(seq);
                continue;
            }
            entry.retry_count += 1;
            entry.last_send = now;
            actions.resend.push((seq, entry.bytes.clone()));
        }

        for seq in expired {
            if let Some(entry) = self.pending.remove(&seq) {
                self.metrics.on_failed();
                self.resolve(seq, ReliableStatus::Failed);
                actions.failed.push(Completion {
                    seq,
                    outcome: ReliableOutcome::Failed {
                        retries: entry.retry_count,
                    },
                });
            }
        }

        for _ in &actions.resend {
            self.metrics.on_retransmit();
        }
        if !actions.resend.is_empty() {
            self.rto.back_off();
        }
        actions
    }

    fn resolve(&mut self, seq: u32, status: ReliableStatus) {
        if self.resolved.insert(seq, status).is_none() {
            self.resolved_order.push_back(seq);
        }
        while self.resolved_order.len() > STATUS_HISTORY {
            if let Some(old) = self.resolved_order.pop_front() {
                self.resolved.remove(&old);
            }
        }
    }

    pub fn status(&self, seq: u32) -> ReliableStatus {
        if self.pending.contains_key(&seq) {
            return ReliableStatus::Pending;
        }
        self.resolved
            .get(&seq)
            .copied()
            .unwrap_or(ReliableStatus::Unknown)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn current_rto(&self) -> Duration {
        self.rto.current()
    }

    /// Drop every still-pending entry (run ended).  Returns how many.
    pub fn abandon(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }
}

// ---------------------------------------------------------------------------
// Sender (async transport)
// ---------------------------------------------------------------------------

/// Stream of reliable-message completions.
pub struct Completions {
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl Completions {
    /// Wait for the next completion.  `None` once the sender has shut down
    /// and every queued completion has been read.
    pub async fn next(&mut self) -> Option<Completion> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`Completions::next`].
    pub fn try_next(&mut self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }
}

/// A running sender transport.
///
/// Obtain one with [`Sender::start`]; end it with [`Sender::shutdown`],
/// which returns the final metrics snapshot.
pub struct Sender {
    socket: Arc<Socket>,
    peer: SocketAddr,
    tick: Duration,
    state: Arc<Mutex<SendState>>,
    shutdown: broadcast::Sender<()>,
    aborted: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<Result<(), TransportError>>>,
}

impl Sender {
    /// Take ownership of a bound socket and spawn the ACK and
    /// retransmission loops.  Must be called inside a tokio runtime.
    pub fn start(socket: Socket, config: SenderConfig) -> Result<(Self, Completions), TransportError> {
        config.validate()?;

        let socket = Arc::new(socket);
        let state = Arc::new(Mutex::new(SendState::new(
            config.rto_policy(),
            config.max_retries,
            config.latency_samples,
        )));
        let (completions_tx, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        let aborted = Arc::new(AtomicBool::new(false));

        log::info!(
            "[sender] {} -> {} (rto={:?} max_retries={} adaptive={})",
            socket.local_addr,
            config.peer,
            config.rto,
            config.max_retries,
            config.adaptive_rto
        );

        let ack_task = tokio::spawn(guarded(
            "ack loop",
            Arc::clone(&aborted),
            ack_loop(
                Arc::clone(&socket),
                config.peer,
                Arc::clone(&state),
                completions_tx.clone(),
                ErrorBudget::new(config.max_io_errors),
                shutdown.subscribe(),
            ),
        ));
        let timer_task = tokio::spawn(guarded(
            "retransmit loop",
            Arc::clone(&aborted),
            retransmit_loop(
                Arc::clone(&socket),
                config.peer,
                Arc::clone(&state),
                completions_tx,
                config.tick,
                ErrorBudget::new(config.max_io_errors),
                shutdown.subscribe(),
            ),
        ));

        let sender = Self {
            socket,
            peer: config.peer,
            tick: config.tick,
            state,
            shutdown,
            aborted,
            tasks: vec![ack_task, timer_task],
        };
        Ok((sender, Completions { rx }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// Send one application message on `channel`.
    ///
    /// Never waits for delivery.  A failed first transmission of a reliable
    /// message is not an error: the entry is already pending and the timer
    /// loop retries it.  A failed unreliable transmission is returned.
    pub async fn send(&self, channel: Channel, payload: &[u8]) -> Result<Submitted, TransportError> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let (seq, bytes) =
            lock(&self.state).next_packet(channel, payload.to_vec(), now_micros(), Instant::now());

        let result = self.socket.send_raw(&bytes, self.peer).await;
        match channel {
            Channel::Reliable => {
                if let Err(e) = result {
                    log::warn!("[sender] first send of seq={seq} failed, will retry: {e}");
                }
                log::debug!("[sender] -> REL seq={seq} len={}", payload.len());
                Ok(Submitted::Pending { seq })
            }
            Channel::Unreliable => {
                result?;
                lock(&self.state).record_sent(channel, payload.len());
                log::debug!("[sender] -> UNREL seq={seq} len={}", payload.len());
                Ok(Submitted::Sent { seq })
            }
        }
    }

    /// Polled state of a reliable sequence number.
    pub fn status(&self, seq: u32) -> ReliableStatus {
        lock(&self.state).status(seq)
    }

    /// Reliable messages still awaiting an ACK.
    pub fn pending(&self) -> usize {
        lock(&self.state).pending_len()
    }

    /// Wait until nothing is pending or `grace` has elapsed.
    ///
    /// Returns `true` if every reliable message reached Acked or Failed.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.pending() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.tick).await;
        }
    }

    /// Live metrics without stopping the transport.
    ///
    /// Nothing counts as abandoned until [`Sender::shutdown`]; see
    /// [`Sender::pending`] for messages still in flight.
    pub fn snapshot(&self) -> MetricsSnapshot {
        lock(&self.state).metrics.snapshot(0)
    }

    /// Stop both loops, abandon whatever is still pending and return the
    /// final snapshot.
    ///
    /// If a loop aborted on persistent socket failure, that error is
    /// returned instead.
    pub async fn shutdown(self) -> Result<MetricsSnapshot, TransportError> {
        let _ = self.shutdown.send(());

        let mut first_err = None;
        for task in self.tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(join) => log::error!("[sender] background task panicked: {join}"),
            }
        }

        let mut state = lock(&self.state);
        let abandoned = state.abandon();
        if abandoned > 0 {
            log::info!("[sender] abandoning {abandoned} pending reliable message(s)");
        }
        state.metrics.stop();
        let snapshot = state.metrics.snapshot(abandoned as u64);
        drop(state);

        match first_err {
            Some(e) => Err(e),
            None => Ok(snapshot),
        }
    }
}

fn lock(state: &Mutex<SendState>) -> MutexGuard<'_, SendState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Log and flag a loop that ended with an error.
async fn guarded<F>(name: &'static str, aborted: Arc<AtomicBool>, fut: F) -> Result<(), TransportError>
where
    F: std::future::Future<Output = Result<(), TransportError>>,
{
    let result = fut.await;
    if let Err(e) = &result {
        log::error!("[sender] {name} aborted: {e}");
        aborted.store(true, Ordering::Release);
    }
    result
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

async fn ack_loop(
    socket: Arc<Socket>,
    peer: SocketAddr,
    state: Arc<Mutex<SendState>>,
    completions: mpsc::UnboundedSender<Completion>,
    mut budget: ErrorBudget,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), TransportError> {

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            result = socket.recv_raw() => {
                let (bytes, from) = match result {
                    Ok(v) => {
                        budget.success();
                        v
                    }
                    Err(e) => {
                        log::warn!("[sender] recv failed: {e}");
                        budget.failure()?;
                        continue;
                    }
                };
                if from != peer {
                    log::debug!("[sender] ignoring datagram from stranger {from}");
                    continue;
                }

                let pkt = match Packet::decode(&bytes) {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("[sender] dropping malformed datagram: {e}");
                        continue;
                    }
                };
                if pkt.header.kind != Kind::Ack {
                    log::debug!("[sender] ignoring {} DATA seq={}", pkt.header.channel, pkt.header.seq);
                    continue;
                }

                let seq = pkt.header.seq;
                let done = lock(&state).on_ack(seq, Instant::now());
                match done {
                    Some(c) => {
                        log::debug!("[sender] <- ACK seq={seq} {:?}", c.outcome);
                        let _ = completions.send(c);
                    }
                    None => log::debug!("[sender] <- ACK seq={seq} (duplicate)"),
                }
            }
        }
    }
    Ok(())
}

async fn retransmit_loop(
    socket: Arc<Socket>,
    peer: SocketAddr,
    state: Arc<Mutex<SendState>>,
    completions: mpsc::UnboundedSender<Completion>,
    tick: Duration,
    mut budget: ErrorBudget,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), TransportError> {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            _ = interval.tick() => {
                let actions = lock(&state).on_tick(Instant::now());

                for c in actions.failed {
                    log::warn!("[sender] seq={} failed: {:?}", c.seq, c.outcome);
                    let _ = completions.send(c);
                }
                for (seq, bytes) in actions.resend {
                    match socket.send_raw(&bytes, peer).await {
                        Ok(()) => {
                            budget.success();
                            log::debug!("[sender] retransmit seq={seq}");
                        }
                        Err(e) => {
                            log::warn!("[sender] retransmit seq={seq} failed: {e}");
                            budget.failure()?;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
