//! Receiver transport: duplicate suppression, ACK generation, inbound metrics.
//!
//! Mirrors [`crate::sender`]:
//!
//! - [`DedupWindow`] remembers the most recent sequence numbers seen on one
//!   channel.  Ordering is not guaranteed by this protocol, so membership in
//!   a bounded recent set is all that is needed.
//! - [`ReceiveState`] is the pure per-datagram state machine: decode, dedup,
//!   decide whether to deliver and whether to ACK, update metrics.
//! - [`ReorderBuffer`] optionally holds reliable payloads back until they
//!   can be released in sequence order, skipping a gap once it has blocked
//!   delivery for longer than the configured timeout.
//! - [`Receiver`] drives a `ReceiveState` from a receive loop and a periodic
//!   metrics snapshot loop, and hands delivered payloads to the application
//!   through [`Deliveries`].
//!
//! # Per-datagram decisions
//!
//! | Inbound                      | Deliver | ACK |
//! |------------------------------|---------|-----|
//! | reliable DATA, first seen    | yes     | yes |
//! | reliable DATA, duplicate     | no      | yes |
//! | unreliable DATA, first seen  | yes     | no  |
//! | unreliable DATA, duplicate   | no      | no  |
//! | ACK                          | no      | no  |
//! | malformed                    | no      | no  |

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ReceiverConfig;
use crate::error::TransportError;
use crate::metrics::{MetricsSnapshot, ReceiverMetrics};
use crate::packet::{now_micros, Channel, Kind, Packet, PacketError};
use crate::socket::{ErrorBudget, Socket};

// ---------------------------------------------------------------------------
// DedupWindow
// ---------------------------------------------------------------------------

/// Bounded record of recently seen sequence numbers.
///
/// Sequence numbers only grow on the sending side, so the window is anchored
/// at the highest number seen: everything in `(highest - capacity, highest]`
/// is tracked exactly, and anything at or below `highest - capacity` counts
/// as already seen.  Memory stays bounded by `capacity` regardless of the
/// packet rate, and a very late retransmission is never mistaken for a new
/// message.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    seen: BTreeSet<u32>,
    highest: Option<u32>,
    capacity: u32,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: BTreeSet::new(),
            highest: None,
            capacity: u32::try_from(capacity.max(1)).unwrap_or(u32::MAX),
        }
    }

    /// Record `seq`.  Returns `true` if it was not seen before.
    pub fn insert(&mut self, seq: u32) -> bool {
        if self.is_stale(seq) || !self.seen.insert(seq) {
            return false;
        }
        if self.highest.map_or(true, |h| seq > h) {
            self.highest = Some(seq);
            while let Some(&low) = self.seen.first() {
                if !self.is_stale(low) {
                    break;
                }
                self.seen.pop_first();
            }
        }
        true
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.is_stale(seq) || self.seen.contains(&seq)
    }

    /// Below the tracked range.
    fn is_stale(&self, seq: u32) -> bool {
        match self.highest {
            Some(h) if seq < h => h - seq >= self.capacity,
            _ => false,
        }
    }

    /// Sequence numbers tracked exactly.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ReceiveState
// ---------------------------------------------------------------------------

/// An application payload handed up by the receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub channel: Channel,
    pub seq: u32,
    pub payload: Vec<u8>,
    /// Sender's embedded first-transmission timestamp (µs since epoch).
    pub send_time: u64,
    /// Local arrival timestamp (µs since epoch).
    pub arrival_time: u64,
    /// One-way latency in ms, unreliable channel only.
    pub latency_ms: Option<f64>,
}

/// What the receiver decided to do with one datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// First sighting: hand `delivery` to the application, send `ack` if any.
    Delivered {
        delivery: Delivery,
        ack: Option<Packet>,
    },
    /// Already seen: do not deliver again, but re-send `ack` if any.
    Duplicate {
        channel: Channel,
        seq: u32,
        ack: Option<Packet>,
    },
    /// First sighting in ordered mode: held until its turn, see
    /// [`ReceiveState::ready`].
    Buffered { seq: u32, ack: Option<Packet> },
    /// First sighting in ordered mode, but delivery already skipped past it.
    Late { seq: u32, ack: Option<Packet> },
    /// An ACK reached a pure receiver.
    AckIgnored { seq: u32 },
    Malformed(PacketError),
}

impl Inbound {
    /// The ACK to put on the wire, if this datagram calls for one.
    pub fn ack(&self) -> Option<&Packet> {
        match self {
            Inbound::Delivered { ack, .. }
            | Inbound::Duplicate { ack, .. }
            | Inbound::Buffered { ack, .. }
            | Inbound::Late { ack, .. } => ack.as_ref(),
            _ => None,
        }
    }
}

/// In-order release of reliable payloads.
///
/// Payloads wait in `held` until every lower sequence number has been
/// released.  When a gap has blocked delivery for `gap_timeout`, the buffer
/// gives up on the missing numbers and jumps to the lowest held one.
/// Timestamps are µs since epoch, like [`Delivery::arrival_time`].
#[derive(Debug)]
pub struct ReorderBuffer {
    next: u32,
    held: BTreeMap<u32, Delivery>,
    gap_since: Option<u64>,
    gap_timeout_us: u64,
}

impl ReorderBuffer {
    pub fn new(gap_timeout: Duration) -> Self {
        Self {
            next: 0,
            held: BTreeMap::new(),
            gap_since: None,
            gap_timeout_us: u64::try_from(gap_timeout.as_micros()).unwrap_or(u64::MAX),
        }
    }

    /// Hold `delivery` for release.  Returns `false` if its sequence
    /// number was already skipped.
    pub fn push(&mut self, delivery: Delivery) -> bool {
        if delivery.seq < self.next {
            return false;
        }
        self.held.insert(delivery.seq, delivery);
        true
    }

    /// Release everything that is now in order at time `now`.
    pub fn ready(&mut self, now: u64) -> Vec<Delivery> {
        let mut out = Vec::new();
        loop {
            while let Some(d) = self.held.remove(&self.next) {
                self.next = self.next.wrapping_add(1);
                out.push(d);
            }

            let Some((&lowest, _)) = self.held.first_key_value() else {
                self.gap_since = None;
                return out;
            };
            if !out.is_empty() {
                // Progress restarts the clock for the next gap.
                self.gap_since = Some(now);
                return out;
            }
            match self.gap_since {
                Some(since) if now.saturating_sub(since) > self.gap_timeout_us => {
                    log::debug!("[receiver] skipping missing seq {}..{lowest}", self.next);
                    self.next = lowest;
                    self.gap_since = None;
                }
                Some(_) => return out,
                None => {
                    self.gap_since = Some(now);
                    return out;
                }
            }
        }
    }

    /// Next sequence number owed to the application.
    pub fn next_expected(&self) -> u32 {
        self.next
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }
}

/// Receiver-side protocol state for one run.
#[derive(Debug)]
pub struct ReceiveState {
    windows: [DedupWindow; 2],
    reorder: Option<ReorderBuffer>,
    pub metrics: ReceiverMetrics,
}

impl ReceiveState {
    pub fn new(config: &ReceiverConfig) -> Self {
        Self {
            windows: [
                DedupWindow::new(config.dedup_window),
                DedupWindow::new(config.dedup_window),
            ],
            reorder: config
                .ordered_reliable
                .then(|| ReorderBuffer::new(config.gap_timeout)),
            metrics: ReceiverMetrics::new(config.latency_samples),
        }
    }

    /// Process one raw datagram that arrived at `arrival` (µs since epoch).
    pub fn on_datagram(&mut self, bytes: &[u8], arrival: u64) -> Inbound {
        let pkt = match Packet::decode(bytes) {
            Ok(p) => p,
            Err(e) => {
                self.metrics.on_decode_error();
                return Inbound::Malformed(e);
            }
        };
        let h = pkt.header;

        if h.kind == Kind::Ack {
            self.metrics.on_ack_ignored();
            return Inbound::AckIgnored { seq: h.seq };
        }

        // ACK every reliable DATA packet, first sighting or not, so a lost
        // ACK is repaired by the sender's retransmission.
        let ack = (h.channel == Channel::Reliable).then(|| {
            self.metrics.on_ack_sent();
            Packet::ack(h.seq, arrival)
        });

        if !self.windows[h.channel.index()].insert(h.seq) {
            self.metrics.on_duplicate(h.channel);
            return Inbound::Duplicate {
                channel: h.channel,
                seq: h.seq,
                ack,
            };
        }

        let latency_ms = (h.channel == Channel::Unreliable)
            .then(|| (i128::from(arrival) - i128::from(h.send_time)) as f64 / 1000.0);
        self.metrics
            .on_delivered(h.channel, pkt.payload.len(), latency_ms);

        let delivery = Delivery {
            channel: h.channel,
            seq: h.seq,
            payload: pkt.payload,
            send_time: h.send_time,
            arrival_time: arrival,
            latency_ms,
        };
        match (&mut self.reorder, h.channel) {
            (Some(reorder), Channel::Reliable) => {
                if reorder.push(delivery) {
                    Inbound::Buffered { seq: h.seq, ack }
                } else {
                    Inbound::Late { seq: h.seq, ack }
                }
            }
            _ => Inbound::Delivered { delivery, ack },
        }
    }

    /// Reliable payloads whose turn has come (ordered mode only).
    pub fn ready(&mut self, now: u64) -> Vec<Delivery> {
        match &mut self.reorder {
            Some(reorder) => reorder.ready(now),
            None => Vec::new(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn window(&self, channel: Channel) -> &DedupWindow {
        &self.windows[channel.index()]
    }
}

// ---------------------------------------------------------------------------
// Receiver (async transport)
// ---------------------------------------------------------------------------

/// Lazy, finite stream of delivered payloads.
///
/// Ends (returns `None`) once the receiver has shut down and every queued
/// delivery has been read.  It cannot be restarted.
pub struct Deliveries {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Deliveries {
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

/// A running receiver transport.
pub struct Receiver {
    socket: Arc<Socket>,
    state: Arc<Mutex<ReceiveState>>,
    shutdown: broadcast::Sender<()>,
    snapshots: watch::Receiver<MetricsSnapshot>,
    deliveries: Option<Deliveries>,
    tasks: Vec<JoinHandle<Result<(), TransportError>>>,
}

impl Receiver {
    /// Take ownership of a bound socket and spawn the receive and snapshot
    /// loops.  Must be called inside a tokio runtime.
    pub fn start(socket: Socket, config: ReceiverConfig) -> Result<Self, TransportError> {
        config.validate()?;

        let socket = Arc::new(socket);
        let state = Arc::new(Mutex::new(ReceiveState::new(&config)));
        let (shutdown, _) = broadcast::channel(1);
        let (delivery_tx, rx) = mpsc::unbounded_channel();
        let initial = lock(&state).snapshot();
        let (snapshot_tx, snapshots) = watch::channel(initial);

        log::info!(
            "[receiver] listening on {} (dedup_window={} ordered={})",
            socket.local_addr,
            config.dedup_window,
            config.ordered_reliable
        );

        let recv_task = tokio::spawn(recv_loop(
            RecvLoop {
                socket: Arc::clone(&socket),
                state: Arc::clone(&state),
                deliveries: delivery_tx,
                max_io_errors: config.max_io_errors,
                reorder_tick: config
                    .ordered_reliable
                    .then(|| (config.gap_timeout / 4).max(Duration::from_millis(1))),
            },
            shutdown.subscribe(),
        ));
        let snapshot_task = tokio::spawn(snapshot_loop(
            Arc::clone(&state),
            snapshot_tx,
            config.snapshot_interval,
            shutdown.subscribe(),
        ));

        Ok(Self {
            socket,
            state,
            shutdown,
            snapshots,
            deliveries: Some(Deliveries { rx }),
            tasks: vec![recv_task, snapshot_task],
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.socket.local_addr
    }

    /// Take the delivery stream.  Only the first call succeeds.
    pub fn poll(&mut self) -> Result<Deliveries, TransportError> {
        self.deliveries.take().ok_or(TransportError::Closed)
    }

    /// Most recent periodic snapshot.
    pub fn latest_snapshot(&self) -> MetricsSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Stop both loops and return the final snapshot.
    pub async fn shutdown(self) -> Result<MetricsSnapshot, TransportError> {
        let _ = self.shutdown.send(());

        let mut first_err = None;
        for task in self.tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(join) => log::error!("[receiver] background task panicked: {join}"),
            }
        }

        let mut state = lock(&self.state);
        state.metrics.stop();
        let snapshot = state.snapshot();
        drop(state);

        match first_err {
            Some(e) => Err(e),
            None => Ok(snapshot),
        }
    }
}

fn lock(state: &Mutex<ReceiveState>) -> MutexGuard<'_, ReceiveState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

struct RecvLoop {
    socket: Arc<Socket>,
    state: Arc<Mutex<ReceiveState>>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    max_io_errors: u32,
    /// Gap-skip check period; `None` when reliable delivery is unordered.
    reorder_tick: Option<Duration>,
}

async fn recv_loop(ctx: RecvLoop, mut shutdown: broadcast::Receiver<()>) -> Result<(), TransportError> {
    let RecvLoop {
        socket,
        state,
        deliveries,
        max_io_errors,
        reorder_tick,
    } = ctx;
    let mut recv_budget = ErrorBudget::new(max_io_errors);
    // Separate from the receive side: a healthy inbound path must not mask
    // an ACK path that keeps failing.
    let mut ack_budget = ErrorBudget::new(max_io_errors);
    let ordered = reorder_tick.is_some();
    let mut ticker = tokio::time::interval(reorder_tick.unwrap_or(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let release = |now: u64| {
        let ready = lock(&state).ready(now);
        for d in ready {
            log::debug!("[receiver] <- {} seq={} (in order)", d.channel, d.seq);
            let _ = deliveries.send(d);
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            _ = ticker.tick(), if ordered => release(now_micros()),

            result = socket.recv_raw() => {
                let (bytes, from) = match result {
                    Ok(v) => {
                        recv_budget.success();
                        v
                    }
                    Err(e) => {
                        log::warn!("[receiver] recv failed: {e}");
                        if let Err(fatal) = recv_budget.failure() {
                            log::error!("[receiver] receive loop aborted: {fatal}");
                            return Err(fatal);
                        }
                        continue;
                    }
                };

                let now = now_micros();
                let inbound = lock(&state).on_datagram(&bytes, now);

                // ACKs go back to whoever relayed the datagram: the sender
                // itself, or the emulator in front of it.
                if let Some(ack) = inbound.ack() {
                    match socket.send_to(ack, from).await {
                        Ok(()) => ack_budget.success(),
                        Err(e) => {
                            log::warn!("[receiver] ACK seq={} to {from} failed: {e}", ack.header.seq);
                            if let Err(fatal) = ack_budget.failure() {
                                log::error!("[receiver] ACK path aborted: {fatal}");
                                return Err(fatal);
                            }
                        }
                    }
                }

                match inbound {
                    Inbound::Delivered { delivery, .. } => {
                        log::debug!(
                            "[receiver] <- {} seq={} len={}",
                            delivery.channel,
                            delivery.seq,
                            delivery.payload.len()
                        );
                        // The application may have stopped listening.
                        let _ = deliveries.send(delivery);
                    }
                    Inbound::Buffered { .. } => release(now),
                    Inbound::Late { seq, .. } => {
                        log::debug!("[receiver] seq={seq} arrived after its gap was skipped");
                    }
                    Inbound::Duplicate { channel, seq, .. } => {
                        log::debug!("[receiver] duplicate {channel} seq={seq} suppressed");
                    }
                    Inbound::AckIgnored { seq } => {
                        log::debug!("[receiver] ignoring ACK seq={seq}");
                    }
                    Inbound::Malformed(e) => {
                        log::warn!("[receiver] dropping malformed datagram from {from}: {e}");
                    }
                }
            }
        }
    }
    Ok(())
}

async fn snapshot_loop(
    state: Arc<Mutex<ReceiveState>>,
    snapshots: watch::Sender<MetricsSnapshot>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), TransportError> {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            _ = interval.tick() => {
                let snap = lock(&state).snapshot();
                log::debug!(
                    "[receiver] snapshot: reliable={} unreliable={} decode_errors={}",
                    snap.reliable.packets,
                    snap.unreliable.packets,
                    snap.decode_errors
                );
                let _ = snapshots.send(snap);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_DEDUP_WINDOW;

    fn state() -> ReceiveState {
        ReceiveState::new(&ReceiverConfig::default())
    }

    fn data(channel: Channel, seq: u32, send_time: u64, payload: &[u8]) -> Vec<u8> {
        Packet::data(channel, seq, send_time, payload.to_vec()).encode()
    }

    #[test]
    fn window_reports_first_sighting_only() {
        let mut w = DedupWindow::new(4);
        assert!(w.insert(7));
        assert!(!w.insert(7));
        assert!(w.contains(7));
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn window_is_bounded() {
        let mut w = DedupWindow::new(3);
        for seq in 0..10 {
            w.insert(seq);
        }
        assert_eq!(w.len(), 3);
        assert!(w.contains(9));
        // Sequence numbers that fell out of the tracked range stay seen.
        assert!(w.contains(0));
        assert!(!w.insert(0));
    }

    #[test]
    fn late_retransmission_after_a_full_window_is_not_redelivered() {
        let mut s = state();
        let first = data(Channel::Reliable, 0, 0, b"zero");
        assert!(matches!(s.on_datagram(&first, 0), Inbound::Delivered { .. }));
        for seq in 1..=DEFAULT_DEDUP_WINDOW as u32 {
            s.on_datagram(&data(Channel::Reliable, seq, 0, b"r"), 0);
        }

        let again = s.on_datagram(&first, 1);
        assert!(matches!(again, Inbound::Duplicate { seq: 0, .. }));
        assert_eq!(again.ack().unwrap().header.seq, 0);
        assert_eq!(s.window(Channel::Reliable).len(), DEFAULT_DEDUP_WINDOW);
    }

    #[test]
    fn window_tracks_gaps_below_the_high_water_mark() {
        let mut w = DedupWindow::new(8);
        assert!(w.insert(5));
        assert!(!w.contains(3));
        assert!(w.insert(3));
        assert!(!w.insert(3));
    }

    #[test]
    fn window_handles_out_of_order_arrival() {
        let mut w = DedupWindow::new(16);
        for seq in [5, 1, 9, 3, 1, 5] {
            w.insert(seq);
        }
        assert_eq!(w.len(), 4);
    }

    #[test]
    fn reliable_first_sighting_delivers_and_acks() {
        let mut s = state();
        let inbound = s.on_datagram(&data(Channel::Reliable, 3, 100, b"hit"), 200);

        let Inbound::Delivered { delivery, ack } = inbound else {
            panic!("expected delivery, got {inbound:?}");
        };
        assert_eq!(delivery.payload, b"hit");
        assert_eq!(delivery.latency_ms, None);
        let ack = ack.unwrap();
        assert_eq!(ack.header.kind, Kind::Ack);
        assert_eq!(ack.header.seq, 3);
        assert!(ack.payload.is_empty());
    }

    #[test]
    fn duplicate_reliable_is_acked_but_not_redelivered() {
        let mut s = state();
        let bytes = data(Channel::Reliable, 9, 0, b"once");

        let first = s.on_datagram(&bytes, 10);
        let second = s.on_datagram(&bytes, 20);

        assert!(matches!(first, Inbound::Delivered { .. }));
        assert!(matches!(second, Inbound::Duplicate { seq: 9, .. }));
        assert_eq!(first.ack().unwrap().header.seq, 9);
        assert_eq!(second.ack().unwrap().header.seq, 9);

        let snap = s.snapshot();
        assert_eq!(snap.reliable.packets, 1);
        assert_eq!(snap.reliable.duplicates, 1);
        assert_eq!(snap.acks_sent, 2);
    }

    #[test]
    fn unreliable_delivers_without_ack_and_measures_latency() {
        let mut s = state();
        let inbound = s.on_datagram(&data(Channel::Unreliable, 0, 1_000_000, b"pos"), 1_012_500);
        assert!(inbound.ack().is_none());
        let Inbound::Delivered { delivery, .. } = inbound else {
            panic!("expected delivery");
        };
        assert_eq!(delivery.latency_ms, Some(12.5));

        let dup = s.on_datagram(&data(Channel::Unreliable, 0, 1_000_000, b"pos"), 1_013_000);
        assert!(matches!(dup, Inbound::Duplicate { ack: None, .. }));
    }

    #[test]
    fn channels_have_independent_windows() {
        let mut s = state();
        assert!(matches!(
            s.on_datagram(&data(Channel::Reliable, 1, 0, b""), 0),
            Inbound::Delivered { .. }
        ));
        assert!(matches!(
            s.on_datagram(&data(Channel::Unreliable, 1, 0, b""), 0),
            Inbound::Delivered { .. }
        ));
    }

    #[test]
    fn malformed_datagrams_are_counted_not_fatal() {
        let mut s = state();
        assert!(matches!(
            s.on_datagram(&[1, 2, 3], 0),
            Inbound::Malformed(PacketError::TooShort { len: 3 })
        ));
        let mut bad = data(Channel::Reliable, 0, 0, b"");
        bad[0] = 7;
        assert!(matches!(s.on_datagram(&bad, 0), Inbound::Malformed(_)));
        assert_eq!(s.metrics.snapshot().decode_errors, 2);
    }

    #[test]
    fn ack_reaching_receiver_is_ignored() {
        let mut s = state();
        let inbound = s.on_datagram(&Packet::ack(4, 0).encode(), 0);
        assert_eq!(inbound, Inbound::AckIgnored { seq: 4 });
        assert_eq!(s.metrics.snapshot().acks_ignored, 1);
    }

    #[test]
    fn constant_transit_keeps_jitter_at_zero() {
        let mut s = state();
        for seq in 0..50u32 {
            let sent = u64::from(seq) * 10_000;
            s.on_datagram(&data(Channel::Unreliable, seq, sent, b"x"), sent + 5_000);
        }
        let snap = s.snapshot();
        assert_eq!(snap.unreliable.jitter_ms, Some(0.0));
        assert_eq!(snap.unreliable.latency_p50_ms, Some(5.0));
    }

    #[test]
    fn reordered_stream_delivers_each_seq_once() {
        let mut s = state();
        let order = [3u32, 0, 2, 2, 1, 0, 4, 3];
        let delivered = order
            .iter()
            .filter(|&&seq| {
                matches!(
                    s.on_datagram(&data(Channel::Reliable, seq, 0, b"r"), 0),
                    Inbound::Delivered { .. }
                )
            })
            .count();
        assert_eq!(delivered, 5);
    }

    fn delivery(seq: u32) -> Delivery {
        Delivery {
            channel: Channel::Reliable,
            seq,
            payload: vec![seq as u8],
            send_time: 0,
            arrival_time: 0,
            latency_ms: None,
        }
    }

    fn seqs(ds: &[Delivery]) -> Vec<u32> {
        ds.iter().map(|d| d.seq).collect()
    }

    const MS: u64 = 1_000;

    #[test]
    fn reorder_buffer_releases_in_sequence_order() {
        let mut r = ReorderBuffer::new(Duration::from_millis(200));
        assert!(r.push(delivery(1)));
        assert!(r.push(delivery(2)));
        assert!(r.ready(0).is_empty());
        assert_eq!(r.held(), 2);

        assert!(r.push(delivery(0)));
        assert_eq!(seqs(&r.ready(MS)), [0, 1, 2]);
        assert_eq!(r.next_expected(), 3);
        assert_eq!(r.held(), 0);
    }

    #[test]
    fn reorder_buffer_skips_a_gap_after_the_timeout() {
        let mut r = ReorderBuffer::new(Duration::from_millis(200));
        r.push(delivery(1));
        r.push(delivery(3));
        assert!(r.ready(0).is_empty());
        assert!(r.ready(100 * MS).is_empty());

        // Seq 0 never shows up: give up on it, release 1, then wait on 2.
        assert_eq!(seqs(&r.ready(250 * MS)), [1]);
        assert_eq!(r.next_expected(), 2);
        assert!(r.ready(400 * MS).is_empty());
        assert_eq!(seqs(&r.ready(500 * MS)), [3]);
        assert_eq!(r.next_expected(), 4);
    }

    #[test]
    fn reorder_buffer_refuses_skipped_seqs() {
        let mut r = ReorderBuffer::new(Duration::from_millis(10));
        r.push(delivery(2));
        r.ready(0);
        assert_eq!(seqs(&r.ready(20 * MS)), [2]);
        assert!(!r.push(delivery(0)));
        assert!(!r.push(delivery(1)));
        assert_eq!(r.held(), 0);
    }

    #[test]
    fn ordered_mode_buffers_reliable_and_passes_unreliable_through() {
        let mut s = ReceiveState::new(&ReceiverConfig {
            ordered_reliable: true,
            gap_timeout: Duration::from_millis(200),
            ..ReceiverConfig::default()
        });

        let early = s.on_datagram(&data(Channel::Reliable, 1, 0, b"one"), 0);
        assert!(matches!(early, Inbound::Buffered { seq: 1, .. }));
        assert_eq!(early.ack().unwrap().header.seq, 1);
        assert!(s.ready(0).is_empty());

        assert!(matches!(
            s.on_datagram(&data(Channel::Unreliable, 0, 0, b"u"), 0),
            Inbound::Delivered { .. }
        ));

        s.on_datagram(&data(Channel::Reliable, 0, 0, b"zero"), MS);
        let out = s.ready(MS);
        assert_eq!(seqs(&out), [0, 1]);
        assert_eq!(out[0].payload, b"zero");
        assert_eq!(s.snapshot().reliable.packets, 2);
    }

    #[test]
    fn ordered_mode_acks_a_seq_that_arrives_after_its_gap_was_skipped() {
        let mut s = ReceiveState::new(&ReceiverConfig {
            ordered_reliable: true,
            gap_timeout: Duration::from_millis(200),
            ..ReceiverConfig::default()
        });
        s.on_datagram(&data(Channel::Reliable, 1, 0, b"one"), 0);
        s.ready(0);
        assert_eq!(seqs(&s.ready(300 * MS)), [1]);

        let late = s.on_datagram(&data(Channel::Reliable, 0, 0, b"zero"), 301 * MS);
        assert!(matches!(late, Inbound::Late { seq: 0, .. }));
        assert_eq!(late.ack().unwrap().header.seq, 0);
        assert!(s.ready(302 * MS).is_empty());
    }
}
