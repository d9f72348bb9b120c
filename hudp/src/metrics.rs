//! Per-channel delivery metrics and their exported snapshot form.
//!
//! Sender and receiver each keep their own counters ([`SenderMetrics`],
//! [`ReceiverMetrics`]); nothing is shared between processes.  At the end of
//! a run (and periodically on the receiver) the live counters are frozen
//! into a [`MetricsSnapshot`], which is what gets exported as JSON and fed
//! to [`crate::aggregate::reconcile`].
//!
//! Latencies are kept in milliseconds as `f64`.
//!
//! | Metric             | Sender                         | Receiver                    |
//! |--------------------|--------------------------------|-----------------------------|
//! | packets / bytes    | sent (first transmission only) | delivered to the app        |
//! | retransmissions    | reliable resends               | -                           |
//! | latency p50 / p95  | reliable: (ACK − first send)/2 | unreliable: arrival − send  |
//! | jitter             | -                              | unreliable: RFC 3550        |

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::packet::Channel;

/// Version stamped into every exported snapshot.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Default capacity of a [`LatencyRing`].
pub const DEFAULT_LATENCY_SAMPLES: usize = 4096;

// ---------------------------------------------------------------------------
// Latency samples
// ---------------------------------------------------------------------------

/// Fixed-size ring of the most recent latency samples.
#[derive(Debug, Clone)]
pub struct LatencyRing {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl LatencyRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest when full.
    pub fn push(&mut self, ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// `q`-th percentile of the retained samples; `None` when empty.
    pub fn percentile(&self, q: f64) -> Option<f64> {
        let v: Vec<f64> = self.samples.iter().copied().collect();
        percentile(&v, q)
    }
}

/// Percentile over an unsorted sample set.
///
/// The 50th percentile is the true median (mean of the two middle values
/// for an even count).  Any other `q` picks index `floor(q/100 · (n−1))`
/// of the sorted samples.
pub fn percentile(samples: &[f64], q: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();

    if q == 50.0 {
        let mid = n / 2;
        return Some(if n % 2 == 1 {
            sorted[mid]
        } else {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        });
    }
    let idx = ((q / 100.0) * (n - 1) as f64).floor().max(0.0) as usize;
    Some(sorted[idx.min(n - 1)])
}

// ---------------------------------------------------------------------------
// Jitter
// ---------------------------------------------------------------------------

/// RFC 3550 §6.4.1 inter-arrival jitter estimator.
///
/// For consecutive transit times `S_{i-1}`, `S_i`:
/// `D = S_i − S_{i−1}`, `J += (|D| − J) / 16`.
///
/// Only differences of transit times are used, so a constant clock offset
/// between sender and receiver cancels out.
#[derive(Debug, Clone, Default)]
pub struct JitterEstimator {
    last_transit: Option<f64>,
    jitter: f64,
    samples: u64,
}

impl JitterEstimator {
    /// Fold one transit-time sample (ms) into the estimate.
    pub fn update(&mut self, transit_ms: f64) {
        if let Some(last) = self.last_transit {
            let d = (transit_ms - last).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit_ms);
        self.samples += 1;
    }

    /// Current estimate in ms; `None` before the first sample.
    pub fn value(&self) -> Option<f64> {
        (self.samples > 0).then_some(self.jitter)
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Plain per-channel counters.
#[derive(Debug, Clone, Default)]
pub struct ChannelCounters {
    pub packets: u64,
    pub bytes: u64,
    pub retransmissions: u64,
    pub failed: u64,
    pub duplicates: u64,
}

fn throughput(bytes: u64, secs: f64) -> f64 {
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}

/// Which side of the link produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

/// Outbound metrics owned by the sender transport.
#[derive(Debug, Clone)]
pub struct SenderMetrics {
    started: Instant,
    stopped: Option<Instant>,
    channels: [ChannelCounters; 2],
    reliable_latency: LatencyRing,
}

impl SenderMetrics {
    pub fn new(latency_samples: usize) -> Self {
        Self {
            started: Instant::now(),
            stopped: None,
            channels: Default::default(),
            reliable_latency: LatencyRing::new(latency_samples),
        }
    }

    /// A logical message went out for the first time.
    pub fn on_send(&mut self, channel: Channel, payload_len: usize) {
        let c = &mut self.channels[channel.index()];
        c.packets += 1;
        c.bytes += payload_len as u64;
    }

    pub fn on_retransmit(&mut self) {
        self.channels[Channel::Reliable.index()].retransmissions += 1;
    }

    /// Record the halved-RTT latency of an acknowledged reliable message.
    pub fn on_delivered(&mut self, latency: Duration) {
        self.reliable_latency.push(latency.as_nanos() as f64 / 1e6);
    }

    pub fn on_failed(&mut self) {
        self.channels[Channel::Reliable.index()].failed += 1;
    }

    pub fn counters(&self, channel: Channel) -> &ChannelCounters {
        &self.channels[channel.index()]
    }

    pub fn stop(&mut self) {
        self.stopped.get_or_insert_with(Instant::now);
    }

    /// Freeze the counters.  `abandoned` is the number of reliable
    /// messages still pending.
    pub fn snapshot(&self, abandoned: u64) -> MetricsSnapshot {
        let secs = self
            .stopped
            .unwrap_or_else(Instant::now)
            .duration_since(self.started)
            .as_secs_f64();
        let mut snap = MetricsSnapshot::new(Role::Sender, secs);
        for ch in Channel::ALL {
            let c = &self.channels[ch.index()];
            let out = snap.channel_mut(ch);
            out.packets = c.packets;
            out.bytes = c.bytes;
            out.retransmissions = c.retransmissions;
            out.failed = c.failed;
            out.throughput_bytes_per_sec = throughput(c.bytes, secs);
        }
        snap.reliable.abandoned = abandoned;
        snap.reliable.latency_p50_ms = self.reliable_latency.percentile(50.0);
        snap.reliable.latency_p95_ms = self.reliable_latency.percentile(95.0);
        snap
    }
}

/// Inbound metrics owned by the receiver transport.
#[derive(Debug, Clone)]
pub struct ReceiverMetrics {
    started: Instant,
    stopped: Option<Instant>,
    channels: [ChannelCounters; 2],
    latency: LatencyRing,
    jitter: JitterEstimator,
    decode_errors: u64,
    acks_sent: u64,
    acks_ignored: u64,
}

impl ReceiverMetrics {
    pub fn new(latency_samples: usize) -> Self {
        Self {
            started: Instant::now(),
            stopped: None,
            channels: Default::default(),
            latency: LatencyRing::new(latency_samples),
            jitter: JitterEstimator::default(),
            decode_errors: 0,
            acks_sent: 0,
            acks_ignored: 0,
        }
    }

    /// A first-seen DATA packet was handed to the application.
    ///
    /// `transit_ms` is the one-way latency sample, present only for the
    /// unreliable channel.
    pub fn on_delivered(&mut self, channel: Channel, payload_len: usize, transit_ms: Option<f64>) {
        let c = &mut self.channels[channel.index()];
        c.packets += 1;
        c.bytes += payload_len as u64;
        if let Some(t) = transit_ms {
            self.latency.push(t);
            self.jitter.update(t);
        }
    }

    pub fn on_duplicate(&mut self, channel: Channel) {
        self.channels[channel.index()].duplicates += 1;
    }

    pub fn on_ack_sent(&mut self) {
        self.acks_sent += 1;
    }

    pub fn on_ack_ignored(&mut self) {
        self.acks_ignored += 1;
    }

    pub fn on_decode_error(&mut self) {
        self.decode_errors += 1;
    }

    pub fn counters(&self, channel: Channel) -> &ChannelCounters {
        &self.channels[channel.index()]
    }

    pub fn jitter(&self) -> Option<f64> {
        self.jitter.value()
    }

    pub fn stop(&mut self) {
        self.stopped.get_or_insert_with(Instant::now);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = self
            .stopped
            .unwrap_or_else(Instant::now)
            .duration_since(self.started)
            .as_secs_f64();
        let mut snap = MetricsSnapshot::new(Role::Receiver, secs);
        snap.decode_errors = self.decode_errors;
        snap.acks_sent = self.acks_sent;
        snap.acks_ignored = self.acks_ignored;
        for ch in Channel::ALL {
            let c = &self.channels[ch.index()];
            let out = snap.channel_mut(ch);
            out.packets = c.packets;
            out.bytes = c.bytes;
            out.duplicates = c.duplicates;
            out.throughput_bytes_per_sec = throughput(c.bytes, secs);
        }
        // Reliable latency is only ever measured at the sender.
        snap.unreliable.latency_p50_ms = self.latency.percentile(50.0);
        snap.unreliable.latency_p95_ms = self.latency.percentile(95.0);
        snap.unreliable.jitter_ms = self.jitter.value();
        snap
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Frozen per-channel figures.  Every field defaults so that a partially
/// populated export still parses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSnapshot {
    /// Sent (sender role) or delivered (receiver role) packets.
    pub packets: u64,
    pub bytes: u64,
    pub retransmissions: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub duplicates: u64,
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub throughput_bytes_per_sec: f64,
    /// Filled in by reconciliation.
    pub pdr: Option<f64>,
}

/// One role's exported metrics for a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub version: u32,
    pub role: Role,
    #[serde(default)]
    pub duration_secs: f64,
    #[serde(default)]
    pub decode_errors: u64,
    #[serde(default)]
    pub acks_sent: u64,
    #[serde(default)]
    pub acks_ignored: u64,
    #[serde(default)]
    pub reliable: ChannelSnapshot,
    #[serde(default)]
    pub unreliable: ChannelSnapshot,
}

impl MetricsSnapshot {
    pub fn new(role: Role, duration_secs: f64) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            role,
            duration_secs,
            decode_errors: 0,
            acks_sent: 0,
            acks_ignored: 0,
            reliable: ChannelSnapshot::default(),
            unreliable: ChannelSnapshot::default(),
        }
    }

    pub fn channel(&self, channel: Channel) -> &ChannelSnapshot {
        match channel {
            Channel::Reliable => &self.reliable,
            Channel::Unreliable => &self.unreliable,
        }
    }

    pub fn channel_mut(&mut self, channel: Channel) -> &mut ChannelSnapshot {
        match channel {
            Channel::Reliable => &mut self.reliable,
            Channel::Unreliable => &mut self.unreliable,
        }
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string_pretty(self).map_err(|e| TransportError::Snapshot(e.to_string()))
    }

    pub fn from_json(s: &str) -> Result<Self, TransportError> {
        serde_json::from_str(s).map_err(|e| TransportError::Snapshot(e.to_string()))
    }

    /// Human-readable per-channel table, `NA` for unavailable values.
    pub fn summary_table(&self) -> String {
        let mut out = String::new();
        match self.role {
            Role::Sender => {
                let _ = writeln!(out, "[sender] metrics summary:");
                let _ = writeln!(
                    out,
                    "  {:<11}{:>10}{:>12}{:>10}{:>8}{:>10}{:>10}{:>8}",
                    "channel", "sent", "bytes", "retrans", "failed", "p50(ms)", "p95(ms)", "pdr"
                );
                for ch in Channel::ALL {
                    let c = self.channel(ch);
                    let _ = writeln!(
                        out,
                        "  {:<11}{:>10}{:>12}{:>10}{:>8}{}{}{}",
                        ch.name(),
                        c.packets,
                        c.bytes,
                        c.retransmissions,
                        c.failed,
                        fmt_opt(c.latency_p50_ms, 10, 2),
                        fmt_opt(c.latency_p95_ms, 10, 2),
                        fmt_opt(c.pdr, 8, 3),
                    );
                }
            }
            Role::Receiver => {
                let _ = writeln!(out, "[receiver] metrics summary:");
                let _ = writeln!(
                    out,
                    "  {:<11}{:>10}{:>12}{:>10}{:>10}{:>12}{:>12}{:>8}",
                    "channel", "packets", "bytes", "p50(ms)", "p95(ms)", "jitter(ms)", "thr(B/s)",
                    "pdr"
                );
                for ch in Channel::ALL {
                    let c = self.channel(ch);
                    let _ = writeln!(
                        out,
                        "  {:<11}{:>10}{:>12}{}{}{}{:>12.1}{}",
                        ch.name(),
                        c.packets,
                        c.bytes,
                        fmt_opt(c.latency_p50_ms, 10, 2),
                        fmt_opt(c.latency_p95_ms, 10, 2),
                        fmt_opt(c.jitter_ms, 12, 3),
                        c.throughput_bytes_per_sec,
                        fmt_opt(c.pdr, 8, 3),
                    );
                }
                let _ = writeln!(
                    out,
                    "  decode_errors={} acks_sent={} acks_ignored={}",
                    self.decode_errors, self.acks_sent, self.acks_ignored
                );
            }
        }
        out
    }
}

fn fmt_opt(v: Option<f64>, width: usize, prec: usize) -> String {
    match v {
        Some(v) => format!("{v:>width$.prec$}"),
        None => format!("{:>width$}", "NA"),
    }
}
