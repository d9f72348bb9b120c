//! Packet delivery ratio (PDR) reconciliation.
//!
//! Neither side can compute PDR alone: the sender knows how many distinct
//! messages it put on each channel, the receiver knows how many distinct
//! ones arrived.  This module joins the two exported snapshots.
//!
//! ```text
//!   PDR(channel) = receiver.packets / sender.packets
//! ```
//!
//! The result is `None` ("NA") whenever the two figures cannot be compared:
//! no sends on the channel, a missing or unreadable peer snapshot, or a
//! snapshot with an unknown format version.

use std::fs;
use std::path::Path;

use crate::error::TransportError;
use crate::metrics::{MetricsSnapshot, Role, SNAPSHOT_VERSION};
use crate::packet::Channel;

/// Per-channel delivery ratios, each in `[0, 1]` when available.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PdrReport {
    pub reliable: Option<f64>,
    pub unreliable: Option<f64>,
}

impl PdrReport {
    pub fn get(&self, channel: Channel) -> Option<f64> {
        match channel {
            Channel::Reliable => self.reliable,
            Channel::Unreliable => self.unreliable,
        }
    }

    /// Write the ratios into `snapshot` so they show up in its summary
    /// table and JSON export.
    pub fn apply(&self, snapshot: &mut MetricsSnapshot) {
        for channel in Channel::ALL {
            snapshot.channel_mut(channel).pdr = self.get(channel);
        }
    }
}

/// Compute PDR from a sender and a receiver snapshot.
pub fn reconcile(sender: &MetricsSnapshot, receiver: &MetricsSnapshot) -> PdrReport {
    let ratio = |channel: Channel| -> Option<f64> {
        let sent = sender.channel(channel).packets;
        let received = receiver.channel(channel).packets;
        if sent == 0 {
            return None;
        }
        let pdr = received as f64 / sent as f64;
        if pdr > 1.0 {
            // Receiver saw more distinct messages than were sent: the two
            // snapshots are not from the same run.
            log::warn!(
                "[aggregate] {channel}: received {received} > sent {sent}, clamping PDR to 1"
            );
            return Some(1.0);
        }
        Some(pdr)
    };

    PdrReport {
        reliable: ratio(Channel::Reliable),
        unreliable: ratio(Channel::Unreliable),
    }
}

/// Reconcile two snapshots given in either order.
///
/// Returns an all-`None` report if the pair is not one sender plus one
/// receiver, or if either snapshot has an unsupported version.
pub fn reconcile_pair(a: &MetricsSnapshot, b: &MetricsSnapshot) -> PdrReport {
    for s in [a, b] {
        if s.version != SNAPSHOT_VERSION {
            log::warn!(
                "[aggregate] {:?} snapshot has version {}, expected {SNAPSHOT_VERSION}",
                s.role,
                s.version
            );
            return PdrReport::default();
        }
    }
    match (a.role, b.role) {
        (Role::Sender, Role::Receiver) => reconcile(a, b),
        (Role::Receiver, Role::Sender) => reconcile(b, a),
        (role, _) => {
            log::warn!("[aggregate] both snapshots have role {role:?}, PDR unavailable");
            PdrReport::default()
        }
    }
}

/// Read a snapshot exported by [`MetricsSnapshot::to_json`].
pub fn load_snapshot(path: &Path) -> Result<MetricsSnapshot, TransportError> {
    let text = fs::read_to_string(path)
        .map_err(|e| TransportError::Snapshot(format!("{}: {e}", path.display())))?;
    MetricsSnapshot::from_json(&text)
}

/// Reconcile `local` against the peer snapshot stored at `path`.
///
/// A missing or malformed peer file is not an error: the report comes back
/// unavailable and a warning is logged.
pub fn reconcile_with_peer_file(local: &MetricsSnapshot, path: &Path) -> PdrReport {
    match load_snapshot(path) {
        Ok(peer) => reconcile_pair(local, &peer),
        Err(e) => {
            log::warn!("[aggregate] peer snapshot unavailable, PDR reported as NA: {e}");
            PdrReport::default()
        }
    }
}
