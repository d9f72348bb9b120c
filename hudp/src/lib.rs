//! `hudp`: hybrid reliable / unreliable messaging over a single UDP flow.
//!
//! Every datagram carries a channel tag.  Reliable messages are ACKed and
//! selectively retransmitted until acknowledged or out of retries;
//! unreliable messages are fire-and-forget.  A loss/delay emulator can sit
//! between the two ends, and both ends export metrics snapshots that are
//! reconciled into a packet delivery ratio afterwards.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐   DATA (REL / UNREL)   ┌──────────┐   DATA   ┌──────────┐
//!  │  Sender  │───────────────────────▶│ Emulator │─────────▶│ Receiver │
//!  │          │◀───────────────────────│ loss     │◀─────────│  dedup   │
//!  └────┬─────┘          ACK           │ delay    │   ACK    └────┬─────┘
//!       │                              └──────────┘               │
//!       │ MetricsSnapshot                           MetricsSnapshot│
//!       └────────────────────▶ aggregate::reconcile ◀─────────────┘
//!                                    (PDR)
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]:    wire format (encode / decode)
//! - [`socket`]:    async UDP socket wrapper and error budget
//! - [`timer`]:     fixed or adaptive retransmission timeout
//! - [`config`]:    sender and receiver tunables
//! - [`sender`]:    outbound state machine plus ACK / retransmit loops
//! - [`receiver`]:  duplicate suppression, ACK generation, delivery
//! - [`emulator`]:  lossy, jittery UDP relay for testing
//! - [`metrics`]:   counters, latency percentiles, jitter, snapshots
//! - [`aggregate`]: PDR reconciliation of two snapshots
//! - [`error`]:     shared transport error type

pub mod aggregate;
pub mod config;
pub mod emulator;
pub mod error;
pub mod metrics;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod socket;
pub mod timer;
