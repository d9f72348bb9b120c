//! Wire-format definitions for H-UDP datagrams.
//!
//! Every datagram exchanged between peers is a [`Packet`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (channel, kind, sequence, timestamp).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`], returning a
//!   [`PacketError`] for malformed or truncated input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Channel    |     Kind      |       Sequence Number ...     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  ... Sequence |          Send Time (µs since UNIX epoch) ...  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        ... Send Time ...                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  ... Send Time                |          Payload ...          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 14 bytes.
//! channel(1) + kind(1) + seq(4) + send_time(8)
//!
//! There is no length field: the payload runs to the end of the datagram,
//! so UDP's own message boundaries delimit it.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 14;

// Byte offsets of each field within the serialised header.
const OFF_CHANNEL: usize = 0;
const OFF_KIND: usize = 1;
const OFF_SEQ: usize = 2;
const OFF_SEND_TIME: usize = 6;

/// Delivery mode a packet travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// Acknowledged and retransmitted until delivered or failed.
    Reliable = 0,
    /// Fire-and-forget.
    Unreliable = 1,
}

impl Channel {
    /// Both channels, in wire-value order.
    pub const ALL: [Channel; 2] = [Channel::Reliable, Channel::Unreliable];

    /// Stable index for per-channel arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Channel::Reliable => "reliable",
            Channel::Unreliable => "unreliable",
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = PacketError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0 => Ok(Channel::Reliable),
            1 => Ok(Channel::Unreliable),
            other => Err(PacketError::UnknownChannel(other)),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What a packet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    /// Application payload.
    Data = 0,
    /// Acknowledgement of the reliable DATA packet named by `seq`.
    Ack = 1,
}

impl TryFrom<u8> for Kind {
    type Error = PacketError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0 => Ok(Kind::Data),
            1 => Ok(Kind::Ack),
            other => Err(PacketError::UnknownKind(other)),
        }
    }
}

/// Fixed-size protocol header.
///
/// Fields are in host byte order; [`Packet::encode`] converts to big-endian
/// on the wire and [`Packet::decode`] converts back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub channel: Channel,
    pub kind: Kind,
    /// Per-channel DATA sequence number, or the acknowledged sequence for
    /// an ACK.
    pub seq: u32,
    /// Sender wall clock at first transmission, microseconds since the
    /// UNIX epoch.  Retransmissions carry the original value.
    pub send_time: u64,
}

/// A complete protocol datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a DATA packet.
    pub fn data(channel: Channel, seq: u32, send_time: u64, payload: Vec<u8>) -> Self {
        Packet {
            header: Header {
                channel,
                kind: Kind::Data,
                seq,
                send_time,
            },
            payload,
        }
    }

    /// Build an ACK for reliable sequence `seq`.  ACKs carry no payload.
    pub fn ack(seq: u32, send_time: u64) -> Self {
        Packet {
            header: Header {
                channel: Channel::Reliable,
                kind: Kind::Ack,
                seq,
                send_time,
            },
            payload: Vec::new(),
        }
    }

    /// Serialise this packet into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];

        buf[OFF_CHANNEL] = self.header.channel as u8;
        buf[OFF_KIND] = self.header.kind as u8;
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.header.seq.to_be_bytes());
        buf[OFF_SEND_TIME..OFF_SEND_TIME + 8]
            .copy_from_slice(&self.header.send_time.to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        buf
    }

    /// Parse a [`Packet`] from a raw datagram.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the channel or kind byte is outside its enum, or
    /// - an ACK claims the unreliable channel.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::TooShort { len: buf.len() });
        }

        let channel = Channel::try_from(buf[OFF_CHANNEL])?;
        let kind = Kind::try_from(buf[OFF_KIND])?;
        if kind == Kind::Ack && channel != Channel::Reliable {
            return Err(PacketError::AckOnUnreliable);
        }

        let mut seq = [0u8; 4];
        seq.copy_from_slice(&buf[OFF_SEQ..OFF_SEQ + 4]);
        let mut send_time = [0u8; 8];
        send_time.copy_from_slice(&buf[OFF_SEND_TIME..OFF_SEND_TIME + 8]);

        Ok(Packet {
            header: Header {
                channel,
                kind,
                seq: u32::from_be_bytes(seq),
                send_time: u64::from_be_bytes(send_time),
            },
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Reasons a datagram is rejected as malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("datagram of {len} bytes is shorter than the {HEADER_LEN}-byte header")]
    TooShort { len: usize },
    #[error("unknown channel byte {0:#04x}")]
    UnknownChannel(u8),
    #[error("unknown kind byte {0:#04x}")]
    UnknownKind(u8),
    #[error("ACK packets are only valid on the reliable channel")]
    AckOnUnreliable,
}

/// Current wall-clock time in microseconds since the UNIX epoch.
///
/// Used for the `send_time` header field.  A clock set before 1970 reads
/// as zero rather than failing.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let pkt = Packet::data(Channel::Reliable, 42, 1_700_000_000_123_456, b"hello".to_vec());
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn ack_roundtrip_has_empty_payload() {
        let pkt = Packet::ack(7, 99);
        let bytes = pkt.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.header.kind, Kind::Ack);
        assert_eq!(decoded.header.seq, 7);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn roundtrip_across_field_extremes() {
        for channel in Channel::ALL {
            for seq in [0, 1, u32::MAX] {
                for send_time in [0, u64::MAX] {
                    let pkt = Packet::data(channel, seq, send_time, vec![0xAB; 3]);
                    assert_eq!(Packet::decode(&pkt.encode()).unwrap(), pkt);
                }
            }
        }
    }

    #[test]
    fn decode_empty_buffer_returns_error() {
        assert_eq!(Packet::decode(&[]), Err(PacketError::TooShort { len: 0 }));
    }

    #[test]
    fn decode_short_header_returns_error() {
        assert_eq!(
            Packet::decode(&[0u8; HEADER_LEN - 1]),
            Err(PacketError::TooShort { len: HEADER_LEN - 1 })
        );
    }

    #[test]
    fn decode_unknown_channel_returns_error() {
        let mut bytes = Packet::data(Channel::Unreliable, 1, 1, vec![]).encode();
        bytes[OFF_CHANNEL] = 9;
        assert_eq!(Packet::decode(&bytes), Err(PacketError::UnknownChannel(9)));
    }

    #[test]
    fn decode_unknown_kind_returns_error() {
        let mut bytes = Packet::data(Channel::Reliable, 1, 1, vec![]).encode();
        bytes[OFF_KIND] = 0xff;
        assert_eq!(Packet::decode(&bytes), Err(PacketError::UnknownKind(0xff)));
    }

    #[test]
    fn decode_ack_on_unreliable_returns_error() {
        let mut bytes = Packet::ack(3, 0).encode();
        bytes[OFF_CHANNEL] = Channel::Unreliable as u8;
        assert_eq!(Packet::decode(&bytes), Err(PacketError::AckOnUnreliable));
    }

    #[test]
    fn header_len_constant_is_correct() {
        // channel(1) + kind(1) + seq(4) + send_time(8) = 14
        assert_eq!(HEADER_LEN, 14);
    }

    #[test]
    fn encoded_length_equals_header_plus_payload() {
        let payload = b"exactly twelve!";
        let bytes = Packet::data(Channel::Unreliable, 0, 0, payload.to_vec()).encode();
        assert_eq!(bytes.len(), HEADER_LEN + payload.len());
    }

    #[test]
    fn seq_and_time_big_endian_on_wire() {
        let bytes =
            Packet::data(Channel::Reliable, 0x0102_0304, 0x1112_1314_1516_1718, vec![]).encode();
        assert_eq!(&bytes[OFF_SEQ..OFF_SEQ + 4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(
            &bytes[OFF_SEND_TIME..OFF_SEND_TIME + 8],
            &[0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18]
        );
    }

    #[test]
    fn now_micros_is_after_2020() {
        // 2020-01-01T00:00:00Z in microseconds.
        assert!(now_micros() > 1_577_836_800_000_000);
    }
}
