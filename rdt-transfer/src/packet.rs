//! Wire-format definitions for protocol packets.
//!
//! Every unit exchanged between sender, emulator, and receiver is a
//! [`Packet`] of exactly [`PACKET_LEN`] bytes.  This module is responsible
//! for:
//! - Defining the fixed on-wire layout.
//! - Serialising a [`Packet`] into a byte array ready for a single write.
//! - Deserialising a raw byte slice back into a [`Packet`], returning errors
//!   for malformed or truncated input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All integers are 32-bit **little-endian**; the image matches the packed
//! struct layout on little-endian hosts.
//!
//! ```text
//!  offset   size   field
//!  ------   ----   -----------------------------------------
//!       0      4   PacketType  (DATA=0 ACK=1 EOT=2 SYN=3 SYNACK=4 FIN=5)
//!       4      4   SeqNum      (byte offset of data[0])
//!       8    512   data        (only the first DataLength bytes matter)
//!     520      4   DataLength
//!     524      4   WindowSize  (in MSS units, not bytes)
//!     528      4   AckNum      (next byte expected from the peer)
//! ```
//!
//! Total size: [`PACKET_LEN`] = 532 bytes.

use std::fmt;

use thiserror::Error;

/// Maximum payload bytes per packet; also the MSS used as the window unit.
pub const PAYLOAD_LEN: usize = 512;

/// Byte length of one packet on the wire.
pub const PACKET_LEN: usize = 4 + 4 + PAYLOAD_LEN + 4 + 4 + 4;

// Byte offsets of each field within the serialised packet.
const OFF_TYPE: usize = 0;
const OFF_SEQ: usize = 4;
const OFF_DATA: usize = 8;
const OFF_DATA_LEN: usize = OFF_DATA + PAYLOAD_LEN;
const OFF_WINDOW: usize = OFF_DATA_LEN + 4;
const OFF_ACK: usize = OFF_WINDOW + 4;

/// Kind of packet, carried in the first word of the wire image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// File bytes (or the filename, for the first segment).
    Data,
    /// Cumulative acknowledgement.
    Ack,
    /// Last data segment of the file.
    Eot,
    /// Synchronise sequence numbers (handshake initiation).
    Syn,
    /// Handshake reply.
    SynAck,
    /// No more data from this side; one sequence unit.
    Fin,
}

impl PacketType {
    pub fn code(self) -> i32 {
        match self {
            PacketType::Data => 0,
            PacketType::Ack => 1,
            PacketType::Eot => 2,
            PacketType::Syn => 3,
            PacketType::SynAck => 4,
            PacketType::Fin => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => PacketType::Data,
            1 => PacketType::Ack,
            2 => PacketType::Eot,
            3 => PacketType::Syn,
            4 => PacketType::SynAck,
            5 => PacketType::Fin,
            _ => return None,
        })
    }

    /// `true` for the types whose payload is file content.
    pub fn carries_data(self) -> bool {
        matches!(self, PacketType::Data | PacketType::Eot)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PacketType::Data => "DATA",
            PacketType::Ack => "ACK",
            PacketType::Eot => "EOT",
            PacketType::Syn => "SYN",
            PacketType::SynAck => "SYN-ACK",
            PacketType::Fin => "FIN",
        };
        f.pad(label)
    }
}

/// One fixed-size protocol packet.
///
/// The payload is held in a fixed array so a packet can be copied around
/// and re-sent without re-framing; only `data[..data_len]` is meaningful.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub seq: u32,
    data: [u8; PAYLOAD_LEN],
    data_len: u32,
    /// Advertised window, in MSS units.
    pub window: u32,
    pub ack: u32,
}

impl Packet {
    /// Build a control packet (SYN, SYN-ACK, ACK, FIN).
    ///
    /// Control packets carry a single zero byte so they occupy exactly one
    /// unit of sequence space.
    pub fn control(packet_type: PacketType, seq: u32, ack: u32, window: u32) -> Self {
        Self {
            packet_type,
            seq,
            data: [0u8; PAYLOAD_LEN],
            data_len: 1,
            window,
            ack,
        }
    }

    /// Build a data-bearing packet.
    ///
    /// Returns [`PacketError::PayloadTooLarge`] if `payload` exceeds
    /// [`PAYLOAD_LEN`].
    pub fn with_payload(
        packet_type: PacketType,
        seq: u32,
        payload: &[u8],
        window: u32,
        ack: u32,
    ) -> Result<Self, PacketError> {
        if payload.len() > PAYLOAD_LEN {
            return Err(PacketError::PayloadTooLarge(payload.len()));
        }
        let mut data = [0u8; PAYLOAD_LEN];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            packet_type,
            seq,
            data,
            data_len: payload.len() as u32,
            window,
            ack,
        })
    }

    /// The meaningful payload bytes, `data[..DataLength]`.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.data_len as usize]
    }

    /// Number of sequence units this packet occupies.
    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    /// First sequence number after this packet.
    pub fn end_seq(&self) -> u32 {
        self.seq.wrapping_add(self.data_len)
    }

    /// Serialise this packet into its fixed-size wire image.
    pub fn encode(&self) -> [u8; PACKET_LEN] {
        let mut buf = [0u8; PACKET_LEN];
        buf[OFF_TYPE..OFF_TYPE + 4].copy_from_slice(&self.packet_type.code().to_le_bytes());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_le_bytes());
        buf[OFF_DATA..OFF_DATA + PAYLOAD_LEN].copy_from_slice(&self.data);
        buf[OFF_DATA_LEN..OFF_DATA_LEN + 4].copy_from_slice(&self.data_len.to_le_bytes());
        buf[OFF_WINDOW..OFF_WINDOW + 4].copy_from_slice(&self.window.to_le_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.ack.to_le_bytes());
        buf
    }

    /// Parse a [`Packet`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`PACKET_LEN`],
    /// - the type code is not one of the six known types, or
    /// - `DataLength` is negative or larger than [`PAYLOAD_LEN`].
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < PACKET_LEN {
            return Err(PacketError::BufferTooShort(buf.len()));
        }

        let code = read_i32(buf, OFF_TYPE);
        let packet_type = PacketType::from_code(code).ok_or(PacketError::UnknownType(code))?;
        let raw_len = read_i32(buf, OFF_DATA_LEN);
        if raw_len < 0 || raw_len as usize > PAYLOAD_LEN {
            return Err(PacketError::InvalidLength(raw_len));
        }

        let mut data = [0u8; PAYLOAD_LEN];
        data.copy_from_slice(&buf[OFF_DATA..OFF_DATA + PAYLOAD_LEN]);

        Ok(Packet {
            packet_type,
            seq: read_u32(buf, OFF_SEQ),
            data,
            data_len: raw_len as u32,
            window: read_u32(buf, OFF_WINDOW),
            ack: read_u32(buf, OFF_ACK),
        })
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("packet_type", &self.packet_type)
            .field("seq", &self.seq)
            .field("data_len", &self.data_len)
            .field("window", &self.window)
            .field("ack", &self.ack)
            .finish()
    }
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_i32(buf: &[u8], off: usize) -> i32 {
    read_u32(buf, off) as i32
}

/// Errors that can arise when framing or parsing a packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer of {0} bytes is too short for a packet")]
    BufferTooShort(usize),
    #[error("unknown packet type code {0}")]
    UnknownType(i32),
    #[error("DataLength {0} is outside 0..=512")]
    InvalidLength(i32),
    #[error("payload of {0} bytes exceeds the 512-byte packet payload")]
    PayloadTooLarge(usize),
}

// ---------------------------------------------------------------------------
// Sequence-space comparisons
// ---------------------------------------------------------------------------

/// Returns `true` when sequence number `a` is strictly before `b` in
/// wrap-around space.
///
/// Valid while the two values are less than `u32::MAX / 2` apart, which
/// always holds for a window of a few hundred segments.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

/// Returns `true` when `a` is at or before `b` in wrap-around space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_len_matches_struct_layout() {
        // type(4) + seq(4) + data(512) + len(4) + window(4) + ack(4)
        assert_eq!(PACKET_LEN, 532);
    }

    #[test]
    fn control_packet_occupies_one_sequence_unit() {
        let syn = Packet::control(PacketType::Syn, 41, 0, 1);
        assert_eq!(syn.data_len(), 1);
        assert_eq!(syn.payload(), &[0u8]);
        assert_eq!(syn.end_seq(), 42);
    }

    #[test]
    fn data_packet_roundtrip_keeps_payload() {
        let pkt = Packet::with_payload(PacketType::Data, 1000, b"hello", 8, 1).unwrap();
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded, pkt);
        assert_eq!(decoded.payload(), b"hello");
        assert_eq!(decoded.end_seq(), 1005);
    }

    #[test]
    fn fields_are_little_endian_at_struct_offsets() {
        let pkt = Packet::control(PacketType::SynAck, 0x0102_0304, 0x0a0b_0c0d, 128);
        let bytes = pkt.encode();
        assert_eq!(&bytes[0..4], &[4, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[520..524], &[1, 0, 0, 0]);
        assert_eq!(&bytes[524..528], &[128, 0, 0, 0]);
        assert_eq!(&bytes[528..532], &[0x0d, 0x0c, 0x0b, 0x0a]);
    }

    #[test]
    fn oversized_payload_rejected() {
        let big = vec![7u8; PAYLOAD_LEN + 1];
        assert_eq!(
            Packet::with_payload(PacketType::Data, 0, &big, 1, 0),
            Err(PacketError::PayloadTooLarge(PAYLOAD_LEN + 1))
        );
    }

    #[test]
    fn full_payload_accepted() {
        let full = vec![9u8; PAYLOAD_LEN];
        let pkt = Packet::with_payload(PacketType::Data, 0, &full, 1, 0).unwrap();
        assert_eq!(pkt.payload().len(), PAYLOAD_LEN);
    }

    #[test]
    fn decode_short_buffer_returns_error() {
        assert_eq!(
            Packet::decode(&[0u8; PACKET_LEN - 1]),
            Err(PacketError::BufferTooShort(PACKET_LEN - 1))
        );
    }

    #[test]
    fn decode_unknown_type_returns_error() {
        let mut bytes = Packet::control(PacketType::Ack, 0, 0, 0).encode();
        bytes[0] = 9;
        assert_eq!(Packet::decode(&bytes), Err(PacketError::UnknownType(9)));
    }

    #[test]
    fn decode_bad_length_returns_error() {
        let mut bytes = Packet::control(PacketType::Ack, 0, 0, 0).encode();
        bytes[OFF_DATA_LEN..OFF_DATA_LEN + 4].copy_from_slice(&600i32.to_le_bytes());
        assert_eq!(Packet::decode(&bytes), Err(PacketError::InvalidLength(600)));

        bytes[OFF_DATA_LEN..OFF_DATA_LEN + 4].copy_from_slice(&(-1i32).to_le_bytes());
        assert_eq!(Packet::decode(&bytes), Err(PacketError::InvalidLength(-1)));
    }

    #[test]
    fn type_labels_match_log_table() {
        assert_eq!(PacketType::SynAck.to_string(), "SYN-ACK");
        assert_eq!(format!("{:>7}", PacketType::Ack), "    ACK");
    }

    #[test]
    fn every_type_code_roundtrips() {
        for code in 0..6 {
            assert_eq!(PacketType::from_code(code).unwrap().code(), code);
        }
        assert_eq!(PacketType::from_code(6), None);
    }

    #[test]
    fn seq_comparisons_wrap() {
        assert!(seq_lt(1, 2));
        assert!(!seq_lt(2, 2));
        assert!(seq_le(2, 2));
        assert!(seq_lt(u32::MAX - 1, 3));
        assert!(!seq_lt(3, u32::MAX - 1));
    }
}
