//! Wire-format definitions for bTCP segments.
//!
//! Every datagram exchanged between peers is one [`Segment`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Serialising a [`Segment`] into a fixed-size byte buffer.
//! - Deserialising a raw byte slice back into a [`Segment`], returning errors
//!   for malformed or truncated input.
//! - Computing the payload checksum.
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
//! |        Sequence Number        |     Acknowledgment Number     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flags     |          Window Size          |  Data Length  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+               +
//! |               |           Checksum            |               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+               +
//! |              Payload (zero padded to PAYLOAD_SIZE)            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 11 bytes.
//! seq(2) + ack(2) + flags(1) + window(2) + data_length(2) + checksum(2)
//!
//! Every segment is exactly [`SEGMENT_SIZE`] bytes regardless of how much of
//! the payload is used, so the datagram boundary is the only framing needed.

use thiserror::Error;

/// Bit values of the `flags` header field.
pub mod flags {
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b0000_0001;
    /// Synchronise sequence numbers (handshake initiation).
    pub const SYN: u8 = 0b0000_0010;
    /// Finish: the sender is tearing the connection down.
    pub const FIN: u8 = 0b0000_0100;
    /// Bits that carry meaning; everything above is reserved.
    pub const MASK: u8 = ACK | SYN | FIN;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 11;

/// Fixed payload capacity of every segment.
pub const PAYLOAD_SIZE: usize = 1008;

/// Size of every encoded segment.
pub const SEGMENT_SIZE: usize = HEADER_LEN + PAYLOAD_SIZE;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 2;
const OFF_FLAGS: usize = 4;
const OFF_WINDOW: usize = 5;
const OFF_DATA_LEN: usize = 7;
const OFF_CHECKSUM: usize = 9;

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// The decoded {ACK, SYN, FIN} flag set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags {
    pub ack: bool,
    pub syn: bool,
    pub fin: bool,
}

impl Flags {
    /// Plain data segment.
    pub const NONE: Flags = Flags::new(false, false, false);
    pub const ACK: Flags = Flags::new(true, false, false);
    pub const SYN: Flags = Flags::new(false, true, false);
    pub const FIN: Flags = Flags::new(false, false, true);
    pub const SYN_ACK: Flags = Flags::new(true, true, false);
    pub const FIN_ACK: Flags = Flags::new(true, false, true);

    pub const fn new(ack: bool, syn: bool, fin: bool) -> Self {
        Self { ack, syn, fin }
    }
}

impl std::fmt::Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = [(self.syn, "SYN"), (self.ack, "ACK"), (self.fin, "FIN")]
            .iter()
            .filter(|(set, _)| *set)
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "DATA")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Pack a flag set into its header byte (ACK = 1, SYN = 2, FIN = 4).
pub fn flags_to_byte(f: Flags) -> u8 {
    let mut byte = 0;
    if f.ack {
        byte |= flags::ACK;
    }
    if f.syn {
        byte |= flags::SYN;
    }
    if f.fin {
        byte |= flags::FIN;
    }
    byte
}

/// Expand a header byte into a flag set.
///
/// Values with any reserved bit set (≥ 8) are rejected instead of being
/// folded into the low three bits.
pub fn byte_to_flags(byte: u8) -> Result<Flags, SegmentError> {
    if byte & !flags::MASK != 0 {
        return Err(SegmentError::ReservedFlags(byte));
    }
    Ok(Flags {
        ack: byte & flags::ACK != 0,
        syn: byte & flags::SYN != 0,
        fin: byte & flags::FIN != 0,
    })
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// Fixed-size segment header, fields in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Data segment index, or the client's ISN during the handshake.
    pub seq: u16,
    /// Acknowledged sequence number (handshake) or selectively-acked index.
    pub ack: u16,
    pub flags: Flags,
    /// Advertised receive window, in segments.
    pub window: u16,
    /// Number of valid payload bytes; the rest of the payload is padding.
    pub data_length: u16,
    /// Checksum over the first `data_length` payload bytes.
    pub checksum: u16,
}

/// A complete bTCP segment: header + unpadded payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Build a data segment (no flags) carrying `payload`.
    ///
    /// `data_length` and `checksum` are derived from the payload.
    pub fn data(seq: u16, payload: Vec<u8>) -> Self {
        Self {
            header: Header {
                seq,
                ack: 0,
                flags: Flags::NONE,
                window: 0,
                data_length: payload.len() as u16,
                checksum: checksum(&payload),
            },
            payload,
        }
    }

    /// Build a payload-less control segment.
    pub fn control(seq: u16, ack: u16, flags: Flags, window: u16) -> Self {
        Self {
            header: Header {
                seq,
                ack,
                flags,
                window,
                data_length: 0,
                checksum: checksum(&[]),
            },
            payload: Vec::new(),
        }
    }

    /// Serialise this segment into a [`SEGMENT_SIZE`] byte vector.
    ///
    /// The header is written verbatim, so a segment whose stored checksum was
    /// tampered with stays tampered on the wire.  The payload is zero padded.
    pub fn encode(&self) -> Result<Vec<u8>, SegmentError> {
        if self.payload.len() > PAYLOAD_SIZE {
            return Err(SegmentError::PayloadTooLarge(self.payload.len()));
        }
        let h = &self.header;
        let mut buf = vec![0u8; SEGMENT_SIZE];

        buf[OFF_SEQ..OFF_SEQ + 2].copy_from_slice(&h.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 2].copy_from_slice(&h.ack.to_be_bytes());
        buf[OFF_FLAGS] = flags_to_byte(h.flags);
        buf[OFF_WINDOW..OFF_WINDOW + 2].copy_from_slice(&h.window.to_be_bytes());
        buf[OFF_DATA_LEN..OFF_DATA_LEN + 2].copy_from_slice(&h.data_length.to_be_bytes());
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&h.checksum.to_be_bytes());

        buf[HEADER_LEN..HEADER_LEN + self.payload.len()].copy_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a [`Segment`] from a raw datagram.
    ///
    /// The payload is truncated to `data_length`; padding is discarded.  The
    /// checksum is **not** verified here, see [`Segment::is_intact`].
    pub fn decode(buf: &[u8]) -> Result<Self, SegmentError> {
        if buf.len() < HEADER_LEN {
            return Err(SegmentError::BufferTooShort(buf.len()));
        }

        let seq = read_u16(buf, OFF_SEQ);
        let ack = read_u16(buf, OFF_ACK);
        let flags = byte_to_flags(buf[OFF_FLAGS])?;
        let window = read_u16(buf, OFF_WINDOW);
        let data_length = read_u16(buf, OFF_DATA_LEN);
        let checksum = read_u16(buf, OFF_CHECKSUM);

        let available = (buf.len() - HEADER_LEN).min(PAYLOAD_SIZE);
        if data_length as usize > available {
            return Err(SegmentError::LengthMismatch {
                data_length,
                available,
            });
        }

        Ok(Segment {
            header: Header {
                seq,
                ack,
                flags,
                window,
                data_length,
                checksum,
            },
            payload: buf[HEADER_LEN..HEADER_LEN + data_length as usize].to_vec(),
        })
    }

    /// `true` when the stored checksum matches the one recomputed over the
    /// unpadded payload.
    pub fn is_intact(&self) -> bool {
        checksum(&self.payload) == self.header.checksum
    }
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

/// Errors that can arise when building or parsing a segment.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SegmentError {
    #[error("buffer of {0} bytes is too short to contain a header")]
    BufferTooShort(usize),
    #[error("data_length {data_length} exceeds the {available} payload bytes present")]
    LengthMismatch { data_length: u16, available: usize },
    #[error("flag byte {0:#04x} has reserved bits set")]
    ReservedFlags(u8),
    #[error("payload of {0} bytes exceeds the segment capacity")]
    PayloadTooLarge(usize),
}

/// One's-complement style checksum over `data`.
///
/// Sums consecutive big-endian 16-bit words (a trailing odd byte is a word of
/// its own), folds the carries back in, and returns `65535 − sum`.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);
    for w in &mut words {
        sum += u32::from(u16::from_be_bytes([w[0], w[1]]));
        // Fold eagerly so the accumulator never overflows.
        sum = (sum & 0xffff) + (sum >> 16);
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last);
        sum = (sum & 0xffff) + (sum >> 16);
    }
    0xffff - sum as u16
}
