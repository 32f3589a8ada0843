//! Wire-format definitions for protocol packets.
//!
//! One UDP datagram carries exactly one [`Packet`]: a 9-byte header
//! followed by up to [`MAX_PAYLOAD`] bytes.  [`Packet::encode`] fills in the
//! checksum; [`Packet::decode`] checks it before trusting the length field.
//! [`Packet::kind`] maps the flag byte onto the legal [`Kind`]s.  No I/O
//! happens here.
//!
//! # Wire format
//!
//! Integers travel in network byte order.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Checksum            |     Flags     |    Length ... |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  ... Length   |                 Payload ...                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 9 bytes.
//! seq(4) + checksum(2) + flags(1) + length(2)

use thiserror::Error;

/// Values of the flags byte.
pub mod flags {
    /// Connection request.
    pub const SYN: u8 = 0b0000_0001;
    /// Acknowledgement (alone) or connection accept (with SYN).
    pub const ACK: u8 = 0b0000_0010;
    /// The packet carries an application payload fragment.
    pub const DATA: u8 = 0b0000_0100;
    /// Final fragment of a message (with DATA) or teardown request (alone).
    pub const DONE: u8 = 0b0000_1000;
}

/// Header bytes preceding the payload.
pub const HEADER_LEN: usize = 9;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

/// Largest payload a single packet can carry.
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_LEN;

// Header field offsets.
const OFF_SEQ: usize = 0;
const OFF_CHECKSUM: usize = 4;
const OFF_FLAGS: usize = 6;
const OFF_LEN: usize = 7;

/// Decoded header fields.  The length field is implied by the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Per-direction packet counter, starting at 0 for each connection.
    pub seq: u32,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// Internet checksum (RFC 1071) over the entire serialised packet.
    ///
    /// Ignored on encode (computed and written last); set from the wire on
    /// decode, after it has been verified.
    pub checksum: u16,
}

/// The legal flag combinations.  Anything else is a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// `SYN`: connection request.
    Syn,
    /// `SYN | ACK`: connection accept.
    SynAck,
    /// `ACK`: acknowledges the DATA or DONE packet with the same sequence number.
    Ack,
    /// `DATA`, optionally with `DONE` on the final fragment of a message.
    Data { last: bool },
    /// `DONE` alone: teardown request.
    Fin,
}

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet with the given sequence number, flag bits and payload.
    pub fn new(seq: u32, flags: u8, payload: Vec<u8>) -> Self {
        Self {
            header: Header {
                seq,
                flags,
                checksum: 0, // filled in by Packet::encode
            },
            payload,
        }
    }

    pub fn syn() -> Self {
        Self::new(0, flags::SYN, Vec::new())
    }

    pub fn syn_ack() -> Self {
        Self::new(0, flags::SYN | flags::ACK, Vec::new())
    }

    /// Acknowledgement echoing `seq`.
    pub fn ack(seq: u32) -> Self {
        Self::new(seq, flags::ACK, Vec::new())
    }

    /// A payload fragment; `last` sets `DONE` to close the message.
    pub fn data(seq: u32, payload: Vec<u8>, last: bool) -> Self {
        let flags = if last { flags::DATA | flags::DONE } else { flags::DATA };
        Self::new(seq, flags, payload)
    }

    /// Teardown request.
    pub fn fin(seq: u32) -> Self {
        Self::new(seq, flags::DONE, Vec::new())
    }

    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    /// Classify the flag byte.
    ///
    /// Returns `None` for illegal combinations, and for control packets that
    /// carry a payload.
    pub fn kind(&self) -> Option<Kind> {
        const SYN_ACK: u8 = flags::SYN | flags::ACK;
        const DATA_DONE: u8 = flags::DATA | flags::DONE;

        let kind = match self.header.flags {
            flags::SYN => Kind::Syn,
            SYN_ACK => Kind::SynAck,
            flags::ACK => Kind::Ack,
            flags::DATA => return Some(Kind::Data { last: false }),
            DATA_DONE => return Some(Kind::Data { last: true }),
            flags::DONE => Kind::Fin,
            _ => return None,
        };
        self.payload.is_empty().then_some(kind)
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// The length and checksum fields are computed from the actual payload.
    /// Fails only when the payload cannot be described by the 16-bit length
    /// field or would not fit in one datagram.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(payload_len));
        }
        let mut buf = vec![0u8; HEADER_LEN + payload_len];

        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.header.seq.to_be_bytes());
        buf[OFF_FLAGS] = self.header.flags;
        buf[OFF_LEN..OFF_LEN + 2].copy_from_slice(&(payload_len as u16).to_be_bytes());
        // Checksum field stays zero while computing the checksum.
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        let csum = internet_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());

        Ok(buf)
    }

    /// Parse a [`Packet`] from a raw byte slice.
    ///
    /// The checksum is verified before any other field is interpreted.
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the checksum does not verify, or
    /// - the length field disagrees with `buf.len()`.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort(buf.len()));
        }

        let checksum = read_u16(buf, OFF_CHECKSUM);
        let mut scratch = buf.to_vec();
        scratch[OFF_CHECKSUM..OFF_CHECKSUM + 2].fill(0);
        let computed = internet_checksum(&scratch);
        if computed != checksum {
            return Err(PacketError::ChecksumFailed {
                expected: checksum,
                computed,
            });
        }

        let payload_len = read_u16(buf, OFF_LEN) as usize;
        if buf.len() != HEADER_LEN + payload_len {
            return Err(PacketError::LengthMismatch {
                declared: payload_len,
                actual: buf.len() - HEADER_LEN,
            });
        }

        let seq = u32::from_be_bytes([
            buf[OFF_SEQ],
            buf[OFF_SEQ + 1],
            buf[OFF_SEQ + 2],
            buf[OFF_SEQ + 3],
        ]);

        Ok(Packet {
            header: Header {
                seq,
                flags: buf[OFF_FLAGS],
                checksum,
            },
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

/// Errors that can arise when encoding or parsing a datagram.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer of {0} bytes is too short to contain a header")]
    BufferTooShort(usize),
    #[error("checksum mismatch: header says {expected:#06x}, computed {computed:#06x}")]
    ChecksumFailed { expected: u16, computed: u16 },
    #[error("length field says {declared} payload bytes but {actual} are present")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("payload of {0} bytes does not fit in one datagram")]
    PayloadTooLarge(usize),
}

/// RFC 1071 Internet checksum of `data`.
///
/// Computed with the checksum field zeroed.  Summing a packet that already
/// contains its checksum yields zero.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);

    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
        // Fold eagerly so a maximal datagram cannot overflow.
        if sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
    }
    // Odd trailing byte: pad with a zero on the right.
    if let Some(&byte) = words.remainder().first() {
        sum += u32::from(byte) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
