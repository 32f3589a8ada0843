//! Outbound packet state for stop-and-wait reliability.
//!
//! [`Sender`] tracks the send-side sequence number and the single in-flight
//! packet.  It does **not** touch the socket;
//! [`crate::connection::Connection`] calls these methods and owns the actual
//! send/wait/retransmit loop.
//!
//! # Stop-and-Wait contract
//! - At most **one** packet is in flight at any moment (`unacked`).
//! - A new packet may only be recorded once `unacked` is `None`.
//! - On a matching ACK: advance `next_seq` by one; clear `unacked`.  The ACK
//!   of a message's final (`DONE`) fragment instead restarts numbering at 0
//!   for the next message.
//! - On timeout: increment `tx_count`; resend the same packet unchanged.

use std::time::{Duration, Instant};

use crate::packet::{Kind, Packet};

// ---------------------------------------------------------------------------
// Segmentation
// ---------------------------------------------------------------------------

/// One MSS-bounded slice of an application buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub bytes: &'a [u8],
    /// `true` on the final slice, which is sent with `DONE`.
    pub last: bool,
}

/// Iterator returned by [`segments`].
#[derive(Debug, Clone)]
pub struct Segments<'a> {
    rest: Option<&'a [u8]>,
    mss: usize,
}

/// Split `buf` into ordered slices of at most `mss` bytes.
///
/// Yields `ceil(len / mss)` segments, or a single empty segment for an empty
/// buffer so that the message boundary still reaches the peer.  Only the
/// final segment has `last` set.
///
/// # Panics
/// If `mss` is zero; [`crate::config::Config::validate`] rules that out.
pub fn segments(buf: &[u8], mss: usize) -> Segments<'_> {
    assert!(mss > 0, "segment size must be non-zero");
    Segments {
        rest: Some(buf),
        mss,
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.rest?;
        if rest.len() <= self.mss {
            self.rest = None;
            return Some(Segment {
                bytes: rest,
                last: true,
            });
        }
        let (head, tail) = rest.split_at(self.mss);
        self.rest = Some(tail);
        Some(Segment {
            bytes: head,
            last: false,
        })
    }
}

// ---------------------------------------------------------------------------
// RetransmitEntry
// ---------------------------------------------------------------------------

/// A packet that has been sent but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmitEntry {
    /// The packet on the wire.
    pub packet: Packet,
    /// How many times this packet has been transmitted (1 = first send).
    pub tx_count: u32,
    /// Time of the first transmission.
    pub sent_at: Instant,
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Stop-and-wait send-side state for one connection.
#[derive(Debug, Default)]
pub struct Sender {
    /// Sequence number of the **next** packet to send.
    ///
    /// Advances by one each time the in-flight packet is acknowledged and
    /// returns to 0 when a message completes.
    pub next_seq: u32,

    /// The in-flight packet, or `None` when the sender is idle.
    pub unacked: Option<RetransmitEntry>,
}

impl Sender {
    /// A sender for a freshly established connection; numbering starts at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the data packet for `segment` with the current sequence number.
    pub fn build_data_packet(&self, segment: Segment<'_>) -> Packet {
        Packet::data(self.next_seq, segment.bytes.to_vec(), segment.last)
    }

    /// Build a teardown request with the current sequence number.
    pub fn build_fin(&self) -> Packet {
        Packet::fin(self.next_seq)
    }

    /// Move `packet` into the in-flight slot (first transmission).
    ///
    /// Panics in debug mode if a packet is already in flight.
    pub fn record_sent(&mut self, packet: Packet) {
        debug_assert!(
            self.unacked.is_none(),
            "record_sent called while a packet is already in flight"
        );
        self.unacked = Some(RetransmitEntry {
            packet,
            tx_count: 1,
            sent_at: Instant::now(),
        });
    }

    /// Process an inbound ACK echoing `seq`.
    ///
    /// Returns the round-trip time since the first transmission if this ACK
    /// covers the in-flight packet, `None` for a stale or unexpected ACK.
    /// On success the slot is cleared and `next_seq` moves on.
    pub fn on_ack(&mut self, seq: u32) -> Option<Duration> {
        let entry = self.unacked.as_ref()?;
        if entry.packet.seq() != seq {
            return None;
        }
        let rtt = entry.sent_at.elapsed();
        self.next_seq = match entry.packet.kind() {
            Some(Kind::Data { last: true }) => 0,
            _ => seq.wrapping_add(1),
        };
        self.unacked = None;
        Some(rtt)
    }

    /// Increment the transmit count for the in-flight packet.
    ///
    /// Called by the connection loop before each retransmission.
    pub fn on_retransmit(&mut self) {
        if let Some(ref mut e) = self.unacked {
            e.tx_count += 1;
        }
    }

    /// Give up on the in-flight packet.  `next_seq` is left untouched.
    pub fn abandon(&mut self) -> Option<RetransmitEntry> {
        self.unacked.take()
    }

    /// Number of times the in-flight packet has been sent, or `0` if idle.
    pub fn transmit_count(&self) -> u32 {
        self.unacked.as_ref().map_or(0, |e| e.tx_count)
    }

    /// `true` when a packet is waiting for an ACK.
    pub fn has_unacked(&self) -> bool {
        self.unacked.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::flags;

    #[test]
    fn segments_cover_buffer_in_order() {
        let buf: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
        let segs: Vec<_> = segments(&buf, 8192).collect();
        assert_eq!(
            segs.iter().map(|s| s.bytes.len()).collect::<Vec<_>>(),
            vec![8192, 8192, 3616]
        );
        assert_eq!(
            segs.iter().map(|s| s.last).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        let joined: Vec<u8> = segs.iter().flat_map(|s| s.bytes.iter().copied()).collect();
        assert_eq!(joined, buf);
    }

    #[test]
    fn segment_count_is_ceiling() {
        for (len, mss, expected) in [(1, 10, 1), (10, 10, 1), (11, 10, 2), (30, 10, 3), (31, 10, 4)] {
            let buf = vec![0u8; len];
            assert_eq!(segments(&buf, mss).count(), expected, "len={len} mss={mss}");
        }
    }

    #[test]
    fn empty_buffer_is_one_final_segment() {
        let segs: Vec<_> = segments(&[], 8).collect();
        assert_eq!(
            segs,
            vec![Segment {
                bytes: &[],
                last: true
            }]
        );
    }

    #[test]
    fn data_packets_carry_done_on_last() {
        let s = Sender::new();
        let mid = s.build_data_packet(Segment {
            bytes: b"ab",
            last: false,
        });
        let end = s.build_data_packet(Segment {
            bytes: b"c",
            last: true,
        });
        assert_eq!(mid.header.flags, flags::DATA);
        assert_eq!(end.kind(), Some(Kind::Data { last: true }));
        assert_eq!(s.build_fin().kind(), Some(Kind::Fin));
    }

    #[test]
    fn ack_advances_by_one() {
        let mut s = Sender::new();
        let pkt = s.build_data_packet(Segment {
            bytes: b"x",
            last: false,
        });
        s.record_sent(pkt);
        assert!(s.has_unacked());

        // Stale ACK for a different number is ignored.
        assert!(s.on_ack(7).is_none());
        assert_eq!(s.next_seq, 0);

        assert!(s.on_ack(0).is_some());
        assert_eq!(s.next_seq, 1);
        assert!(!s.has_unacked());
        // A duplicate of the same ACK changes nothing.
        assert!(s.on_ack(0).is_none());
        assert_eq!(s.next_seq, 1);
    }

    #[test]
    fn final_fragment_ack_restarts_numbering() {
        let mut s = Sender::new();
        for last in [false, false, true] {
            let pkt = s.build_data_packet(Segment { bytes: b"x", last });
            let seq = pkt.seq();
            s.record_sent(pkt);
            assert!(s.on_ack(seq).is_some());
        }
        assert_eq!(s.next_seq, 0);

        // The next message starts again at 0.
        let next = s.build_data_packet(Segment {
            bytes: b"y",
            last: true,
        });
        assert_eq!(next.seq(), 0);
    }

    #[test]
    fn retransmit_counts() {
        let mut s = Sender::new();
        assert_eq!(s.transmit_count(), 0);
        let fin = s.build_fin();
        s.record_sent(fin);
        s.on_retransmit();
        s.on_retransmit();
        assert_eq!(s.transmit_count(), 3);
        assert!(s.abandon().is_some());
        assert_eq!(s.next_seq, 0);
    }
}
