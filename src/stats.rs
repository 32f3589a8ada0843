//! Per-connection counters.

use std::fmt;

use crate::receiver::DropReason;

/// Running totals kept by a [`crate::connection::Connection`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Every datagram handed to the socket, retransmissions included.
    pub packets_sent: u64,
    pub retransmissions: u64,
    /// Datagrams that decoded cleanly.
    pub packets_received: u64,
    /// Datagrams that failed checksum or length validation.
    pub corrupt_dropped: u64,
    /// Duplicates answered with a repeated ACK.
    pub duplicates: u64,
    pub out_of_order_dropped: u64,
    /// Illegal flags, handshake stragglers, stray ACKs, traffic from other addresses.
    pub protocol_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

impl ConnectionStats {
    pub(crate) fn record_drop(&mut self, reason: DropReason) {
        match reason {
            DropReason::OutOfOrder => self.out_of_order_dropped += 1,
            DropReason::Handshake
            | DropReason::StrayAck
            | DropReason::Illegal
            | DropReason::AfterFin => self.protocol_dropped += 1,
        }
    }
}

impl fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent {} pkts ({} retx, {} bytes, {} msgs), received {} pkts ({} bytes, {} msgs), \
             dropped {} corrupt / {} out-of-order / {} protocol, {} duplicates",
            self.packets_sent,
            self.retransmissions,
            self.bytes_sent,
            self.messages_sent,
            self.packets_received,
            self.bytes_received,
            self.messages_received,
            self.corrupt_dropped,
            self.out_of_order_dropped,
            self.protocol_dropped,
            self.duplicates,
        )
    }
}
