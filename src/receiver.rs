//! Inbound packet validation and ordering.
//!
//! The [`Receiver`] decides what happens to every decoded packet that
//! arrives on an established connection, *before* any bytes reach the
//! application:
//! - Accepting only the next expected sequence number.
//! - Re-acknowledging duplicates of packets already accepted (their ACK was
//!   lost) without delivering them again.
//! - Silently dropping packets from the future, handshake stragglers and
//!   illegal flag combinations.
//! - Tracking message boundaries (`DONE`) and the peer's teardown request.
//!
//! Numbering restarts at 0 for every message.  The final fragment of the
//! message just completed is remembered so that its retransmission (our ACK
//! was lost) is re-acknowledged instead of being taken for the next message.
//! A new single-fragment message byte-identical to the previous one is
//! therefore indistinguishable from such a retransmission.
//!
//! The [`Receiver`] does **not** send ACKs itself; it returns an [`Action`]
//! that [`crate::connection::Connection`] carries out.

use crate::packet::{Kind, Packet};

/// What a successful `recv` call observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// A fragment of a message that continues in later packets.
    Continuation,
    /// The final fragment of a message.
    MessageComplete,
    /// The peer tore the connection down; no bytes were delivered.
    PeerDisconnected,
}

/// Why a packet was dropped without acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// SYN or SYN+ACK on an established connection.
    Handshake,
    /// Bare ACK when nothing of ours is waiting for one.
    StrayAck,
    /// Flag combination outside the protocol.
    Illegal,
    /// Sequence number beyond the next expected one.
    OutOfOrder,
    /// New data after the peer's FIN.
    AfterFin,
}

/// The connection's response to one inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// ACK `seq` and hand the payload to the application.
    Deliver { seq: u32, status: MessageStatus },
    /// ACK `seq`; the peer has started teardown.
    PeerFin { seq: u32 },
    /// ACK `seq` again; nothing is delivered.  `fin` marks a repeated teardown request.
    Reack { seq: u32, fin: bool },
    /// Ignore the packet entirely.
    Drop(DropReason),
}

/// Receive-side state for one connection.
#[derive(Debug, Default)]
pub struct Receiver {
    /// Next sequence number that will be accepted.
    pub expected: u32,
    /// Set once the peer's FIN has been accepted.
    pub fin_received: bool,
    shut_down: bool,
    /// Final fragment of the last completed message, until the next packet is accepted.
    last_final: Option<Packet>,
    message_bytes: usize,
    message_chunks: u32,
    messages_completed: u64,
}

impl Receiver {
    /// A receiver for a freshly established connection; numbering starts at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// What [`Receiver::on_packet`] would do with `packet`, without changing
    /// any state.
    pub fn judge(&self, packet: &Packet) -> Action {
        let seq = packet.seq();
        let kind = match packet.kind() {
            Some(Kind::Syn | Kind::SynAck) => return Action::Drop(DropReason::Handshake),
            Some(Kind::Ack) => return Action::Drop(DropReason::StrayAck),
            Some(kind) => kind,
            None => return Action::Drop(DropReason::Illegal),
        };

        if self.is_last_final(packet) {
            return Action::Reack { seq, fin: false };
        }
        if seq < self.expected {
            return Action::Reack {
                seq,
                fin: kind == Kind::Fin,
            };
        }
        if seq > self.expected {
            return Action::Drop(DropReason::OutOfOrder);
        }

        match kind {
            Kind::Data { last } if !self.fin_received && !self.shut_down => {
                let status = if last {
                    MessageStatus::MessageComplete
                } else {
                    MessageStatus::Continuation
                };
                Action::Deliver { seq, status }
            }
            Kind::Fin if !self.fin_received => Action::PeerFin { seq },
            _ => Action::Drop(DropReason::AfterFin),
        }
    }

    /// Decide what to do with `packet` and update the receive state.
    pub fn on_packet(&mut self, packet: &Packet) -> Action {
        let action = self.judge(packet);
        match action {
            Action::Deliver { status, .. } => {
                self.last_final = None;
                self.expected = self.expected.wrapping_add(1);
                self.message_bytes += packet.payload.len();
                self.message_chunks += 1;
                if status == MessageStatus::MessageComplete {
                    self.messages_completed += 1;
                    self.message_bytes = 0;
                    self.message_chunks = 0;
                    self.expected = 0;
                    self.last_final = Some(packet.clone());
                }
            }
            Action::PeerFin { .. } => {
                self.expected = self.expected.wrapping_add(1);
                self.fin_received = true;
            }
            Action::Reack { .. } | Action::Drop(_) => {}
        }
        action
    }

    fn is_last_final(&self, packet: &Packet) -> bool {
        self.last_final.as_ref().is_some_and(|prev| {
            prev.seq() == packet.seq()
                && prev.header.flags == packet.header.flags
                && prev.payload == packet.payload
        })
    }

    /// Stop accepting new data because the local side is tearing down.
    /// Duplicates are still re-acknowledged and a peer FIN is still accepted.
    pub fn shutdown(&mut self) {
        self.shut_down = true;
    }

    /// Payload bytes accepted so far for the message in progress.
    pub fn message_bytes(&self) -> usize {
        self.message_bytes
    }

    /// Fragments accepted so far for the message in progress.
    pub fn message_chunks(&self) -> u32 {
        self.message_chunks
    }

    pub fn messages_completed(&self) -> u64 {
        self.messages_completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::flags;

    fn data(seq: u32, payload: &[u8], last: bool) -> Packet {
        Packet::data(seq, payload.to_vec(), last)
    }

    #[test]
    fn accepts_in_order_fragments() {
        let mut r = Receiver::new();
        assert_eq!(
            r.on_packet(&data(0, b"ab", false)),
            Action::Deliver {
                seq: 0,
                status: MessageStatus::Continuation
            }
        );
        assert_eq!(r.message_bytes(), 2);
        assert_eq!(r.message_chunks(), 1);
        assert_eq!(
            r.on_packet(&data(1, b"c", true)),
            Action::Deliver {
                seq: 1,
                status: MessageStatus::MessageComplete
            }
        );
        assert_eq!(r.expected, 0);
        assert_eq!(r.message_bytes(), 0);
        assert_eq!(r.message_chunks(), 0);
        assert_eq!(r.messages_completed(), 1);
    }

    #[test]
    fn duplicate_is_reacked_without_state_change() {
        let mut r = Receiver::new();
        r.on_packet(&data(0, b"ab", false));
        let replay = r.on_packet(&data(0, b"ab", false));
        assert_eq!(replay, Action::Reack { seq: 0, fin: false });
        assert_eq!(r.expected, 1);
        assert_eq!(r.message_bytes(), 2);
    }

    #[test]
    fn future_packet_is_dropped() {
        let mut r = Receiver::new();
        assert_eq!(
            r.on_packet(&data(1, b"x", true)),
            Action::Drop(DropReason::OutOfOrder)
        );
        assert_eq!(r.expected, 0);
    }

    #[test]
    fn handshake_and_stray_acks_are_dropped() {
        let mut r = Receiver::new();
        assert_eq!(r.on_packet(&Packet::syn()), Action::Drop(DropReason::Handshake));
        assert_eq!(
            r.on_packet(&Packet::syn_ack()),
            Action::Drop(DropReason::Handshake)
        );
        assert_eq!(r.on_packet(&Packet::ack(0)), Action::Drop(DropReason::StrayAck));
        assert_eq!(
            r.on_packet(&Packet::new(0, flags::DATA | flags::ACK, b"x".to_vec())),
            Action::Drop(DropReason::Illegal)
        );
        assert_eq!(r.expected, 0);
    }

    #[test]
    fn fin_then_repeated_fins() {
        let mut r = Receiver::new();
        r.on_packet(&data(0, b"last", true));
        assert_eq!(r.on_packet(&Packet::fin(0)), Action::PeerFin { seq: 0 });
        assert!(r.fin_received);
        assert_eq!(r.expected, 1);

        for _ in 0..3 {
            assert_eq!(r.on_packet(&Packet::fin(0)), Action::Reack { seq: 0, fin: true });
        }
        assert_eq!(r.expected, 1);
    }

    #[test]
    fn nothing_new_after_fin() {
        let mut r = Receiver::new();
        r.on_packet(&Packet::fin(0));
        assert_eq!(
            r.on_packet(&data(1, b"late", true)),
            Action::Drop(DropReason::AfterFin)
        );
        assert_eq!(r.expected, 1);
    }

    #[test]
    fn judge_does_not_mutate() {
        let r = Receiver::new();
        let pkt = data(0, b"peek", false);
        assert_eq!(
            r.judge(&pkt),
            Action::Deliver {
                seq: 0,
                status: MessageStatus::Continuation
            }
        );
        assert_eq!(r.expected, 0);
        assert_eq!(r.message_bytes(), 0);
    }

    #[test]
    fn shutdown_refuses_data_but_takes_fin() {
        let mut r = Receiver::new();
        r.on_packet(&data(0, b"a", true));
        r.shutdown();
        assert_eq!(
            r.on_packet(&data(0, b"b", true)),
            Action::Drop(DropReason::AfterFin)
        );
        assert_eq!(r.on_packet(&data(0, b"a", true)), Action::Reack { seq: 0, fin: false });
        assert_eq!(r.on_packet(&Packet::fin(0)), Action::PeerFin { seq: 0 });
    }

    #[test]
    fn numbering_restarts_for_each_message() {
        let mut r = Receiver::new();
        r.on_packet(&data(0, b"one", true));
        assert_eq!(r.expected, 0);
        assert_eq!(
            r.on_packet(&data(0, b"two", true)),
            Action::Deliver {
                seq: 0,
                status: MessageStatus::MessageComplete
            }
        );
        assert_eq!(r.messages_completed(), 2);
    }

    #[test]
    fn retransmitted_final_fragment_is_reacked() {
        let mut r = Receiver::new();
        r.on_packet(&data(0, b"ab", false));
        r.on_packet(&data(1, b"cd", false));
        r.on_packet(&data(2, b"e", true));

        // Beyond `expected`, but it is the final fragment just accepted.
        for _ in 0..2 {
            assert_eq!(r.on_packet(&data(2, b"e", true)), Action::Reack { seq: 2, fin: false });
        }
        assert_eq!(r.messages_completed(), 1);

        // Anything else beyond `expected` is still out of order.
        assert_eq!(
            r.on_packet(&data(1, b"cd", false)),
            Action::Drop(DropReason::OutOfOrder)
        );

        // Once the next message starts, the old final fragment is forgotten.
        assert_eq!(
            r.on_packet(&data(0, b"next", false)),
            Action::Deliver {
                seq: 0,
                status: MessageStatus::Continuation
            }
        );
        assert_eq!(
            r.on_packet(&data(2, b"e", true)),
            Action::Drop(DropReason::OutOfOrder)
        );
    }

    #[test]
    fn single_fragment_retransmission_is_not_redelivered() {
        let mut r = Receiver::new();
        r.on_packet(&data(0, b"ping", true));
        assert_eq!(r.on_packet(&data(0, b"ping", true)), Action::Reack { seq: 0, fin: false });
        assert_eq!(r.messages_completed(), 1);
    }

    #[test]
    fn empty_final_fragment_completes_message() {
        let mut r = Receiver::new();
        assert_eq!(
            r.on_packet(&data(0, b"", true)),
            Action::Deliver {
                seq: 0,
                status: MessageStatus::MessageComplete
            }
        );
    }
}
