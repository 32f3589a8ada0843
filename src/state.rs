//! Connection finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::connection::Connection`] can
//! occupy and the events that move it between them.  [`ConnectionState::on_event`]
//! is the single source of truth for which transitions are legal; the
//! connection consults it before doing any I/O, so an operation invoked in
//! the wrong state fails without touching the socket.
//!
//! ```text
//!  CLOSED ──connect──▶ CONNECTING ──SYN+ACK──▶ ESTABLISHED
//!    │ ▲                    │                     │   │
//!    │ └──── retries ───────┘                     │   │ local FIN acked
//!    │       exhausted                  peer FIN  │   │
//!  accept                                         ▼   ▼
//!    ▼                                           CLOSING ──grace──▶ CLOSED
//!  LISTENING ──SYN──▶ ESTABLISHED
//! ```

use std::fmt;

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection exists; initial and terminal state.
    #[default]
    Closed,
    /// Acceptor waiting for a SYN.
    Listening,
    /// Initiator has sent SYN and is waiting for SYN+ACK.
    Connecting,
    /// Handshake complete; data transfer in progress.
    Established,
    /// A FIN has been exchanged; answering stragglers until the grace window ends.
    Closing,
}

/// Inputs that drive the FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Application called `connect`.
    Connect,
    /// Application called `accept`.
    Listen,
    /// Initiator received SYN+ACK.
    SynAckReceived,
    /// Acceptor received SYN.
    SynReceived,
    /// Initiator ran out of SYN retransmissions.
    HandshakeFailed,
    /// Our FIN was acknowledged.
    LocalFin,
    /// Peer's FIN arrived in order.
    PeerFin,
    /// Grace window elapsed.
    TeardownComplete,
}

impl ConnectionState {
    /// The state reached by applying `event`, or `None` if the transition is
    /// illegal from `self`.
    pub fn on_event(self, event: Event) -> Option<Self> {
        use ConnectionState::*;
        use Event::*;

        match (self, event) {
            (Closed, Connect) => Some(Connecting),
            (Connecting, SynAckReceived) => Some(Established),
            (Connecting, HandshakeFailed) => Some(Closed),
            (Closed | Listening, Listen) => Some(Listening),
            (Listening, SynReceived) => Some(Established),
            (Established, LocalFin | PeerFin) => Some(Closing),
            (Closing, TeardownComplete) => Some(Closed),
            _ => None,
        }
    }

    /// `send` is legal only here.
    pub fn can_send(self) -> bool {
        self == ConnectionState::Established
    }

    /// `recv` also serves a connection the peer is tearing down, so
    /// retransmitted FINs keep getting acknowledged.
    pub fn can_recv(self) -> bool {
        matches!(self, ConnectionState::Established | ConnectionState::Closing)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Listening => "LISTENING",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}
