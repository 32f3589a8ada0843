//! Per-connection lifecycle manager.
//!
//! A [`Connection`] owns the complete state for one logical peer-to-peer
//! session and is the public face of the engine.  Its responsibilities are:
//! - Driving the finite-state machine (see [`crate::state`]).
//! - Running the two-phase handshake (`connect` / `accept`).
//! - Segmenting outbound messages and running the stop-and-wait
//!   send / wait-for-ACK / retransmit loop with [`crate::sender`] and
//!   [`crate::timer`].
//! - Feeding inbound packets through [`crate::receiver`] and sending the
//!   acknowledgements it asks for.
//! - Tearing down with a FIN exchange and a grace window.
//!
//! Every operation takes `&mut self` and runs to completion (or to its
//! deadline) before returning, so at most one packet is ever in flight and
//! the connection record is only ever touched by the call in progress.
//!
//! ```ignore
//! let mut conn = Connection::open("0.0.0.0:0".parse()?).await?;
//! conn.connect(server).await?;
//! conn.send(b"hello").await?;
//! conn.disconnect().await?;
//! conn.close().await?;
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant as WallInstant};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::config::{Config, ConfigError};
use crate::packet::{Kind, Packet};
use crate::receiver::{Action, MessageStatus, Receiver};
use crate::sender::{Sender, segments};
use crate::socket::{Datagram, Socket, SocketError};
use crate::state::{ConnectionState, Event};
use crate::stats::ConnectionStats;
use crate::timer::RetransmitTimer;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Everything a connection operation can fail with.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The datagram channel failed.  The connection should be closed.
    #[error(transparent)]
    Socket(#[from] SocketError),
    /// No SYN+ACK arrived before the retry ceiling.
    #[error("handshake failed: no SYN+ACK after {retries} retransmissions")]
    HandshakeFailed { retries: u32 },
    /// A DATA packet went unacknowledged past the retry ceiling.  The
    /// connection is no longer usable and should be closed.
    #[error("packet {seq} not acknowledged after {retries} retransmissions")]
    MaxRetriesExceeded { seq: u32, retries: u32 },
    /// Nothing deliverable arrived within the idle timeout.
    #[error("no packet from the peer within {0:?}")]
    Timeout(Duration),
    /// The operation is not legal in the current state.
    #[error("cannot {op} while {state}")]
    BadState {
        op: &'static str,
        state: ConnectionState,
    },
    /// `accept` on a handle that already acted as initiator.
    #[error("handle is already configured as an initiator")]
    RoleConflict,
    /// The receive buffer cannot hold one segment.
    #[error("receive buffer holds {got} bytes but a segment may carry {needed}")]
    BufferTooSmall { needed: usize, got: usize },
    #[error("connection is already disconnected")]
    AlreadyDisconnected,
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        Self::Socket(SocketError::Io(e))
    }
}

/// Which side of the handshake this handle has played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Unassigned,
    Initiator,
    Acceptor,
}

/// Result of one bounded wait on the socket.
enum Inbound {
    Packet(Packet, SocketAddr),
    /// Something arrived but was unusable (corrupt, or a transient error).
    Ignored,
    /// The deadline passed.
    Expired,
}

/// Recoverable receive errors, e.g. ICMP unreachable reported by some platforms.
fn is_transient_io_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A handle to a single reliable connection over a datagram channel.
#[derive(Debug)]
pub struct Connection<D = UdpSocket> {
    state: ConnectionState,
    role: Role,
    peer: Option<SocketAddr>,
    sender: Sender,
    receiver: Receiver,
    socket: Socket<D>,
    config: Config,
    established_at: Option<WallInstant>,
    closed_at: Option<WallInstant>,
    stats: ConnectionStats,
}

impl Connection<UdpSocket> {
    /// Bind a UDP socket on `local_addr` with the default configuration.
    pub async fn open(local_addr: SocketAddr) -> Result<Self, ConnError> {
        Self::open_with_config(local_addr, Config::default()).await
    }

    pub async fn open_with_config(local_addr: SocketAddr, config: Config) -> Result<Self, ConnError> {
        config.validate()?;
        let socket = Socket::bind(local_addr).await?;
        Self::with_socket(socket, config)
    }
}

impl<D: Datagram> Connection<D> {
    /// Build a closed connection over an already-bound channel.
    pub fn with_socket(socket: Socket<D>, config: Config) -> Result<Self, ConnError> {
        config.validate()?;
        log::debug!("[rudp] opened on {}", socket.local_addr);
        Ok(Self {
            state: ConnectionState::Closed,
            role: Role::Unassigned,
            peer: None,
            sender: Sender::new(),
            receiver: Receiver::new(),
            socket,
            config,
            established_at: None,
            closed_at: None,
            stats: ConnectionStats::default(),
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Sequence number the next outbound DATA or FIN packet will carry.
    pub fn next_send_seq(&self) -> u32 {
        self.sender.next_seq
    }

    /// Sequence number the receiver will accept next.
    pub fn next_expected_seq(&self) -> u32 {
        self.receiver.expected
    }

    /// Time from handshake to teardown, or to now while still open.
    pub fn duration(&self) -> Option<Duration> {
        let start = self.established_at?;
        Some(self.closed_at.unwrap_or_else(WallInstant::now) - start)
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Active open: send SYN to `peer` until a SYN+ACK comes back.
    ///
    /// Fails with [`ConnError::HandshakeFailed`] once the retry ceiling is
    /// exceeded, leaving the connection `Closed`.
    pub async fn connect(&mut self, peer: SocketAddr) -> Result<(), ConnError> {
        self.check(Event::Connect, "connect")?;
        self.role = Role::Initiator;
        self.apply(Event::Connect);
        self.peer = Some(peer);

        let result = self.await_syn_ack(peer).await;
        match &result {
            Ok(()) => {
                self.apply(Event::SynAckReceived);
                self.on_established();
                log::debug!("[rudp] connected to {peer}");
            }
            Err(e) => {
                self.apply(Event::HandshakeFailed);
                self.peer = None;
                log::debug!("[rudp] connect to {peer} failed: {e}");
            }
        }
        result
    }

    async fn await_syn_ack(&mut self, peer: SocketAddr) -> Result<(), ConnError> {
        let syn = Packet::syn();
        self.transmit(&syn, peer).await?;
        log::debug!("[rudp] → SYN to {peer}");
        let mut timer = RetransmitTimer::start(self.config.retry_policy());

        loop {
            match self.next_inbound(timer.deadline()).await? {
                Inbound::Packet(pkt, from) if from == peer && pkt.kind() == Some(Kind::SynAck) => {
                    log::debug!("[rudp] ← SYN+ACK");
                    return Ok(());
                }
                Inbound::Packet(pkt, from) => {
                    self.stats.protocol_dropped += 1;
                    log::trace!("[rudp] connecting: dropped {:?} from {from}", pkt.kind());
                }
                Inbound::Ignored => {}
                Inbound::Expired => {
                    timer
                        .on_timeout()
                        .map_err(|e| ConnError::HandshakeFailed { retries: e.retries })?;
                    self.stats.retransmissions += 1;
                    self.transmit(&syn, peer).await?;
                    log::debug!("[rudp] → SYN (retry {})", timer.retries());
                }
            }
        }
    }

    /// Passive open: wait for a SYN and answer it with SYN+ACK.
    ///
    /// Bounded by the idle timeout; a timed-out accept leaves the handle
    /// `Listening` and may be retried.  The acceptor does not wait for a
    /// third handshake leg, so if its SYN+ACK is lost it believes the
    /// connection is open until its next receive times out.
    pub async fn accept(&mut self) -> Result<SocketAddr, ConnError> {
        if self.role == Role::Initiator {
            return Err(ConnError::RoleConflict);
        }
        self.check(Event::Listen, "accept")?;
        self.role = Role::Acceptor;
        self.apply(Event::Listen);

        let deadline = Instant::now() + self.config.idle_timeout;
        loop {
            match self.next_inbound(deadline).await? {
                Inbound::Packet(pkt, from) if pkt.kind() == Some(Kind::Syn) => {
                    log::debug!("[rudp] ← SYN from {from}");
                    self.transmit(&Packet::syn_ack(), from).await?;
                    log::debug!("[rudp] → SYN+ACK to {from}");
                    self.peer = Some(from);
                    self.apply(Event::SynReceived);
                    self.on_established();
                    return Ok(from);
                }
                Inbound::Packet(pkt, from) => {
                    self.stats.protocol_dropped += 1;
                    log::trace!("[rudp] listening: dropped {:?} from {from}", pkt.kind());
                }
                Inbound::Ignored => {}
                Inbound::Expired => return Err(ConnError::Timeout(self.config.idle_timeout)),
            }
        }
    }

    fn on_established(&mut self) {
        self.sender = Sender::new();
        self.receiver = Receiver::new();
        self.established_at = Some(WallInstant::now());
        self.closed_at = None;
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Send `buf` as one message, one acknowledged segment at a time.
    ///
    /// Returns the number of payload bytes delivered.  On
    /// [`ConnError::MaxRetriesExceeded`] the peer may have received a prefix
    /// of the message; the connection must be closed.
    pub async fn send(&mut self, buf: &[u8]) -> Result<usize, ConnError> {
        self.require(self.state.can_send(), "send")?;

        let mut sent = 0;
        for segment in segments(buf, self.config.mss) {
            let pkt = self.sender.build_data_packet(segment);
            log::debug!(
                "[rudp] → DATA seq={} len={} last={}",
                pkt.seq(),
                segment.bytes.len(),
                segment.last
            );
            self.send_reliably(pkt, false).await?;
            sent += segment.bytes.len();
            self.stats.bytes_sent += segment.bytes.len() as u64;
        }
        self.stats.messages_sent += 1;
        Ok(sent)
    }

    /// Wait for one in-order fragment and copy it into `out`.
    ///
    /// `out` must hold at least one maximum-size segment.  Duplicates are
    /// re-acknowledged and skipped, corrupt and out-of-order packets are
    /// dropped, all within one idle-timeout deadline.  On a connection the
    /// peer is tearing down this keeps answering retransmitted FINs, returning
    /// [`MessageStatus::PeerDisconnected`] for each.
    pub async fn recv(&mut self, out: &mut [u8]) -> Result<(usize, MessageStatus), ConnError> {
        self.require(self.state.can_recv(), "recv")?;
        if out.len() < self.config.mss {
            return Err(ConnError::BufferTooSmall {
                needed: self.config.mss,
                got: out.len(),
            });
        }
        let peer = self.peer_addr("recv")?;
        let deadline = Instant::now() + self.config.idle_timeout;

        loop {
            let pkt = match self.next_inbound(deadline).await? {
                Inbound::Packet(pkt, from) if from == peer => pkt,
                Inbound::Packet(_, from) => {
                    self.stats.protocol_dropped += 1;
                    log::trace!("[rudp] dropped packet from stranger {from}");
                    continue;
                }
                Inbound::Ignored => continue,
                Inbound::Expired => return Err(ConnError::Timeout(self.config.idle_timeout)),
            };

            // A peer with a larger segment size; leave the packet unacknowledged
            // so it is retransmitted once the caller offers a bigger buffer.
            if pkt.payload.len() > out.len() {
                return Err(ConnError::BufferTooSmall {
                    needed: pkt.payload.len(),
                    got: out.len(),
                });
            }

            match self.receiver.on_packet(&pkt) {
                Action::Deliver { seq, status } => {
                    let n = pkt.payload.len();
                    out[..n].copy_from_slice(&pkt.payload);
                    self.send_ack(seq, peer).await?;
                    self.stats.bytes_received += n as u64;
                    if status == MessageStatus::MessageComplete {
                        self.stats.messages_received += 1;
                    }
                    log::debug!("[rudp] ← DATA seq={seq} len={n} {status:?}; → ACK");
                    return Ok((n, status));
                }
                Action::PeerFin { seq } => {
                    self.send_ack(seq, peer).await?;
                    self.apply(Event::PeerFin);
                    log::debug!("[rudp] ← FIN seq={seq}; → ACK");
                    return Ok((0, MessageStatus::PeerDisconnected));
                }
                Action::Reack { seq, fin } => {
                    self.stats.duplicates += 1;
                    self.send_ack(seq, peer).await?;
                    log::debug!("[rudp] ← duplicate seq={seq}; → ACK");
                    if fin && self.state == ConnectionState::Closing {
                        return Ok((0, MessageStatus::PeerDisconnected));
                    }
                }
                Action::Drop(reason) => {
                    self.stats.record_drop(reason);
                    log::trace!("[rudp] dropped seq={} ({reason:?})", pkt.seq());
                }
            }
        }
    }

    /// Receive fragments until a whole message has arrived.
    ///
    /// Returns `None` when the peer disconnects; a partially received
    /// message is discarded in that case.
    pub async fn recv_message(&mut self) -> Result<Option<Vec<u8>>, ConnError> {
        let mut buf = vec![0u8; self.config.mss];
        let mut message = Vec::new();
        loop {
            let (n, status) = match self.recv(&mut buf).await {
                Ok(r) => r,
                Err(ConnError::BufferTooSmall { needed, got }) if needed > got => {
                    buf.resize(needed, 0);
                    continue;
                }
                Err(e) => return Err(e),
            };
            match status {
                MessageStatus::Continuation => message.extend_from_slice(&buf[..n]),
                MessageStatus::MessageComplete => {
                    message.extend_from_slice(&buf[..n]);
                    return Ok(Some(message));
                }
                MessageStatus::PeerDisconnected => return Ok(None),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Orderly teardown.
    ///
    /// On an established connection this sends a FIN, waits for its ACK, and
    /// lingers for the grace window answering retransmitted FINs.  If the
    /// FIN is never acknowledged the connection is force-closed.  On a
    /// connection the peer already tore down it only lingers.  Either way the
    /// connection ends `Closed`.
    pub async fn disconnect(&mut self) -> Result<(), ConnError> {
        match self.state {
            ConnectionState::Established => {
                self.receiver.shutdown();
                let fin = self.sender.build_fin();
                log::debug!("[rudp] → FIN seq={}", fin.seq());
                let acked = match self.send_reliably(fin, true).await {
                    Ok(()) => true,
                    Err(ConnError::MaxRetriesExceeded { .. }) => {
                        log::warn!("[rudp] FIN not acknowledged; force-closing");
                        false
                    }
                    Err(e) => return Err(e),
                };
                self.apply(Event::LocalFin);
                if acked {
                    self.linger().await?;
                }
            }
            ConnectionState::Closing => self.linger().await?,
            _ => return Err(ConnError::AlreadyDisconnected),
        }
        self.apply(Event::TeardownComplete);
        self.closed_at = Some(WallInstant::now());
        log::debug!("[rudp] closed; {}", self.stats);
        Ok(())
    }

    /// Release the connection.  Valid in any state; an open connection is
    /// torn down with [`Connection::disconnect`] first.
    pub async fn close(mut self) -> Result<(), ConnError> {
        match self.disconnect().await {
            Ok(()) | Err(ConnError::AlreadyDisconnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Answer retransmitted FINs and duplicate data until the peer has been
    /// quiet for the grace window.
    async fn linger(&mut self) -> Result<(), ConnError> {
        let peer = self.peer_addr("disconnect")?;
        let mut deadline = Instant::now() + self.config.teardown_grace;
        loop {
            let pkt = match self.next_inbound(deadline).await? {
                Inbound::Packet(pkt, from) if from == peer => pkt,
                Inbound::Packet(..) => {
                    self.stats.protocol_dropped += 1;
                    continue;
                }
                Inbound::Ignored => continue,
                Inbound::Expired => return Ok(()),
            };
            match self.receiver.on_packet(&pkt) {
                Action::Reack { seq, fin } => {
                    self.stats.duplicates += 1;
                    self.send_ack(seq, peer).await?;
                    if fin {
                        deadline = Instant::now() + self.config.teardown_grace;
                    }
                }
                Action::PeerFin { seq } => {
                    self.send_ack(seq, peer).await?;
                    deadline = Instant::now() + self.config.teardown_grace;
                }
                // New data is refused once shut down, so nothing is delivered here.
                Action::Deliver { .. } => {}
                Action::Drop(reason) => self.stats.record_drop(reason),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Transmit `pkt` and block until the peer acknowledges it, retransmitting
    /// every RTO up to the retry ceiling.
    ///
    /// While waiting, duplicates of the peer's earlier packets are
    /// re-acknowledged.  A peer FIN is accepted only when `accept_fin` is set
    /// (we are tearing down ourselves); anything else is dropped.
    async fn send_reliably(&mut self, pkt: Packet, accept_fin: bool) -> Result<(), ConnError> {
        let peer = self.peer_addr("send")?;
        let seq = pkt.seq();
        self.transmit(&pkt, peer).await?;
        self.sender.record_sent(pkt.clone());
        let mut timer = RetransmitTimer::start(self.config.retry_policy());

        loop {
            let reply = match self.next_inbound(timer.deadline()).await? {
                Inbound::Packet(reply, from) if from == peer => reply,
                Inbound::Packet(..) => {
                    self.stats.protocol_dropped += 1;
                    continue;
                }
                Inbound::Ignored => continue,
                Inbound::Expired => {
                    if let Err(e) = timer.on_timeout() {
                        self.sender.abandon();
                        return Err(ConnError::MaxRetriesExceeded {
                            seq,
                            retries: e.retries,
                        });
                    }
                    self.sender.on_retransmit();
                    self.stats.retransmissions += 1;
                    self.transmit(&pkt, peer).await?;
                    log::debug!("[rudp] → seq={seq} (retry {})", timer.retries());
                    continue;
                }
            };

            if reply.kind() == Some(Kind::Ack) {
                if let Some(rtt) = self.sender.on_ack(reply.seq()) {
                    log::debug!("[rudp] ← ACK seq={seq} rtt={rtt:?}");
                    return Ok(());
                }
                self.stats.protocol_dropped += 1;
                log::trace!("[rudp] stale ACK seq={}", reply.seq());
                continue;
            }

            let action = if accept_fin {
                self.receiver.on_packet(&reply)
            } else {
                self.receiver.judge(&reply)
            };
            match action {
                Action::Reack { seq, .. } => {
                    self.stats.duplicates += 1;
                    self.send_ack(seq, peer).await?;
                }
                Action::PeerFin { seq } if accept_fin => {
                    log::debug!("[rudp] ← FIN seq={seq} while closing; → ACK");
                    self.send_ack(seq, peer).await?;
                }
                Action::Drop(reason) => self.stats.record_drop(reason),
                // The peer must wait for our ACK exchange to finish.
                Action::Deliver { .. } | Action::PeerFin { .. } => self.stats.protocol_dropped += 1,
            }
        }
    }

    async fn send_ack(&mut self, seq: u32, peer: SocketAddr) -> Result<(), ConnError> {
        self.transmit(&Packet::ack(seq), peer).await
    }

    async fn transmit(&mut self, pkt: &Packet, dest: SocketAddr) -> Result<(), ConnError> {
        self.socket.send_to(pkt, dest).await?;
        self.stats.packets_sent += 1;
        Ok(())
    }

    /// Wait for the next datagram until `deadline`, absorbing validation
    /// failures and transient errors.
    async fn next_inbound(&mut self, deadline: Instant) -> Result<Inbound, ConnError> {
        match self.socket.recv_until(deadline).await {
            Ok(Some((pkt, from))) => {
                self.stats.packets_received += 1;
                Ok(Inbound::Packet(pkt, from))
            }
            Ok(None) => Ok(Inbound::Expired),
            Err(SocketError::Packet(e)) => {
                self.stats.corrupt_dropped += 1;
                log::trace!("[rudp] dropped invalid datagram: {e}");
                Ok(Inbound::Ignored)
            }
            Err(SocketError::Io(e)) if is_transient_io_error(&e) => {
                log::debug!("[rudp] transient receive error: {e}");
                Ok(Inbound::Ignored)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn peer_addr(&self, op: &'static str) -> Result<SocketAddr, ConnError> {
        self.peer.ok_or(ConnError::BadState {
            op,
            state: self.state,
        })
    }

    fn require(&self, allowed: bool, op: &'static str) -> Result<(), ConnError> {
        if allowed {
            Ok(())
        } else {
            Err(ConnError::BadState {
                op,
                state: self.state,
            })
        }
    }

    fn check(&self, event: Event, op: &'static str) -> Result<ConnectionState, ConnError> {
        self.state.on_event(event).ok_or(ConnError::BadState {
            op,
            state: self.state,
        })
    }

    fn apply(&mut self, event: Event) {
        match self.state.on_event(event) {
            Some(next) => {
                log::debug!("[rudp] {} → {next} on {event:?}", self.state);
                self.state = next;
            }
            None => log::warn!("[rudp] ignoring {event:?} in {}", self.state),
        }
    }
}
