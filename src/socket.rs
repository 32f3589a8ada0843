//! Packet-oriented datagram socket.
//!
//! [`Datagram`] is the only thing the engine needs from the network: send a
//! byte buffer to an address, receive one with its source address.  It is
//! implemented for `tokio::net::UdpSocket` and for the fault-injecting
//! [`crate::simulator::LossyDatagram`].
//!
//! [`Socket`] is a thin wrapper that speaks [`Packet`] instead of raw bytes
//! and adds deadline-bounded receive.  All protocol logic lives elsewhere;
//! this module owns only byte I/O.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::packet::{MAX_DATAGRAM, Packet, PacketError};

/// An addressed, unreliable datagram channel.
pub trait Datagram: Send + Sync {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn send_datagram(
        &self,
        buf: &[u8],
        dest: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    fn recv_datagram(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
}

impl Datagram for UdpSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    async fn send_datagram(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.send_to(buf, dest).await
    }

    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    /// The datagram could not be encoded, or a received one could not be decoded.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, packet-oriented datagram socket.
#[derive(Debug)]
pub struct Socket<D = UdpSocket> {
    /// Address this socket is bound to (filled in after the OS assigns an ephemeral port).
    pub local_addr: SocketAddr,
    inner: D,
}

impl Socket<UdpSocket> {
    /// Bind a new UDP socket to `local_addr`.
    ///
    /// Passing port 0 lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        Ok(Self::new(inner)?)
    }
}

impl<D: Datagram> Socket<D> {
    /// Wrap an already-bound datagram channel.
    pub fn new(inner: D) -> io::Result<Self> {
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Encode `packet` and send it as a single datagram to `dest`.
    pub async fn send_to(&self, packet: &Packet, dest: SocketAddr) -> Result<(), SocketError> {
        let bytes = packet.encode()?;
        self.inner.send_datagram(&bytes, dest).await?;
        Ok(())
    }

    /// Receive the next datagram and decode it into a [`Packet`].
    ///
    /// Returns `(packet, sender_address)`.  Datagrams that fail to decode are
    /// returned as [`SocketError::Packet`]; the caller decides whether to retry.
    pub async fn recv_from(&self) -> Result<(Packet, SocketAddr), SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_datagram(&mut buf).await?;
        let packet = Packet::decode(&buf[..n])?;
        Ok((packet, addr))
    }

    /// Like [`Socket::recv_from`], but gives up at `deadline`.
    ///
    /// `Ok(None)` means the deadline passed with nothing received.
    pub async fn recv_until(
        &self,
        deadline: Instant,
    ) -> Result<Option<(Packet, SocketAddr)>, SocketError> {
        match tokio::time::timeout_at(deadline, self.recv_from()).await {
            Ok(result) => result.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }
}
