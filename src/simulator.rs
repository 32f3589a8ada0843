//! Fault-injecting network layer.
//!
//! Real networks drop, duplicate, and corrupt packets.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! [`LossyDatagram`] wraps any [`Datagram`] and applies a configurable fault
//! model to every outbound datagram:
//!
//! | Fault            | Description                                        |
//! |------------------|----------------------------------------------------|
//! | Periodic loss    | Drop every `drop_every`-th datagram.               |
//! | Random loss      | Drop a datagram with probability `loss_rate`.      |
//! | Duplication      | Deliver a datagram twice.                          |
//! | Corruption       | Flip one random bit of the datagram.               |
//!
//! Randomness comes from a seeded [`StdRng`], so a failing run can be
//! replayed exactly.  Receives pass straight through; wrap both endpoints to
//! fault both directions.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::socket::Datagram;

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultConfig {
    /// Drop every Nth datagram (1-based count of send attempts).  `None` disables.
    pub drop_every: Option<u64>,
    /// Probability that a datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a delivered datagram is sent twice.
    pub duplicate_rate: f64,
    /// Probability that one bit of a delivered datagram is flipped.
    pub corrupt_rate: f64,
    /// RNG seed.
    pub seed: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        // No faults: a transparent pass-through.
        Self {
            drop_every: None,
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            seed: 0,
        }
    }
}

impl FaultConfig {
    pub fn drop_every(n: u64) -> Self {
        Self {
            drop_every: Some(n),
            ..Self::default()
        }
    }

    pub fn lossy(loss_rate: f64, seed: u64) -> Self {
        Self {
            loss_rate,
            seed,
            ..Self::default()
        }
    }
}

/// What the simulator has done so far.  Shared with the test via `Arc`.
#[derive(Debug, Default)]
pub struct FaultCounters {
    /// Send attempts made by the engine.
    pub attempted: AtomicU64,
    pub dropped: AtomicU64,
    pub duplicated: AtomicU64,
    pub corrupted: AtomicU64,
}

impl FaultCounters {
    pub fn attempted(&self) -> u64 {
        self.attempted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn duplicated(&self) -> u64 {
        self.duplicated.load(Ordering::Relaxed)
    }

    pub fn corrupted(&self) -> u64 {
        self.corrupted.load(Ordering::Relaxed)
    }
}

/// The fate of one outbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Drop,
    Deliver { copies: usize, flip_bit: Option<usize> },
}

/// A fault-injecting wrapper around a datagram channel.
#[derive(Debug)]
pub struct LossyDatagram<D> {
    inner: D,
    config: FaultConfig,
    rng: Mutex<StdRng>,
    counters: Arc<FaultCounters>,
}

impl<D: Datagram> LossyDatagram<D> {
    pub fn new(inner: D, config: FaultConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            inner,
            config,
            rng: Mutex::new(rng),
            counters: Arc::new(FaultCounters::default()),
        }
    }

    /// Handle to the live counters; stays valid after the wrapper moves into a connection.
    pub fn counters(&self) -> Arc<FaultCounters> {
        Arc::clone(&self.counters)
    }

    fn judge(&self, len: usize) -> Verdict {
        let n = self.counters.attempted.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.drop_every.is_some_and(|every| every > 0 && n % every == 0) {
            return Verdict::Drop;
        }

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        if rng.random_bool(self.config.loss_rate) {
            return Verdict::Drop;
        }
        let copies = if rng.random_bool(self.config.duplicate_rate) { 2 } else { 1 };
        let flip_bit = (len > 0 && rng.random_bool(self.config.corrupt_rate))
            .then(|| rng.random_range(0..len * 8));
        Verdict::Deliver { copies, flip_bit }
    }
}

impl<D: Datagram> Datagram for LossyDatagram<D> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn send_datagram(
        &self,
        buf: &[u8],
        dest: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send {
        // Decide synchronously so the RNG lock is never held across an await.
        let verdict = self.judge(buf.len());
        async move {
            match verdict {
                Verdict::Drop => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    log::trace!("[sim] dropped {} bytes to {dest}", buf.len());
                    Ok(buf.len())
                }
                Verdict::Deliver { copies, flip_bit } => {
                    let mut bytes = buf.to_vec();
                    if let Some(bit) = flip_bit {
                        bytes[bit / 8] ^= 1 << (bit % 8);
                        self.counters.corrupted.fetch_add(1, Ordering::Relaxed);
                    }
                    if copies > 1 {
                        self.counters.duplicated.fetch_add(1, Ordering::Relaxed);
                    }
                    for _ in 0..copies {
                        self.inner.send_datagram(&bytes, dest).await?;
                    }
                    Ok(buf.len())
                }
            }
        }
    }

    fn recv_datagram(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send {
        self.inner.recv_datagram(buf)
    }
}
