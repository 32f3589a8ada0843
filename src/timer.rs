//! Retransmission timer and retry ceiling.
//!
//! Reliable delivery requires that an unacknowledged packet is re-sent if no
//! ACK arrives within a bounded time.  The policy here is a
//! fixed retransmission timeout (no RTT estimation, no back-off)
//! and a hard ceiling on retransmissions per packet.
//!
//! [`RetransmitTimer`] is armed once per packet.  The connection waits on
//! [`RetransmitTimer::deadline`]; each time the deadline passes it calls
//! [`RetransmitTimer::on_timeout`], which either re-arms the timer for the
//! next retransmission or reports that the ceiling has been exceeded.
//! Stray packets that arrive while waiting do not push the deadline back.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Retransmission parameters, derived from [`crate::config::Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed retransmission timeout.
    pub rto: Duration,
    /// Retransmissions allowed after the first transmission.
    pub max_retries: u32,
}

/// The retry counter passed the ceiling.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no acknowledgement after {retries} retransmissions")]
pub struct RetriesExhausted {
    pub retries: u32,
}

/// A running retransmit timer for the single in-flight packet.
#[derive(Debug)]
pub struct RetransmitTimer {
    policy: RetryPolicy,
    retries: u32,
    deadline: Instant,
}

impl RetransmitTimer {
    /// Arm the timer for a packet that has just been transmitted.
    pub fn start(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retries: 0,
            deadline: Instant::now() + policy.rto,
        }
    }

    /// When the current wait for an acknowledgement ends.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Retransmissions performed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Record a timeout.
    ///
    /// On `Ok` the caller must retransmit; the timer has been re-armed for
    /// one more RTO.  On `Err` the packet is abandoned.
    pub fn on_timeout(&mut self) -> Result<(), RetriesExhausted> {
        self.retries += 1;
        if self.retries > self.policy.max_retries {
            return Err(RetriesExhausted {
                retries: self.retries - 1,
            });
        }
        self.deadline = Instant::now() + self.policy.rto;
        Ok(())
    }
}
