//! Tunable protocol parameters.
//!
//! [`Config`] carries every knob the engine recognises.  Values start from
//! [`Config::default`] and are adjusted with the `with_*` setters, which is
//! how the CLI maps its flags onto the engine.

use std::time::Duration;

use thiserror::Error;

use crate::packet::MAX_PAYLOAD;
use crate::timer::RetryPolicy;

pub const DEFAULT_RTO: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_secs(1);
pub const DEFAULT_MSS: usize = 8192;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// How long to wait for an ACK (or SYN+ACK) before retransmitting.
    pub rto: Duration,
    /// Retransmissions allowed per packet after the first transmission.
    pub max_retries: u32,
    /// Upper bound on a single `recv` or `accept`.
    pub idle_timeout: Duration,
    /// How long a closing connection keeps answering retransmitted FINs.
    pub teardown_grace: Duration,
    /// Largest payload carried by one packet.
    pub mss: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rto: DEFAULT_RTO,
            max_retries: DEFAULT_MAX_RETRIES,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
            mss: DEFAULT_MSS,
        }
    }
}

impl Config {
    pub fn with_rto(mut self, rto: Duration) -> Self {
        self.rto = rto;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_teardown_grace(mut self, teardown_grace: Duration) -> Self {
        self.teardown_grace = teardown_grace;
        self
    }

    pub fn with_mss(mut self, mss: usize) -> Self {
        self.mss = mss;
        self
    }

    /// Retransmission parameters for the ack-wait loops.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            rto: self.rto,
            max_retries: self.max_retries,
        }
    }

    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mss == 0 || self.mss > MAX_PAYLOAD {
            return Err(ConfigError::SegmentSize(self.mss));
        }
        if self.rto.is_zero() {
            return Err(ConfigError::ZeroDuration("rto"));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("idle_timeout"));
        }
        if self.teardown_grace.is_zero() {
            return Err(ConfigError::ZeroDuration("teardown_grace"));
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("maximum segment size must be between 1 and {MAX_PAYLOAD}, got {0}")]
    SegmentSize(usize),
    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = Config::default();
        assert_eq!(c.rto, Duration::from_secs(1));
        assert_eq!(c.max_retries, 5);
        assert_eq!(c.mss, 8192);
        assert!(c.idle_timeout > c.rto);
        assert_eq!(c.validate(), Ok(()));
    }

    #[test]
    fn setters_chain() {
        let c = Config::default()
            .with_rto(Duration::from_millis(50))
            .with_max_retries(2)
            .with_mss(100);
        assert_eq!(c.retry_policy(), RetryPolicy {
            rto: Duration::from_millis(50),
            max_retries: 2,
        });
        assert_eq!(c.mss, 100);
    }

    #[test]
    fn rejects_bad_segment_size() {
        assert_eq!(
            Config::default().with_mss(0).validate(),
            Err(ConfigError::SegmentSize(0))
        );
        assert_eq!(
            Config::default().with_mss(MAX_PAYLOAD + 1).validate(),
            Err(ConfigError::SegmentSize(MAX_PAYLOAD + 1))
        );
        assert_eq!(Config::default().with_mss(MAX_PAYLOAD).validate(), Ok(()));
    }

    #[test]
    fn rejects_zero_durations() {
        assert_eq!(
            Config::default().with_rto(Duration::ZERO).validate(),
            Err(ConfigError::ZeroDuration("rto"))
        );
        assert_eq!(
            Config::default()
                .with_teardown_grace(Duration::ZERO)
                .validate(),
            Err(ConfigError::ZeroDuration("teardown_grace"))
        );
    }
}
