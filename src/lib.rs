//! `rudp`: reliable, ordered message delivery over UDP using stop-and-wait ARQ.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  DATA / FIN   ┌──────────┐
//!  │  Sender  │──────────────▶│ Receiver │
//!  └────┬─────┘               └─────┬────┘
//!       │          ACK              │
//!       │◀──────────────────────────┘
//!       │
//!  ┌────▼──────────────────────────────┐
//!  │           Connection              │
//!  │  (state machine, timer, stats)    │
//!  └────┬──────────────────────────────┘
//!       │ 9-byte header + payload
//!  ┌────▼──────┐      ┌───────────────┐
//!  │  Socket   │──────│   Datagram    │  UdpSocket or LossyDatagram
//!  └───────────┘      └───────────────┘
//! ```
//!
//! Modules:
//! - [`packet`]: wire format and Internet checksum
//! - [`connection`]: handshake, transfer and teardown for one peer
//! - [`state`]: connection finite-state machine
//! - [`sender`]: segmentation and the single in-flight packet
//! - [`receiver`]: in-order acceptance and duplicate detection
//! - [`timer`]: fixed-RTO retransmission with a retry ceiling
//! - [`config`]: tunable timeouts and segment size
//! - [`stats`]: per-connection counters
//! - [`socket`]: datagram channel abstraction
//! - [`simulator`]: loss, duplication and corruption for testing

pub mod config;
pub mod connection;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stats;
pub mod timer;

pub use config::Config;
pub use connection::{ConnError, Connection, Role};
pub use receiver::MessageStatus;
pub use simulator::{FaultConfig, LossyDatagram};
pub use socket::{Datagram, Socket};
pub use state::ConnectionState;
pub use stats::ConnectionStats;
