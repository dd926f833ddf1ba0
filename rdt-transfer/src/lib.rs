//! `rdt-transfer`: reliable file transfer with TCP-style congestion control
//! over a lossy, delaying relay.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  DATA/EOT/FIN   ┌──────────────────┐  DATA/EOT/FIN  ┌──────────┐
//!  │  Sender  │────────────────▶│ NetworkEmulator  │───────────────▶│ Receiver │
//!  │ (cwnd,   │◀────────────────│ (drop + delay)   │◀───────────────│ (rwnd,   │
//!  │  RTT)    │      ACKs       └──────────────────┘      ACKs      │  reorder)│
//!  └────┬─────┘                                                    └────┬─────┘
//!       │ connection::run_sender                  connection::run_receiver │
//!  ┌────▼─────────────┐                                   ┌──────────────▼───┐
//!  │   PacketStream   │  (fixed 532-byte packets over TCP) │   PacketStream   │
//!  └──────────────────┘                                   └──────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]: wire format (serialise / deserialise)
//! - [`socket`]: whole-packet reads and writes over a byte stream
//! - [`timer`]: countdown timer and RTT-based timeout estimation
//! - [`window`]: send window, reorder buffer, delay queue
//! - [`state`]: finite-state-machine types
//! - [`sender`]: send-side congestion control state machine
//! - [`receiver`]: receive-side reordering and delayed-ACK state machine
//! - [`emulator`]: lossy, delaying relay between the two
//! - [`connection`]: async control loops tying state machines to sockets
//! - [`transfer_log`]: per-packet transfer log
//! - [`config`]: connection file and endpoint tunables
//! - [`error`]: crate error type

pub mod config;
pub mod connection;
pub mod emulator;
pub mod error;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod socket;
pub mod state;
pub mod timer;
pub mod transfer_log;
pub mod window;

pub use error::{Error, Result};
