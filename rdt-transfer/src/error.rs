//! Crate-level error type.
//!
//! Loss, reordering and duplicate ACKs are *not* errors; the state machines
//! absorb them.  What reaches this enum is fatal for the transfer: socket or
//! file I/O failure, bad configuration, or a peer that stopped answering.

use thiserror::Error;

use crate::config::ConfigError;
use crate::packet::PacketError;
use crate::socket::SocketError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// File I/O on the transferred file failed.
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("packet framing error: {0}")]
    Packet(#[from] PacketError),

    /// The peer closed its stream before the protocol finished.
    #[error("peer closed the connection during {phase}")]
    PeerClosed { phase: &'static str },

    /// The filename cannot be carried in a single packet or used on disk.
    #[error("invalid transfer filename {0:?}")]
    InvalidFilename(String),
}
