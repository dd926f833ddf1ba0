//! Packet-oriented stream socket.
//!
//! [`PacketStream`] is a thin wrapper around `tokio::net::TcpStream` that
//! speaks [`crate::packet::Packet`] instead of raw bytes.  The underlying
//! stream never loses or reorders bytes; it may however hand them over in
//! arbitrary chunks, so inbound bytes are accumulated until a whole
//! [`PACKET_LEN`] image is present.  All protocol logic lives elsewhere.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::packet::{Packet, PacketError, PACKET_LEN};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The received bytes could not be decoded as a valid packet.
    #[error("packet decode error: {0}")]
    Packet(#[from] PacketError),
    /// The peer closed its side partway through a packet.
    #[error("stream closed with {0} bytes of a partial packet buffered")]
    Truncated(usize),
}

// ---------------------------------------------------------------------------
// PacketStream
// ---------------------------------------------------------------------------

/// A connected byte-stream socket that sends and receives whole packets.
#[derive(Debug)]
pub struct PacketStream {
    /// Remote end of the connection.
    pub peer_addr: SocketAddr,
    inner: TcpStream,
    /// Bytes received but not yet assembled into a packet.
    pending: Vec<u8>,
}

impl PacketStream {
    /// Wrap an already-connected stream.
    pub fn new(inner: TcpStream) -> Result<Self, SocketError> {
        inner.set_nodelay(true)?;
        let peer_addr = inner.peer_addr()?;
        Ok(Self {
            peer_addr,
            inner,
            pending: Vec::with_capacity(2 * PACKET_LEN),
        })
    }

    /// Open a connection to `addr`.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, SocketError> {
        let inner = TcpStream::connect(addr).await?;
        Self::new(inner)
    }

    /// Accept exactly one connection from `listener`.
    pub async fn accept(listener: &TcpListener) -> Result<Self, SocketError> {
        let (inner, addr) = listener.accept().await?;
        log::info!("Accepted connection from {addr}");
        Self::new(inner)
    }

    /// Write one packet as a single `PACKET_LEN`-byte image.
    pub async fn send(&mut self, packet: &Packet) -> Result<(), SocketError> {
        self.inner.write_all(&packet.encode()).await?;
        Ok(())
    }

    /// Receive the next whole packet.
    ///
    /// Returns `Ok(None)` when the peer closed the stream on a packet
    /// boundary.  Cancel-safe: bytes read before the future is dropped stay
    /// buffered for the next call, so this can sit in a `select!` next to a
    /// timer.
    pub async fn recv(&mut self) -> Result<Option<Packet>, SocketError> {
        loop {
            if self.pending.len() >= PACKET_LEN {
                let packet = Packet::decode(&self.pending[..PACKET_LEN])?;
                self.pending.drain(..PACKET_LEN);
                return Ok(Some(packet));
            }
            let n = self.inner.read_buf(&mut self.pending).await?;
            if n == 0 {
                return match self.pending.len() {
                    0 => Ok(None),
                    partial => Err(SocketError::Truncated(partial)),
                };
            }
        }
    }

    /// Close the write half so the peer sees end-of-stream.
    pub async fn shutdown(&mut self) -> Result<(), SocketError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
