//! Endpoint drivers: one socket, one state machine, one control loop.
//!
//! ```text
//!          ┌──────────── select! ────────────┐
//!          │                                 │
//!   stream.recv()                    timer.expired()
//!          │                                 │
//!   on_packet(&pkt)                    on_timeout()
//!          └──────────┬──────────────────────┘
//!                     ▼
//!          packets to send → stream.send()
//! ```
//!
//! The state machines in [`crate::sender`] and [`crate::receiver`] never
//! touch the socket.  The loops here wait on "packet ready" and "timer
//! expired" together, feed whichever comes first to the state machine,
//! write out what it returns, and record every packet in the
//! [`TransferLog`].

use std::fs::File;
use std::path::Path;

use tokio::net::{TcpListener, ToSocketAddrs};

use crate::config::{ReceiverConfig, SenderConfig};
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::receiver::{FileSink, Receiver, ReceiverSummary, SegmentSink};
use crate::sender::{Sender, SenderSummary};
use crate::socket::PacketStream;
use crate::transfer_log::{Direction, TransferLog, TransferRecord};

// ---------------------------------------------------------------------------
// Sender side
// ---------------------------------------------------------------------------

/// Drive `sender` over `stream` until the connection is closed.
pub async fn run_sender<R: std::io::Read>(
    stream: &mut PacketStream,
    sender: &mut Sender<R>,
    log: &mut TransferLog,
) -> Result<SenderSummary> {
    let syn = sender.open();
    transmit_sender(stream, sender, log, vec![syn]).await?;

    while !sender.is_closed() {
        let expiry = sender.timer().expired();
        tokio::select! {
            res = stream.recv() => match res? {
                Some(packet) => {
                    log.record(sender_record(sender, Direction::Recv, &packet));
                    let out = sender.on_packet(&packet)?;
                    transmit_sender(stream, sender, log, out).await?;
                }
                None => sender.on_peer_closed()?,
            },
            _ = expiry => {
                let out = sender.on_timeout()?;
                if !out.is_empty() {
                    log.note("Timeout: Retransmit");
                }
                transmit_sender(stream, sender, log, out).await?;
            }
        }
    }

    log.note("Connection closed");
    if let Err(e) = stream.shutdown().await {
        log::debug!("[sender] shutdown: {e}");
    }
    let summary = sender.summary();
    log::info!(
        "[sender] sent {} bytes in {} segments ({} retransmitted, {} fast, {} timeouts)",
        summary.bytes,
        summary.segments,
        summary.retransmissions,
        summary.fast_retransmits,
        summary.timeouts
    );
    Ok(summary)
}

/// Connect to `addr` and send the file at `path`.
///
/// Only the final component of `path` travels as the filename.
pub async fn send_file<A: ToSocketAddrs>(
    addr: A,
    path: &Path,
    config: &SenderConfig,
    log: &mut TransferLog,
) -> Result<SenderSummary> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::InvalidFilename(path.display().to_string()))?;
    let file = File::open(path)?;
    let mut sender = Sender::new(name, file, config)?;

    let mut stream = PacketStream::connect(addr).await?;
    log::info!("[sender] connected to {}", stream.peer_addr);
    run_sender(&mut stream, &mut sender, log).await
}

async fn transmit_sender<R: std::io::Read>(
    stream: &mut PacketStream,
    sender: &Sender<R>,
    log: &mut TransferLog,
    packets: Vec<Packet>,
) -> Result<()> {
    for packet in packets {
        stream.send(&packet).await?;
        log.record(sender_record(sender, Direction::Send, &packet));
    }
    Ok(())
}

fn sender_record<R: std::io::Read>(
    sender: &Sender<R>,
    direction: Direction,
    packet: &Packet,
) -> TransferRecord {
    TransferRecord::new(
        direction,
        packet,
        sender.phase().label(),
        sender.window().len(),
        sender.rtt().timeout(),
    )
}

// ---------------------------------------------------------------------------
// Receiver side
// ---------------------------------------------------------------------------

/// Drive `receiver` over `stream` until the connection is closed.
pub async fn run_receiver<S: SegmentSink>(
    stream: &mut PacketStream,
    receiver: &mut Receiver<S>,
    log: &mut TransferLog,
) -> Result<ReceiverSummary> {
    while !receiver.is_closed() {
        let expiry = receiver.timer().expired();
        tokio::select! {
            res = stream.recv() => match res? {
                Some(packet) => {
                    log.record(receiver_record(receiver, Direction::Recv, &packet));
                    let out = receiver.on_packet(&packet)?;
                    transmit_receiver(stream, receiver, log, out).await?;
                }
                None => receiver.on_peer_closed()?,
            },
            _ = expiry => {
                let out = receiver.on_timeout()?;
                transmit_receiver(stream, receiver, log, out).await?;
            }
        }
    }

    log.note("Connection closed");
    if let Err(e) = stream.shutdown().await {
        log::debug!("[receiver] shutdown: {e}");
    }
    let summary = receiver.summary();
    log::info!(
        "[receiver] received {} bytes in {} segments ({} buffered out of order, {} dropped, {} stale)",
        summary.bytes,
        summary.segments,
        summary.buffered,
        summary.dropped,
        summary.stale
    );
    Ok(summary)
}

/// Accept one sender on `listener` and write its file into
/// `config.output_dir`.
pub async fn receive_file(
    listener: &TcpListener,
    config: &ReceiverConfig,
    log: &mut TransferLog,
) -> Result<ReceiverSummary> {
    let mut stream = PacketStream::accept(listener).await?;
    let mut receiver = Receiver::new(FileSink::new(config.output_dir.clone()), config);
    let summary = run_receiver(&mut stream, &mut receiver, log).await?;
    if let Some(path) = receiver.sink().path() {
        log::info!("[receiver] finished receiving {}", path.display());
    }
    Ok(summary)
}

async fn transmit_receiver<S: SegmentSink>(
    stream: &mut PacketStream,
    receiver: &Receiver<S>,
    log: &mut TransferLog,
    packets: Vec<Packet>,
) -> Result<()> {
    for packet in packets {
        stream.send(&packet).await?;
        log.record(receiver_record(receiver, Direction::Send, &packet));
    }
    Ok(())
}

fn receiver_record<S: SegmentSink>(
    receiver: &Receiver<S>,
    direction: Direction,
    packet: &Packet,
) -> TransferRecord {
    TransferRecord::new(
        direction,
        packet,
        receiver.phase().label(),
        receiver.buffer().used(),
        receiver.timer_interval(),
    )
}
