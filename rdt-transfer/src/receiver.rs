//! Receive-side state machine: handshake, reordering, delayed ACKs, close.
//!
//! [`Receiver`] accepts segments in any order, hands in-order bytes to a
//! [`SegmentSink`], and acknowledges cumulatively.  Out-of-order segments
//! wait in a [`ReorderBuffer`] whose free credit is the advertised window.
//!
//! # ACK policy
//!
//! ```text
//!  in-order segment   deliver + drain buffer; timer idle → arm ack_delay
//!                                             timer armed → disarm, ACK now
//!  future segment     disarm, duplicate ACK now, buffer if credit remains
//!  stale segment      resend current cumulative ACK
//!  timer fires        send the pending cumulative ACK
//! ```
//!
//! Every second in-order arrival is therefore acknowledged at once, and a
//! lone one waits at most `ack_delay` for a partner.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;

use crate::config::ReceiverConfig;
use crate::error::{Error, Result};
use crate::packet::{seq_lt, Packet, PacketType};
use crate::state::ReceiverPhase;
use crate::timer::CountdownTimer;
use crate::window::{BufferOutcome, ReorderBuffer};

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Destination for the reconstructed byte stream.
pub trait SegmentSink {
    /// The filename segment arrived; prepare to receive `name`.
    fn begin(&mut self, name: &str) -> Result<()>;
    /// Append the in-order payload that starts at `seq`.
    fn deliver(&mut self, seq: u32, data: &[u8]) -> Result<()>;
    /// The sender's FIN was delivered; nothing more will follow.
    fn finish(&mut self) -> Result<()>;
}

/// Writes the received file into a directory.
///
/// Only the final path component of the received name is used, so a
/// sender cannot place files outside `dir`.
#[derive(Debug)]
pub struct FileSink {
    dir: PathBuf,
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            path: None,
            writer: None,
        }
    }

    /// Output path, once the filename has arrived.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl SegmentSink for FileSink {
    fn begin(&mut self, name: &str) -> Result<()> {
        let safe = Path::new(name)
            .file_name()
            .ok_or_else(|| Error::InvalidFilename(name.to_string()))?;
        let path = self.dir.join(safe);
        let file = File::create(&path)?;
        log::info!("[receiver] writing {}", path.display());
        self.writer = Some(BufWriter::new(file));
        self.path = Some(path);
        Ok(())
    }

    fn deliver(&mut self, _seq: u32, data: &[u8]) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(data)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Keeps the received stream in memory, recording where each delivery
/// started.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub name: Option<String>,
    pub data: Vec<u8>,
    /// `(seq, len)` of every delivery, in order.
    pub deliveries: Vec<(u32, usize)>,
    pub finished: bool,
}

impl SegmentSink for MemorySink {
    fn begin(&mut self, name: &str) -> Result<()> {
        self.name = Some(name.to_string());
        Ok(())
    }

    fn deliver(&mut self, seq: u32, data: &[u8]) -> Result<()> {
        self.deliveries.push((seq, data.len()));
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Counters reported once the transfer ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverSummary {
    pub filename: Option<String>,
    /// File bytes delivered to the sink.
    pub bytes: u64,
    /// Data segments delivered in order, including drained ones.
    pub segments: u64,
    /// Segments parked in the reorder buffer.
    pub buffered: u64,
    /// Future segments dropped for lack of credit.
    pub dropped: u64,
    /// Segments that arrived after their data was already delivered.
    pub stale: u64,
}

/// Receive-side state for a single file transfer.
#[derive(Debug)]
pub struct Receiver<S> {
    sink: S,
    phase: ReceiverPhase,

    isn: u32,
    /// Our next sequence number; `AckNum` the sender must echo.
    next_seq: u32,
    /// Next byte expected from the sender.
    expected: u32,
    /// Start of the most recently delivered segment.
    last_acked_seq: u32,
    buffer: ReorderBuffer,

    timer: CountdownTimer,
    ack_delay: Duration,
    control_timeout: Duration,
    retries: u32,
    fin_retries: u32,

    /// Handshake reply, kept for retransmission.
    synack: Option<Packet>,
    /// Own FIN, kept for retransmission.
    fin: Option<Packet>,
    final_ack: Option<Packet>,

    summary: ReceiverSummary,
}

impl<S: SegmentSink> Receiver<S> {
    pub fn new(sink: S, config: &ReceiverConfig) -> Self {
        let isn: u32 = rand::rng().random();
        Self::with_isn(sink, config, isn)
    }

    pub fn with_isn(sink: S, config: &ReceiverConfig, isn: u32) -> Self {
        Self {
            sink,
            phase: ReceiverPhase::Handshake,
            isn,
            next_seq: isn,
            expected: 0,
            last_acked_seq: 0,
            buffer: ReorderBuffer::new(config.window.max(1) as usize),
            timer: CountdownTimer::new(),
            ack_delay: config.ack_delay,
            control_timeout: config.control_timeout,
            retries: 0,
            fin_retries: config.fin_retries,
            synack: None,
            fin: None,
            final_ack: None,
            summary: ReceiverSummary::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn phase(&self) -> ReceiverPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == ReceiverPhase::Closed
    }

    pub fn isn(&self) -> u32 {
        self.isn
    }

    /// Next byte expected from the sender.
    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn last_acked_seq(&self) -> u32 {
        self.last_acked_seq
    }

    pub fn buffer(&self) -> &ReorderBuffer {
        &self.buffer
    }

    pub fn timer(&self) -> &CountdownTimer {
        &self.timer
    }

    /// Interval the timer is armed with in the current phase.
    pub fn timer_interval(&self) -> Duration {
        match self.phase {
            ReceiverPhase::AwaitingFilename | ReceiverPhase::Transfer => self.ack_delay,
            _ => self.control_timeout,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn summary(&self) -> ReceiverSummary {
        self.summary.clone()
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Handle one inbound packet and return what must be sent in reply.
    pub fn on_packet(&mut self, packet: &Packet) -> Result<Vec<Packet>> {
        match self.phase {
            ReceiverPhase::Handshake => self.on_handshake_packet(packet),
            ReceiverPhase::AwaitingFilename => {
                if packet.packet_type == PacketType::Data && packet.seq == self.expected {
                    self.accept_filename(packet)?;
                }
                Ok(Vec::new())
            }
            ReceiverPhase::Transfer => {
                if packet.packet_type.carries_data() || packet.packet_type == PacketType::Fin {
                    self.on_segment(packet)
                } else {
                    log::debug!("[receiver] ignoring {} during transfer", packet.packet_type);
                    Ok(Vec::new())
                }
            }
            ReceiverPhase::Closing => {
                if packet.packet_type == PacketType::Ack && packet.ack == self.next_seq {
                    self.timer.disarm();
                    self.phase = ReceiverPhase::Closed;
                    log::debug!("[receiver] ← ACK of FIN; closed");
                    return Ok(Vec::new());
                }
                if packet.packet_type == PacketType::Fin {
                    // The sender missed our final ACK.
                    return Ok(self.final_ack.iter().cloned().collect());
                }
                Ok(Vec::new())
            }
            ReceiverPhase::Closed => Ok(Vec::new()),
        }
    }

    /// Handle expiry of the countdown timer.
    pub fn on_timeout(&mut self) -> Result<Vec<Packet>> {
        self.timer.disarm();
        match self.phase {
            ReceiverPhase::Handshake => {
                let Some(synack) = self.synack.clone() else {
                    return Ok(Vec::new());
                };
                self.retries += 1;
                self.timer.arm(self.control_timeout);
                log::debug!("[receiver] SYN-ACK timeout; retry {}", self.retries);
                Ok(vec![synack])
            }
            ReceiverPhase::AwaitingFilename | ReceiverPhase::Transfer => Ok(vec![self.ack()]),
            ReceiverPhase::Closing => {
                self.retries += 1;
                if self.retries > self.fin_retries {
                    log::warn!("[receiver] FIN not acknowledged; force-closing");
                    self.phase = ReceiverPhase::Closed;
                    return Ok(Vec::new());
                }
                self.timer.arm(self.control_timeout);
                Ok(self.fin.iter().cloned().collect())
            }
            ReceiverPhase::Closed => Ok(Vec::new()),
        }
    }

    /// The sender's stream ended.
    pub fn on_peer_closed(&mut self) -> Result<()> {
        match self.phase {
            ReceiverPhase::Closing => {
                log::debug!("[receiver] sender closed before acknowledging FIN");
                self.timer.disarm();
                self.phase = ReceiverPhase::Closed;
                Ok(())
            }
            ReceiverPhase::Closed => Ok(()),
            ReceiverPhase::Handshake => Err(Error::PeerClosed { phase: "handshake" }),
            _ => Err(Error::PeerClosed {
                phase: "data transfer",
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn on_handshake_packet(&mut self, packet: &Packet) -> Result<Vec<Packet>> {
        match (packet.packet_type, self.synack.is_some()) {
            (PacketType::Syn, false) => {
                self.expected = packet.end_seq();
                self.last_acked_seq = packet.seq;
                let synack = Packet::control(
                    PacketType::SynAck,
                    self.isn,
                    self.expected,
                    self.buffer.free() as u32,
                );
                self.next_seq = synack.end_seq();
                self.synack = Some(synack.clone());
                self.timer.arm(self.control_timeout);
                log::debug!("[receiver] ← SYN seq={}; → SYN-ACK isn={}", packet.seq, self.isn);
                Ok(vec![synack])
            }
            (PacketType::Syn, true) if packet.end_seq() == self.expected => {
                // Our SYN-ACK was lost.
                self.timer.arm(self.control_timeout);
                Ok(self.synack.iter().cloned().collect())
            }
            (PacketType::Ack, true) if packet.ack == self.next_seq => {
                self.timer.disarm();
                self.retries = 0;
                self.last_acked_seq = packet.seq;
                self.expected = packet.end_seq();
                self.phase = ReceiverPhase::AwaitingFilename;
                log::debug!("[receiver] handshake complete");
                Ok(Vec::new())
            }
            (PacketType::Data, true) if packet.seq == self.expected.wrapping_add(1) => {
                // Handshake ACK lost; the filename proves the sender saw our SYN-ACK.
                self.timer.disarm();
                self.retries = 0;
                self.accept_filename(packet)?;
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }

    fn accept_filename(&mut self, packet: &Packet) -> Result<()> {
        let name = String::from_utf8_lossy(packet.payload())
            .trim_end_matches('\0')
            .to_string();
        self.sink.begin(&name)?;
        log::info!("[receiver] receiving {name:?}");
        self.summary.filename = Some(name);
        self.last_acked_seq = packet.seq;
        self.expected = packet.end_seq();
        self.phase = ReceiverPhase::Transfer;
        self.timer.arm(self.ack_delay);
        Ok(())
    }

    fn on_segment(&mut self, packet: &Packet) -> Result<Vec<Packet>> {
        if packet.seq == self.expected {
            let mut fin = self.deliver(packet)?;
            while !fin {
                let Some(next) = self.buffer.take(self.expected) else {
                    break;
                };
                fin = self.deliver(&next)?;
            }
            self.buffer.discard_before(self.expected);

            if fin {
                return self.close();
            }
            if self.timer.is_armed() {
                self.timer.disarm();
                return Ok(vec![self.ack()]);
            }
            self.timer.arm(self.ack_delay);
            return Ok(Vec::new());
        }

        if seq_lt(self.expected, packet.seq) {
            self.timer.disarm();
            let dup = self.ack();
            match self.buffer.insert(packet.clone()) {
                BufferOutcome::Buffered => self.summary.buffered += 1,
                BufferOutcome::Duplicate => {}
                BufferOutcome::Full => {
                    self.summary.dropped += 1;
                    log::debug!("[receiver] window full; dropping seq={}", packet.seq);
                }
            }
            return Ok(vec![dup]);
        }

        self.summary.stale += 1;
        self.timer.disarm();
        Ok(vec![self.ack()])
    }

    /// Deliver one in-order segment; returns `true` if it was the FIN.
    fn deliver(&mut self, packet: &Packet) -> Result<bool> {
        let fin = packet.packet_type == PacketType::Fin;
        if !fin {
            self.sink.deliver(packet.seq, packet.payload())?;
            self.summary.bytes += u64::from(packet.data_len());
            self.summary.segments += 1;
        }
        self.last_acked_seq = packet.seq;
        self.expected = packet.end_seq();
        Ok(fin)
    }

    /// The sender's FIN is in: final ACK, then our own FIN.
    fn close(&mut self) -> Result<Vec<Packet>> {
        self.sink.finish()?;
        let final_ack = self.ack();
        let fin = Packet::control(
            PacketType::Fin,
            self.next_seq,
            self.expected,
            self.buffer.free() as u32,
        );
        self.next_seq = fin.end_seq();
        self.final_ack = Some(final_ack.clone());
        self.fin = Some(fin.clone());
        self.phase = ReceiverPhase::Closing;
        self.retries = 0;
        self.timer.arm(self.control_timeout);
        log::debug!("[receiver] ← FIN; → ACK {} + FIN seq={}", self.expected, fin.seq);
        Ok(vec![final_ack, fin])
    }

    /// Current cumulative ACK advertising the free reorder credit.
    fn ack(&self) -> Packet {
        Packet::control(
            PacketType::Ack,
            self.next_seq,
            self.expected,
            self.buffer.free() as u32,
        )
    }
}
