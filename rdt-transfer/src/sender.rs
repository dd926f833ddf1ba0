//! Send-side state machine: handshake, congestion control, close.
//!
//! [`Sender`] frames a file into segments and drives a window of them
//! towards the receiver.  It reacts to two kinds of events, an inbound
//! packet ([`Sender::on_packet`]) and an expiry of its own countdown timer
//! ([`Sender::on_timeout`]), and answers each with the packets to put on
//! the wire.  The caller owns the socket; see [`crate::connection`].
//!
//! # Congestion control
//!
//! ```text
//!  new cumulative ACK   ssthresh == 0 || ssthresh > w  →  w *= 2   (slow start)
//!                       otherwise                      →  w += 1   (congestion avoidance)
//!  3 duplicate ACKs     w /= 2; ssthresh = w; w += 3; resend head
//!  timeout              ssthresh = w / 2; w = 1; double timeout; resend head
//! ```
//!
//! `w` counts segments, not bytes.  After a timeout only the head counts as
//! sent; the rest of the window goes out again as `w` regrows.

use std::io::{self, BufRead, BufReader, Read};

use rand::Rng;

use crate::config::SenderConfig;
use crate::error::{Error, Result};
use crate::packet::{seq_lt, Packet, PacketType, PAYLOAD_LEN};
use crate::state::SenderPhase;
use crate::timer::{CountdownTimer, RttEstimator};
use crate::window::SendWindow;

/// Duplicate ACKs that trigger a fast retransmit.
const DUP_ACK_THRESHOLD: u32 = 3;

/// Counters reported once the transfer ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderSummary {
    /// File bytes framed into segments.
    pub bytes: u64,
    /// Data segments created (filename and FIN excluded).
    pub segments: u64,
    /// Segments sent more than once, for any reason.
    pub retransmissions: u64,
    pub fast_retransmits: u64,
    pub timeouts: u64,
    pub final_window: u32,
    pub final_ssthresh: u32,
}

/// Send-side state for a single file transfer.
#[derive(Debug)]
pub struct Sender<R> {
    /// File being sent; `None` once exhausted.
    source: Option<BufReader<R>>,
    filename: String,
    phase: SenderPhase,

    isn: u32,
    /// Sequence number for the next new segment.
    next_seq: u32,
    /// Highest cumulative ACK seen.
    last_ack: u32,
    /// Next byte expected from the receiver, echoed in `AckNum`.
    peer_next: u32,
    dup_acks: u32,
    /// Window the receiver advertised most recently.
    peer_window: u32,

    window_size: u32,
    ssthresh: u32,
    max_window: u32,
    fin_queued: bool,
    window: SendWindow,

    timer: CountdownTimer,
    rtt: RttEstimator,
    /// Consecutive timeouts without progress.
    /// Consecutive retransmissions without progress.
    retries: u32,
    /// Reply to the receiver's FIN, resent if the FIN repeats.
    final_ack: Option<Packet>,

    summary: SenderSummary,
}

impl<R: Read> Sender<R> {
    /// Create a sender with a random initial sequence number.
    pub fn new(filename: impl Into<String>, source: R, config: &SenderConfig) -> Result<Self> {
        let isn: u32 = rand::rng().random();
        Self::with_isn(filename, source, config, isn)
    }

    /// Create a sender with a fixed initial sequence number.
    pub fn with_isn(
        filename: impl Into<String>,
        source: R,
        config: &SenderConfig,
        isn: u32,
    ) -> Result<Self> {
        let filename = filename.into();
        if filename.is_empty() || filename.len() > PAYLOAD_LEN {
            return Err(Error::InvalidFilename(filename));
        }
        Ok(Self {
            source: Some(BufReader::new(source)),
            filename,
            phase: SenderPhase::Handshake,
            isn,
            next_seq: isn,
            last_ack: isn,
            peer_next: 0,
            dup_acks: 0,
            peer_window: 1,
            window_size: 1,
            ssthresh: 0,
            max_window: config.max_window.max(1),
            fin_queued: false,
            window: SendWindow::new(),
            timer: CountdownTimer::new(),
            rtt: RttEstimator::new(config.initial_rtt, config.initial_timeout, config.max_timeout),
            retries: 0,
            final_ack: None,
            summary: SenderSummary::default(),
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn phase(&self) -> SenderPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == SenderPhase::Closed
    }

    pub fn isn(&self) -> u32 {
        self.isn
    }

    /// Congestion window, in segments.
    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn window(&self) -> &SendWindow {
        &self.window
    }

    pub fn timer(&self) -> &CountdownTimer {
        &self.timer
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn summary(&self) -> SenderSummary {
        SenderSummary {
            final_window: self.window_size,
            final_ssthresh: self.ssthresh,
            ..self.summary.clone()
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Start the handshake: returns the SYN and arms the timer.
    pub fn open(&mut self) -> Packet {
        let syn = Packet::control(PacketType::Syn, self.isn, 0, self.window_size);
        self.next_seq = syn.end_seq();
        self.timer.arm(self.rtt.timeout());
        log::debug!("[sender] → SYN isn={}", self.isn);
        syn
    }

    /// Handle one inbound packet and return what must be sent in reply.
    pub fn on_packet(&mut self, packet: &Packet) -> Result<Vec<Packet>> {
        match (self.phase, packet.packet_type) {
            (SenderPhase::Handshake, PacketType::SynAck) if packet.ack == self.next_seq => {
                self.complete_handshake(packet)
            }
            (SenderPhase::SlowStart | SenderPhase::CongestionAvoidance, PacketType::Fin) => {
                Ok(self.begin_close(packet))
            }
            (SenderPhase::SlowStart | SenderPhase::CongestionAvoidance, PacketType::Ack) => {
                self.on_ack(packet)
            }
            (SenderPhase::Closing, PacketType::Fin) => {
                // Our final ACK was lost.
                self.timer.arm(self.rtt.timeout());
                Ok(self.final_ack.iter().cloned().collect())
            }
            (phase, kind) => {
                log::debug!("[sender] ignoring {kind} seq={} in {phase:?}", packet.seq);
                Ok(Vec::new())
            }
        }
    }

    /// Handle expiry of the countdown timer.
    pub fn on_timeout(&mut self) -> Result<Vec<Packet>> {
        self.timer.disarm();
        match self.phase {
            SenderPhase::Handshake => {
                self.retries += 1;
                self.rtt.back_off();
                self.timer.arm(self.rtt.timeout());
                self.summary.retransmissions += 1;
                log::debug!("[sender] SYN timeout; retry {}", self.retries);
                Ok(vec![Packet::control(
                    PacketType::Syn,
                    self.isn,
                    0,
                    self.window_size,
                )])
            }
            SenderPhase::SlowStart | SenderPhase::CongestionAvoidance => {
                self.retries += 1;
                self.summary.timeouts += 1;
                self.ssthresh = self.window_size / 2;
                self.window_size = 1;
                self.phase = SenderPhase::SlowStart;
                self.dup_acks = 0;
                self.window.rewind_to_head();
                self.rtt.back_off();
                let head = self.window.head_for_retransmit(self.window_size);
                if head.is_some() {
                    self.summary.retransmissions += 1;
                    self.timer.arm(self.rtt.timeout());
                }
                log::debug!(
                    "[sender] timeout; retry {} ssthresh={} timeout={:?}",
                    self.retries,
                    self.ssthresh,
                    self.rtt.timeout()
                );
                Ok(head.into_iter().collect())
            }
            SenderPhase::Closing => {
                self.phase = SenderPhase::Closed;
                log::debug!("[sender] close interval elapsed");
                Ok(Vec::new())
            }
            SenderPhase::Closed => Ok(Vec::new()),
        }
    }

    /// The receiver's stream ended.
    ///
    /// Expected while closing, and tolerated once everything including our
    /// FIN has been acknowledged; anything earlier is an error.
    pub fn on_peer_closed(&mut self) -> Result<()> {
        match self.phase {
            SenderPhase::Closing | SenderPhase::Closed => {
                self.phase = SenderPhase::Closed;
                Ok(())
            }
            phase if phase.is_transferring() && self.fin_queued && self.window.is_empty() => {
                log::warn!("[sender] receiver closed without FIN after acknowledging all data");
                self.timer.disarm();
                self.phase = SenderPhase::Closed;
                Ok(())
            }
            SenderPhase::Handshake => Err(Error::PeerClosed { phase: "handshake" }),
            _ => Err(Error::PeerClosed {
                phase: "data transfer",
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn complete_handshake(&mut self, synack: &Packet) -> Result<Vec<Packet>> {
        self.take_rtt_sample();
        self.retries = 0;
        self.peer_next = synack.end_seq();

        let ack = Packet::control(PacketType::Ack, self.next_seq, self.peer_next, self.window_size);
        self.next_seq = ack.end_seq();

        let name = Packet::with_payload(
            PacketType::Data,
            self.next_seq,
            self.filename.as_bytes(),
            self.window_size,
            self.peer_next,
        )?;
        self.last_ack = self.next_seq;
        self.next_seq = name.end_seq();
        self.window.push(name);
        self.phase = SenderPhase::SlowStart;
        log::debug!(
            "[sender] handshake complete; filename {:?} at seq={}",
            self.filename,
            self.last_ack
        );

        let mut out = vec![ack];
        out.extend(self.window.take_unsent(1, self.window_size));
        self.timer.arm(self.rtt.timeout());
        Ok(out)
    }

    fn on_ack(&mut self, packet: &Packet) -> Result<Vec<Packet>> {
        self.peer_window = packet.window;

        if packet.ack == self.last_ack {
            return Ok(self.on_duplicate_ack());
        }
        if !seq_lt(self.last_ack, packet.ack) || seq_lt(self.next_seq, packet.ack) {
            log::warn!(
                "[sender] ignoring stale ACK {} (last {})",
                packet.ack,
                self.last_ack
            );
            return Ok(Vec::new());
        }

        self.take_rtt_sample();
        self.last_ack = packet.ack;
        self.dup_acks = 0;
        self.retries = 0;
        let removed = self.window.acknowledge(packet.ack);

        if self.ssthresh == 0 || self.ssthresh > self.window_size {
            self.phase = SenderPhase::SlowStart;
            self.window_size = self.window_size.saturating_mul(2);
        } else {
            self.phase = SenderPhase::CongestionAvoidance;
            self.window_size = self.window_size.saturating_add(1);
        }
        self.window_size = self.window_size.min(self.max_window);

        self.top_up()?;
        self.queue_fin();

        let out = self
            .window
            .take_unsent(self.window_size as usize, self.window_size);
        if !self.window.is_empty() {
            self.timer.arm(self.rtt.timeout());
        }
        log::debug!(
            "[sender] ← ACK {} slid={} w={} ssthresh={} → {} seg",
            packet.ack,
            removed,
            self.window_size,
            self.ssthresh,
            out.len()
        );
        Ok(out)
    }

    fn on_duplicate_ack(&mut self) -> Vec<Packet> {
        if self.window.is_empty() {
            return Vec::new();
        }
        self.dup_acks += 1;
        if self.dup_acks < DUP_ACK_THRESHOLD {
            return Vec::new();
        }
        self.dup_acks = 0;

        self.window_size /= 2;
        self.ssthresh = self.window_size;
        self.window_size += 3;
        self.phase = if self.ssthresh == 0 || self.ssthresh > self.window_size {
            SenderPhase::SlowStart
        } else {
            SenderPhase::CongestionAvoidance
        };

        let head = self.window.head_for_retransmit(self.window_size);
        if let Some(seg) = &head {
            self.summary.retransmissions += 1;
            self.summary.fast_retransmits += 1;
            log::debug!(
                "[sender] fast retransmit seq={} w={} ssthresh={}",
                seg.seq,
                self.window_size,
                self.ssthresh
            );
        }
        head.into_iter().collect()
    }

    /// Fill the window from the file up to `window_size` segments.
    ///
    /// The source is peeked after every read so the final segment is
    /// tagged EOT when it is framed, before it can be sent.
    fn top_up(&mut self) -> Result<()> {
        let chunk = if self.peer_window == 0 { 1 } else { PAYLOAD_LEN };
        let mut buf = [0u8; PAYLOAD_LEN];

        while self.window.len() < self.window_size as usize {
            let Some(source) = self.source.as_mut() else {
                break;
            };
            let n = read_full(source, &mut buf[..chunk])?;
            if n == 0 {
                // Empty file: nothing to tag.
                self.source = None;
                break;
            }
            let last = source.fill_buf()?.is_empty();
            let kind = if last {
                PacketType::Eot
            } else {
                PacketType::Data
            };

            let seg = Packet::with_payload(
                kind,
                self.next_seq,
                &buf[..n],
                self.window_size,
                self.peer_next,
            )?;
            self.next_seq = seg.end_seq();
            self.window.push(seg);
            self.summary.bytes += n as u64;
            self.summary.segments += 1;

            if last {
                self.source = None;
                log::debug!("[sender] end of file at seq={}", self.next_seq);
            }
        }
        Ok(())
    }

    fn queue_fin(&mut self) {
        if self.source.is_some()
            || self.fin_queued
            || self.window.len() >= self.window_size as usize
        {
            return;
        }
        let fin = Packet::control(PacketType::Fin, self.next_seq, self.peer_next, self.window_size);
        self.next_seq = fin.end_seq();
        self.window.push(fin);
        self.fin_queued = true;
    }

    fn begin_close(&mut self, fin: &Packet) -> Vec<Packet> {
        self.window.clear();
        self.source = None;
        let ack = Packet::control(PacketType::Ack, self.next_seq, fin.end_seq(), self.window_size);
        self.final_ack = Some(ack.clone());
        self.phase = SenderPhase::Closing;
        self.timer.arm(self.rtt.timeout());
        log::debug!("[sender] ← FIN seq={}; → final ACK", fin.seq);
        vec![ack]
    }

    fn take_rtt_sample(&mut self) {
        if self.timer.is_armed() {
            let remaining = self.timer.remaining();
            self.rtt.sample_from_remaining(remaining);
        }
        self.timer.disarm();
    }
}

/// Read until `buf` is full or the source is exhausted.
fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
