//! Lossy, delaying relay between one sender and one receiver.
//!
//! ```text
//!  sender ──▶ ┌───────────────────────────────┐ ──▶ receiver
//!             │  DropPolicy ─▶ DelayQueue ─▶  │
//!  sender ◀── └───────────────────────────────┘ ◀── receiver
//! ```
//!
//! Every packet arriving on either side is first offered to a
//! [`DropPolicy`].  Survivors wait in a [`DelayQueue`] until
//! `arrival + delay`, then go out on the opposite side.  One countdown
//! timer tracks the head of the queue.  The emulator never retransmits or
//! inspects sequence numbers; loss recovery is the endpoints' problem.

use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::time::Instant;

use crate::config::EmulatorConfig;
use crate::error::Result;
use crate::packet::Packet;
use crate::socket::PacketStream;
use crate::timer::CountdownTimer;
use crate::transfer_log::{Direction, TransferLog, TransferRecord};
use crate::window::DelayQueue;

/// Which peer a packet is travelling towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    ToReceiver,
    ToSender,
}

impl Route {
    /// Short tag used in the phase column of the transfer log.
    pub fn label(self) -> &'static str {
        match self {
            Route::ToReceiver => "TO RCV",
            Route::ToSender => "TO SND",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Route::ToReceiver => "sender→receiver",
            Route::ToSender => "receiver→sender",
        })
    }
}

// ---------------------------------------------------------------------------
// Drop policies
// ---------------------------------------------------------------------------

/// Decides whether a packet is lost in transit.
pub trait DropPolicy: Send {
    fn should_drop(&mut self, packet: &Packet, route: Route) -> bool;
}

impl<F> DropPolicy for F
where
    F: FnMut(&Packet, Route) -> bool + Send,
{
    fn should_drop(&mut self, packet: &Packet, route: Route) -> bool {
        self(packet, route)
    }
}

/// Drops each packet independently with probability `rate`.
#[derive(Debug, Clone)]
pub struct BitErrorRate {
    rate: f64,
    rng: StdRng,
}

impl BitErrorRate {
    /// `rate` is clamped to `0.0..=1.0`.  A fixed `seed` makes the drop
    /// pattern reproducible.
    pub fn new(rate: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            rate: if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) },
            rng,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl DropPolicy for BitErrorRate {
    fn should_drop(&mut self, _packet: &Packet, _route: Route) -> bool {
        self.rng.random::<f64>() < self.rate
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteStats {
    /// Packets delivered to the far side.
    pub relayed: u64,
    /// Packets lost to the drop policy.
    pub dropped: u64,
    /// Packets that expired after the far side had gone away.
    pub discarded: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub to_receiver: RouteStats,
    pub to_sender: RouteStats,
}

impl RelayStats {
    fn route_mut(&mut self, route: Route) -> &mut RouteStats {
        match route {
            Route::ToReceiver => &mut self.to_receiver,
            Route::ToSender => &mut self.to_sender,
        }
    }
}

impl fmt::Display for RelayStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "to receiver: {} relayed, {} dropped; to sender: {} relayed, {} dropped",
            self.to_receiver.relayed,
            self.to_receiver.dropped,
            self.to_sender.relayed,
            self.to_sender.dropped
        )
    }
}

// ---------------------------------------------------------------------------
// NetworkEmulator
// ---------------------------------------------------------------------------

pub struct NetworkEmulator<P> {
    policy: P,
    delay: Duration,
    queue: DelayQueue<Route>,
    timer: CountdownTimer,
    stats: RelayStats,
}

impl NetworkEmulator<BitErrorRate> {
    pub fn from_config(config: &EmulatorConfig) -> Self {
        Self::new(
            BitErrorRate::new(config.bit_error_rate, config.seed),
            config.delay,
        )
    }
}

impl<P: DropPolicy> NetworkEmulator<P> {
    pub fn new(policy: P, delay: Duration) -> Self {
        Self {
            policy,
            delay,
            queue: DelayQueue::new(),
            timer: CountdownTimer::new(),
            stats: RelayStats::default(),
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Packets waiting out their delay.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.next_deadline()
    }

    /// Offer an arriving packet to the drop policy and queue it if it
    /// survives.  Returns `true` if queued.
    pub fn admit(&mut self, packet: Packet, route: Route) -> bool {
        if self.policy.should_drop(&packet, route) {
            self.stats.route_mut(route).dropped += 1;
            log::debug!(
                "[emulator] dropped {} seq={} ack={} ({route})",
                packet.packet_type,
                packet.seq,
                packet.ack
            );
            return false;
        }
        self.queue.push(packet, route, Instant::now() + self.delay);
        self.rearm();
        true
    }

    /// Remove every packet whose delay has elapsed by `now`, in expiry order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(Route, Packet)> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.pop_expired(now) {
            due.push((entry.route, entry.packet));
        }
        self.rearm();
        due
    }

    fn rearm(&mut self) {
        match self.queue.next_deadline() {
            Some(deadline) => self.timer.arm_at(deadline),
            None => self.timer.disarm(),
        }
    }

    fn has_pending_for(&self, route: Route) -> bool {
        self.queue.iter().any(|e| e.route == route)
    }

    /// Log an arriving packet and hand it to [`admit`](Self::admit).
    fn arrive(&mut self, packet: Packet, route: Route, log: &mut TransferLog) {
        log.record(self.record(Direction::Recv, &packet, route));
        let (kind, seq) = (packet.packet_type, packet.seq);
        if !self.admit(packet, route) {
            log.note(&format!("Dropped {kind} seq={seq} ({route})"));
        }
    }

    fn record(&self, direction: Direction, packet: &Packet, route: Route) -> TransferRecord {
        TransferRecord::new(direction, packet, route.label(), self.queue.len(), self.delay)
    }

    /// Relay between the two streams until both have closed, recording
    /// every arrival, drop and delivery in `log`.
    ///
    /// End-of-stream on one side is passed on to the other side once every
    /// packet queued towards it has been delivered.
    pub async fn relay(
        &mut self,
        mut sender_side: PacketStream,
        mut receiver_side: PacketStream,
        log: &mut TransferLog,
    ) -> Result<RelayStats> {
        let mut sender_open = true;
        let mut receiver_open = true;
        let mut sender_writable = true;
        let mut receiver_writable = true;

        while sender_open || receiver_open {
            let expiry = self.timer.expired();
            tokio::select! {
                res = sender_side.recv(), if sender_open => match res {
                    Ok(Some(packet)) => self.arrive(packet, Route::ToReceiver, log),
                    Ok(None) => {
                        log::info!("[emulator] sender closed its stream");
                        sender_open = false;
                    }
                    Err(e) => {
                        log::warn!("[emulator] sender stream failed: {e}");
                        sender_open = false;
                    }
                },
                res = receiver_side.recv(), if receiver_open => match res {
                    Ok(Some(packet)) => self.arrive(packet, Route::ToSender, log),
                    Ok(None) => {
                        log::info!("[emulator] receiver closed its stream");
                        receiver_open = false;
                    }
                    Err(e) => {
                        log::warn!("[emulator] receiver stream failed: {e}");
                        receiver_open = false;
                    }
                },
                _ = expiry => {
                    for (route, packet) in self.pop_due(Instant::now()) {
                        let (stream, writable) = match route {
                            Route::ToReceiver => (&mut receiver_side, &mut receiver_writable),
                            Route::ToSender => (&mut sender_side, &mut sender_writable),
                        };
                        let delivered = *writable && match stream.send(&packet).await {
                            Ok(()) => true,
                            Err(e) => {
                                log::debug!("[emulator] {route} send failed: {e}");
                                *writable = false;
                                false
                            }
                        };
                        let stats = self.stats.route_mut(route);
                        if delivered {
                            stats.relayed += 1;
                            log.record(self.record(Direction::Send, &packet, route));
                        } else {
                            stats.discarded += 1;
                            log::debug!(
                                "[emulator] discarding {} seq={} ({route}); peer gone",
                                packet.packet_type,
                                packet.seq
                            );
                        }
                    }
                }
            }

            if !sender_open && receiver_writable && !self.has_pending_for(Route::ToReceiver) {
                receiver_writable = false;
                if let Err(e) = receiver_side.shutdown().await {
                    log::debug!("[emulator] receiver shutdown: {e}");
                }
            }
            if !receiver_open && sender_writable && !self.has_pending_for(Route::ToSender) {
                sender_writable = false;
                if let Err(e) = sender_side.shutdown().await {
                    log::debug!("[emulator] sender shutdown: {e}");
                }
            }
        }

        let leftover = self.queue.len();
        if leftover > 0 {
            log::debug!("[emulator] {leftover} packet(s) still queued at close");
        }
        log::info!("[emulator] relay finished; {}", self.stats);
        Ok(self.stats)
    }
}

/// Accept the sender on `listener`, connect to the receiver at
/// `receiver_addr`, and relay until both close.
pub async fn run_emulator<A: ToSocketAddrs>(
    listener: &TcpListener,
    receiver_addr: A,
    config: &EmulatorConfig,
    log: &mut TransferLog,
) -> Result<RelayStats> {
    let sender_side = PacketStream::accept(listener).await?;
    let receiver_side = PacketStream::connect(receiver_addr).await?;
    log::info!(
        "[emulator] relaying {} <-> {} (BER {}, delay {:?})",
        sender_side.peer_addr,
        receiver_side.peer_addr,
        config.bit_error_rate,
        config.delay
    );
    NetworkEmulator::from_config(config)
        .relay(sender_side, receiver_side, log)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    fn pkt(seq: u32) -> Packet {
        Packet::control(PacketType::Ack, seq, seq, 1)
    }

    #[test]
    fn ber_zero_and_one_are_absolute() {
        let mut never = BitErrorRate::new(0.0, Some(1));
        let mut always = BitErrorRate::new(1.0, Some(1));
        for i in 0..1000 {
            assert!(!never.should_drop(&pkt(i), Route::ToReceiver));
            assert!(always.should_drop(&pkt(i), Route::ToSender));
        }
    }

    #[test]
    fn seeded_ber_is_reproducible_and_near_rate() {
        let draws = |seed| {
            let mut ber = BitErrorRate::new(0.25, Some(seed));
            (0..4000)
                .map(|i| ber.should_drop(&pkt(i), Route::ToReceiver))
                .collect::<Vec<_>>()
        };
        let a = draws(7);
        assert_eq!(a, draws(7));
        let dropped = a.iter().filter(|d| **d).count();
        assert!((800..1200).contains(&dropped), "dropped {dropped}");
    }

    #[test]
    fn rate_is_clamped() {
        assert_eq!(BitErrorRate::new(3.0, None).rate(), 1.0);
        assert_eq!(BitErrorRate::new(-1.0, None).rate(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn packets_leave_in_arrival_order_after_delay() {
        let mut emu = NetworkEmulator::new(|_: &Packet, _: Route| false, Duration::from_millis(5));
        let start = Instant::now();
        emu.admit(pkt(1), Route::ToReceiver);
        tokio::time::advance(Duration::from_millis(1)).await;
        emu.admit(pkt(2), Route::ToSender);

        assert_eq!(emu.next_deadline(), Some(start + Duration::from_millis(5)));
        assert!(emu.pop_due(Instant::now()).is_empty());

        emu.timer.expired().await;
        let first = emu.pop_due(Instant::now());
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].0, Route::ToReceiver);
        assert_eq!(emu.next_deadline(), Some(start + Duration::from_millis(6)));

        emu.timer.expired().await;
        let second = emu.pop_due(Instant::now());
        assert_eq!((second[0].0, second[0].1.seq), (Route::ToSender, 2));
        assert!(!emu.timer.is_armed());
    }

    #[test]
    fn closure_policy_drops_selected_packets() {
        let mut emu = NetworkEmulator::new(
            |p: &Packet, r: Route| r == Route::ToReceiver && p.seq == 2,
            Duration::ZERO,
        );
        assert!(emu.admit(pkt(1), Route::ToReceiver));
        assert!(!emu.admit(pkt(2), Route::ToReceiver));
        assert!(emu.admit(pkt(2), Route::ToSender));
        assert_eq!(emu.stats().to_receiver.dropped, 1);
        assert_eq!(emu.pending(), 2);
    }
}
