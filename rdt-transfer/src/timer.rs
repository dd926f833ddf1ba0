//! Countdown timer and retransmission-timeout estimation.
//!
//! Reliable delivery requires that unacknowledged packets are re-sent if no
//! ACK arrives within a bounded time.  This module provides:
//! - [`CountdownTimer`]: a one-shot timer owned by a single endpoint.  It is
//!   a deadline, not a task: the endpoint's control loop awaits
//!   [`CountdownTimer::expired`] alongside the socket and reacts when it
//!   wins.
//! - [`RttEstimator`]: the smoothed RTT / deviation pair and the timeout
//!   interval derived from them.
//!
//! The timeout follows Jacobson's algorithm:
//!   `timeout = estimatedRTT + 4 × devRTT`
//! and doubles on each genuine timeout (exponential back-off) up to a
//! configurable maximum.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Initial smoothed RTT and deviation before any sample is taken.
pub const INITIAL_RTT: Duration = Duration::from_millis(250);

/// Timeout used for the very first transmission.
pub const INITIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound for the backed-off timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// CountdownTimer
// ---------------------------------------------------------------------------

/// A single one-shot countdown timer.
///
/// Arming replaces any pending expiry.  Once the deadline has passed the
/// timer reads as expired until it is disarmed or re-armed; the owner is
/// expected to call [`disarm`](Self::disarm) when it handles the expiry.
#[derive(Debug, Default, Clone)]
pub struct CountdownTimer {
    deadline: Option<Instant>,
}

impl CountdownTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule expiry `duration` from now.
    pub fn arm(&mut self, duration: Duration) {
        self.deadline = Some(Instant::now() + duration);
    }

    /// Schedule expiry at an absolute instant.
    pub fn arm_at(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Cancel the pending expiry, if any.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// `true` while an expiry is pending or has fired but not been handled.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left before expiry; zero when disarmed or already expired.
    pub fn remaining(&self) -> Duration {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// `true` once the armed deadline has passed.
    pub fn has_expired(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }

    /// A future that completes when the current deadline passes.
    ///
    /// The future captures the deadline by value, so it does not borrow the
    /// timer; a disarmed timer yields a future that never completes.
    /// Re-create it after every arm/disarm.
    pub fn expired(&self) -> impl Future<Output = ()> + Send + 'static {
        let deadline = self.deadline;
        async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RttEstimator
// ---------------------------------------------------------------------------

/// Smoothed RTT estimate and the current retransmission timeout.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    estimated_rtt: Duration,
    dev_rtt: Duration,
    /// Interval the retransmit timer is armed with.
    timeout: Duration,
    max_timeout: Duration,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(INITIAL_RTT, INITIAL_TIMEOUT, MAX_TIMEOUT)
    }
}

impl RttEstimator {
    pub fn new(initial_rtt: Duration, initial_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            estimated_rtt: initial_rtt,
            dev_rtt: initial_rtt,
            timeout: initial_timeout.min(max_timeout),
            max_timeout,
        }
    }

    pub fn estimated_rtt(&self) -> Duration {
        self.estimated_rtt
    }

    pub fn dev_rtt(&self) -> Duration {
        self.dev_rtt
    }

    /// Current retransmission timeout interval.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Derive an RTT sample from how much of the armed interval was left
    /// when the ACK arrived, then fold it in.
    ///
    /// `remaining` larger than the armed interval (clock skew between arm
    /// and query) yields a zero sample, never a negative one.
    pub fn sample_from_remaining(&mut self, remaining: Duration) -> Duration {
        let sample = self.timeout.saturating_sub(remaining);
        self.record_sample(sample);
        sample
    }

    /// Fold an RTT sample into the estimate and recompute the timeout.
    ///
    /// ```text
    /// devRTT       = 3/4·devRTT + 1/4·|sample − estimatedRTT|
    /// estimatedRTT = 7/8·estimatedRTT + 1/8·sample
    /// timeout      = estimatedRTT + 4·devRTT
    /// ```
    pub fn record_sample(&mut self, sample: Duration) {
        let diff = sample.abs_diff(self.estimated_rtt);
        self.dev_rtt = self.dev_rtt * 3 / 4 + diff / 4;
        self.estimated_rtt = self.estimated_rtt * 7 / 8 + sample / 8;
        let next = (self.estimated_rtt + self.dev_rtt * 4).min(self.max_timeout);
        log::trace!(
            "timeout interval {:?} -> {:?} (sample {:?})",
            self.timeout,
            next,
            sample
        );
        self.timeout = next;
    }

    /// Double the timeout after a genuine expiry, capped at the maximum.
    pub fn back_off(&mut self) {
        self.timeout = (self.timeout * 2).min(self.max_timeout);
    }
}
