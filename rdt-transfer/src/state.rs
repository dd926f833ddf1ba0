//! Endpoint finite-state-machine types.
//!
//! Each endpoint handles exactly one transfer, so the state machines are
//! small and linear.  Transitions live in [`crate::sender`] and
//! [`crate::receiver`]; this module only names the states and gives them
//! the short labels used in the transfer log.

use std::fmt;

/// Sender states.
///
/// ```text
///  HANDSHAKE ──SYN-ACK──▶ SLOW_START ◀──timeout── CONGESTION_AVOIDANCE
///                              │  ssthresh reached      ▲
///                              └────────────────────────┘
///          receiver FIN (any data state) ──▶ CLOSING ──quiet interval──▶ CLOSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderPhase {
    /// SYN sent, waiting for a matching SYN-ACK.
    #[default]
    Handshake,
    /// Window doubles on every new cumulative ACK.
    SlowStart,
    /// Window grows by one on every new cumulative ACK.
    CongestionAvoidance,
    /// Final ACK sent; waiting out one interval for a repeated FIN.
    Closing,
    Closed,
}

impl SenderPhase {
    /// Fixed-width label for the transfer log.
    pub fn label(self) -> &'static str {
        match self {
            SenderPhase::Handshake => "3WAY HS",
            SenderPhase::SlowStart => "SLOW ST",
            SenderPhase::CongestionAvoidance => "CONG AV",
            SenderPhase::Closing => "CLOSE",
            SenderPhase::Closed => "CLOSED",
        }
    }

    /// `true` while data segments may still be in flight.
    pub fn is_transferring(self) -> bool {
        matches!(self, SenderPhase::SlowStart | SenderPhase::CongestionAvoidance)
    }
}

impl fmt::Display for SenderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

/// Receiver states.
///
/// ```text
///  HANDSHAKE ──ACK──▶ AWAITING_FILENAME ──filename──▶ TRANSFER ──FIN──▶ CLOSING ──ACK──▶ CLOSED
///      │                                                ▲
///      └──────── filename DATA (handshake ACK lost) ────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiverPhase {
    /// Waiting for SYN, or SYN-ACK sent and waiting for the ACK.
    #[default]
    Handshake,
    AwaitingFilename,
    Transfer,
    /// Own FIN sent; waiting for the sender's ACK of it.
    Closing,
    Closed,
}

impl ReceiverPhase {
    pub fn label(self) -> &'static str {
        match self {
            ReceiverPhase::Handshake => "3WAY HS",
            ReceiverPhase::AwaitingFilename => "FILENAM",
            ReceiverPhase::Transfer => "-------",
            ReceiverPhase::Closing => "CLOSE",
            ReceiverPhase::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ReceiverPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_handshake() {
        assert_eq!(SenderPhase::default(), SenderPhase::Handshake);
        assert_eq!(ReceiverPhase::default(), ReceiverPhase::Handshake);
    }

    #[test]
    fn labels_fit_log_column() {
        for phase in [
            SenderPhase::Handshake,
            SenderPhase::SlowStart,
            SenderPhase::CongestionAvoidance,
            SenderPhase::Closing,
            SenderPhase::Closed,
        ] {
            assert!(phase.label().len() <= 7, "{phase:?}");
        }
        assert_eq!(format!("{:>7}", SenderPhase::Closing), "  CLOSE");
    }
}
