//! Connection configuration and endpoint tunables.
//!
//! Endpoints find each other through a small text file:
//!
//! ```text
//! # connections.cfg
//! network_ip    127.0.0.1
//! network_port  7005
//! receiver_ip   127.0.0.1
//! receiver_port 8005
//! ```
//!
//! The first line is a header and is skipped.  Every other non-blank line
//! is `key value`; unknown keys are ignored.  Which keys are required
//! depends on the role, so validation happens in the typed accessors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::timer::{INITIAL_RTT, INITIAL_TIMEOUT, MAX_TIMEOUT};

pub const NETWORK_IP: &str = "network_ip";
pub const NETWORK_PORT: &str = "network_port";
pub const RECEIVER_IP: &str = "receiver_ip";
pub const RECEIVER_PORT: &str = "receiver_port";

/// Unanswered FIN resends before the receiver closes anyway.
pub const MAX_FIN_RETRIES: u32 = 6;

/// Default receive window, in MSS units.
pub const DEFAULT_WINDOW: u32 = 128;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config key `{0}` is required")]
    Missing(&'static str),
    #[error("config key `{key}` has malformed integer {value:?}")]
    InvalidInteger { key: String, value: String },
    #[error("config line {line}: expected `key value`")]
    InvalidLine { line: usize },
}

/// Parsed `key value` pairs.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: HashMap<String, String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut values = HashMap::new();
        for (idx, line) in text.lines().enumerate().skip(1) {
            let mut fields = line.split_whitespace();
            let Some(key) = fields.next() else {
                continue;
            };
            let value = fields
                .next()
                .ok_or(ConfigError::InvalidLine { line: idx + 1 })?;
            values.insert(key.to_string(), value.to_string());
        }
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require_host(&self, key: &'static str) -> Result<&str, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    pub fn require_port(&self, key: &'static str) -> Result<u16, ConfigError> {
        let raw = self.get(key).ok_or(ConfigError::Missing(key))?;
        raw.parse().map_err(|_| ConfigError::InvalidInteger {
            key: key.to_string(),
            value: raw.to_string(),
        })
    }

    /// Where the sender connects: the emulator's listening address.
    pub fn sender_target(&self) -> Result<(String, u16), ConfigError> {
        let host = self.require_host(NETWORK_IP)?.to_string();
        Ok((host, self.require_port(NETWORK_PORT)?))
    }

    /// The port the receiver listens on.
    pub fn receiver_port(&self) -> Result<u16, ConfigError> {
        self.require_port(RECEIVER_PORT)
    }

    /// The emulator's listening port and the receiver it relays to.
    pub fn emulator_endpoints(&self) -> Result<(u16, String, u16), ConfigError> {
        let listen = self.require_port(NETWORK_PORT)?;
        let host = self.require_host(RECEIVER_IP)?.to_string();
        Ok((listen, host, self.require_port(RECEIVER_PORT)?))
    }
}

// ---------------------------------------------------------------------------
// Endpoint tunables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub initial_timeout: Duration,
    pub initial_rtt: Duration,
    pub max_timeout: Duration,
    /// Ceiling for the congestion window, in segments.
    pub max_window: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            initial_timeout: INITIAL_TIMEOUT,
            initial_rtt: INITIAL_RTT,
            max_timeout: MAX_TIMEOUT,
            max_window: 4096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Receive window in MSS units; also the reorder buffer capacity.
    pub window: u32,
    /// How long an in-order ACK may wait to be coalesced.
    pub ack_delay: Duration,
    /// Retransmit interval for SYN-ACK and FIN.
    pub control_timeout: Duration,
    /// FIN resends before closing without the sender's ACK.
    pub fin_retries: u32,
    /// Directory the received file is written into.
    pub output_dir: PathBuf,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            ack_delay: Duration::from_micros(500),
            control_timeout: Duration::from_secs(2),
            fin_retries: MAX_FIN_RETRIES,
            output_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EmulatorConfig {
    /// Drop probability per packet, 0.0..=1.0.
    pub bit_error_rate: f64,
    /// Propagation delay added to every surviving packet.
    pub delay: Duration,
    /// Fixed RNG seed for reproducible drops.
    pub seed: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "key value\n\
                          network_ip 127.0.0.1\n\
                          network_port 7005\n\
                          \n\
                          receiver_ip localhost\n\
                          receiver_port 8005\n\
                          colour blue\n";

    #[test]
    fn header_line_is_skipped() {
        let cfg = Config::parse("network_port 1\nnetwork_ip 10.0.0.1\n").unwrap();
        assert!(cfg.get(NETWORK_PORT).is_none());
        assert_eq!(cfg.get(NETWORK_IP), Some("10.0.0.1"));
    }

    #[test]
    fn role_accessors() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.sender_target().unwrap(), ("127.0.0.1".to_string(), 7005));
        assert_eq!(cfg.receiver_port().unwrap(), 8005);
        assert_eq!(
            cfg.emulator_endpoints().unwrap(),
            (7005, "localhost".to_string(), 8005)
        );
        assert_eq!(cfg.get("colour"), Some("blue"));
    }

    #[test]
    fn missing_key_reported_by_name() {
        let cfg = Config::parse("hdr\nreceiver_port 8005\n").unwrap();
        assert!(cfg.receiver_port().is_ok());
        assert!(matches!(
            cfg.sender_target(),
            Err(ConfigError::Missing(NETWORK_IP))
        ));
    }

    #[test]
    fn malformed_integer_is_fatal() {
        let cfg = Config::parse("hdr\nreceiver_port 80x5\n").unwrap();
        match cfg.receiver_port() {
            Err(ConfigError::InvalidInteger { key, value }) => {
                assert_eq!(key, RECEIVER_PORT);
                assert_eq!(value, "80x5");
            }
            other => panic!("unexpected {other:?}"),
        }
        let cfg = Config::parse("hdr\nreceiver_port 70000\n").unwrap();
        assert!(cfg.receiver_port().is_err());
    }

    #[test]
    fn key_without_value_rejected() {
        assert!(matches!(
            Config::parse("hdr\nnetwork_ip\n"),
            Err(ConfigError::InvalidLine { line: 2 })
        ));
    }

    #[test]
    fn load_reports_path() {
        let err = Config::load("/definitely/not/here.cfg").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.cfg"));
    }
}
