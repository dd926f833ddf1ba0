//! Per-packet transfer log.
//!
//! Every packet an endpoint sends or receives becomes one [`TransferRecord`].
//! Records always go through the `log` facade at debug level; a
//! [`TransferLog`] can additionally append them as table rows to a file and
//! keep them in memory for inspection.
//!
//! ```text
//! SEND/RCV | Type    | SeqNum     | AckNum     | Length | Phase   | Window | #Buffered | Timeout Interval
//! _______________________________________________________________________________________________________
//!     SEND |     SYN | 1804289383 |          0 |      1 | 3WAY HS |      1 |         1 | 1s 0nsec
//! ```

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::packet::{Packet, PacketType};

const HEADER: &str = "SEND/RCV | Type    | SeqNum     | AckNum     | Length | Phase   | Window | #Buffered | Timeout Interval";
const RULE: &str = "_______________________________________________________________________________________________________";

/// Which way a logged packet travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Direction::Send => "SEND",
            Direction::Recv => "RCV",
        })
    }
}

/// One row of the transfer log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub timestamp: SystemTime,
    pub direction: Direction,
    pub packet_type: PacketType,
    pub seq: u32,
    pub ack: u32,
    pub length: u32,
    /// Endpoint phase label at the time of the event.
    pub phase: &'static str,
    /// Window advertised in the packet itself.
    pub window: u32,
    /// Segments held by the endpoint's window container.
    pub buffered: usize,
    /// Timer interval in force.
    pub timeout: Duration,
}

impl TransferRecord {
    pub fn new(
        direction: Direction,
        packet: &Packet,
        phase: &'static str,
        buffered: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            timestamp: SystemTime::now(),
            direction,
            packet_type: packet.packet_type,
            seq: packet.seq,
            ack: packet.ack,
            length: packet.data_len(),
            phase,
            window: packet.window,
            buffered,
            timeout,
        }
    }
}

impl fmt::Display for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>8} | {:>7} | {:>10} | {:>10} | {:>6} | {:>7} | {:>6} | {:>9} | {}s {}nsec",
            self.direction,
            self.packet_type,
            self.seq,
            self.ack,
            self.length,
            self.phase,
            self.window,
            self.buffered,
            self.timeout.as_secs(),
            self.timeout.subsec_nanos()
        )
    }
}

/// Sink for [`TransferRecord`]s and free-form progress notes.
#[derive(Debug)]
pub struct TransferLog {
    /// Prefix for `log` output, e.g. `"sender"`.
    component: &'static str,
    file: Option<File>,
    history: Option<Vec<TransferRecord>>,
}

impl TransferLog {
    /// A log that only emits through the `log` facade.
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            file: None,
            history: None,
        }
    }

    /// Also append rows to `path`, writing the table header first.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        writeln!(file, "{HEADER}")?;
        writeln!(file, "{RULE}")?;
        self.file = Some(file);
        Ok(self)
    }

    /// Also keep every record in memory.
    pub fn with_history(mut self) -> Self {
        self.history = Some(Vec::new());
        self
    }

    pub fn record(&mut self, record: TransferRecord) {
        log::debug!("[{}] {}", self.component, record);
        self.write_line(&record.to_string());
        if let Some(history) = self.history.as_mut() {
            history.push(record);
        }
    }

    /// Log a progress line such as a retransmission or close.
    pub fn note(&mut self, message: &str) {
        log::info!("[{}] {}", self.component, message);
        self.write_line(message);
    }

    /// Records kept so far; empty unless built with [`with_history`](Self::with_history).
    pub fn records(&self) -> &[TransferRecord] {
        self.history.as_deref().unwrap_or(&[])
    }

    fn write_line(&mut self, line: &str) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = writeln!(file, "{line}") {
                log::warn!("[{}] transfer log write failed: {e}", self.component);
                self.file = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_formats_as_table_row() {
        let pkt = Packet::control(PacketType::Syn, 42, 0, 1);
        let rec = TransferRecord::new(Direction::Send, &pkt, "3WAY HS", 1, Duration::from_secs(1));
        assert_eq!(
            rec.to_string(),
            "    SEND |     SYN |         42 |          0 |      1 | 3WAY HS |      1 |         1 | 1s 0nsec"
        );
    }

    #[test]
    fn history_only_when_requested() {
        let pkt = Packet::control(PacketType::Ack, 1, 2, 3);
        let mut plain = TransferLog::new("test");
        plain.record(TransferRecord::new(Direction::Recv, &pkt, "CLOSE", 0, Duration::ZERO));
        assert!(plain.records().is_empty());

        let mut kept = TransferLog::new("test").with_history();
        kept.record(TransferRecord::new(Direction::Recv, &pkt, "CLOSE", 0, Duration::ZERO));
        assert_eq!(kept.records().len(), 1);
        assert_eq!(kept.records()[0].ack, 2);
    }

    #[test]
    fn file_gets_header_rows_and_notes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("output.log");
        let mut log = TransferLog::new("test").with_file(&path).unwrap();
        let pkt = Packet::control(PacketType::Fin, 9, 1, 4);
        log.record(TransferRecord::new(Direction::Send, &pkt, "CLOSE", 0, Duration::from_millis(2500)));
        log.note("Connection closed");
        drop(log);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], HEADER);
        assert!(lines[2].contains("FIN"));
        assert!(lines[2].ends_with("2s 500000000nsec"));
        assert_eq!(lines[3], "Connection closed");
    }
}
