//! Transfers routed through the network emulator.
//!
//! Topology, all on loopback:
//!
//! ```text
//! sender ──connect──▶ emulator listener
//!                     emulator ──connect──▶ receiver listener
//! ```

use std::io::Cursor;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use rdt_transfer::config::{EmulatorConfig, ReceiverConfig, SenderConfig};
use rdt_transfer::connection::{run_receiver, run_sender};
use rdt_transfer::emulator::{run_emulator, NetworkEmulator, RelayStats, Route};
use rdt_transfer::packet::{Packet, PacketType};
use rdt_transfer::receiver::{MemorySink, Receiver, ReceiverSummary};
use rdt_transfer::sender::{Sender, SenderSummary};
use rdt_transfer::socket::PacketStream;
use rdt_transfer::transfer_log::{Direction, TransferLog};

const GUARD: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

async fn bind_loopback() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    (listener, addr)
}

fn spawn_receiver(
    listener: TcpListener,
    config: ReceiverConfig,
) -> JoinHandle<rdt_transfer::Result<(ReceiverSummary, MemorySink)>> {
    tokio::spawn(async move {
        let mut stream = PacketStream::accept(&listener).await?;
        let mut receiver = Receiver::new(MemorySink::default(), &config);
        let mut log = TransferLog::new("receiver");
        let summary = run_receiver(&mut stream, &mut receiver, &mut log).await?;
        Ok((summary, receiver.into_sink()))
    })
}

async fn run_sender_to(
    addr: SocketAddr,
    data: Vec<u8>,
    config: &SenderConfig,
) -> (SenderSummary, bool) {
    let mut stream = PacketStream::connect(addr).await.expect("connect");
    let mut sender = Sender::new("relayed.bin", Cursor::new(data), config).expect("sender");
    let mut log = TransferLog::new("sender");
    let summary = tokio::time::timeout(GUARD, run_sender(&mut stream, &mut sender, &mut log))
        .await
        .expect("sender timed out")
        .expect("sender failed");
    (summary, sender.window().is_empty())
}

async fn join<T>(task: JoinHandle<rdt_transfer::Result<T>>, what: &str) -> T {
    match tokio::time::timeout(GUARD, task).await {
        Ok(Ok(Ok(value))) => value,
        Ok(Ok(Err(e))) => panic!("{what} failed: {e}"),
        Ok(Err(e)) => panic!("{what} panicked: {e}"),
        Err(_) => panic!("{what} timed out"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// With no loss and no delay the relay is transparent.
#[tokio::test]
async fn zero_loss_relay_delivers_identical_bytes() {
    let (receiver_listener, receiver_addr) = bind_loopback().await;
    let (emulator_listener, emulator_addr) = bind_loopback().await;

    let receiver = spawn_receiver(receiver_listener, ReceiverConfig::default());
    let emulator: JoinHandle<rdt_transfer::Result<RelayStats>> = tokio::spawn(async move {
        let config = EmulatorConfig {
            bit_error_rate: 0.0,
            delay: Duration::ZERO,
            seed: Some(7),
        };
        let mut log = TransferLog::new("emulator");
        run_emulator(&emulator_listener, receiver_addr, &config, &mut log).await
    });

    let data = pattern(10_000);
    let (sent, window_drained) =
        run_sender_to(emulator_addr, data.clone(), &SenderConfig::default()).await;
    let (received, sink) = join(receiver, "receiver").await;
    let stats = join(emulator, "emulator").await;

    assert!(window_drained);
    assert_eq!(sink.data, data);
    assert_eq!(received.bytes, 10_000);
    assert_eq!(sent.bytes, 10_000);

    assert_eq!(stats.to_receiver.dropped, 0);
    assert_eq!(stats.to_sender.dropped, 0);
    assert!(stats.to_receiver.relayed >= 20 + 3, "{stats}");
    assert!(stats.to_sender.relayed >= 2, "{stats}");
}

/// Losing one data segment leaves a hole the receiver buffers around until
/// the sender fills it.
#[tokio::test]
async fn dropped_segment_is_recovered() {
    let (receiver_listener, receiver_addr) = bind_loopback().await;
    let (emulator_listener, emulator_addr) = bind_loopback().await;

    let receiver = spawn_receiver(receiver_listener, ReceiverConfig::default());

    // Data-bearing packets towards the receiver: #0 is the filename, so #5
    // is the fifth file segment.  Only its first transmission is lost.
    let mut seen = 0usize;
    let policy = move |packet: &Packet, route: Route| {
        if route != Route::ToReceiver || !packet.packet_type.carries_data() {
            return false;
        }
        seen += 1;
        seen == 6
    };
    let emulator: JoinHandle<rdt_transfer::Result<RelayStats>> = tokio::spawn(async move {
        let sender_side = PacketStream::accept(&emulator_listener).await?;
        let receiver_side = PacketStream::connect(receiver_addr).await?;
        NetworkEmulator::new(policy, Duration::ZERO)
            .relay(sender_side, receiver_side, &mut TransferLog::new("emulator"))
            .await
    });

    let data = pattern(20 * 512);
    let (sent, window_drained) =
        run_sender_to(emulator_addr, data.clone(), &SenderConfig::default()).await;
    let (received, sink) = join(receiver, "receiver").await;
    let stats = join(emulator, "emulator").await;

    assert!(window_drained);
    assert_eq!(sink.data, data, "file reassembled incorrectly");
    assert_eq!(stats.to_receiver.dropped, 1);
    assert!(sent.retransmissions >= 1, "{sent:?}");
    assert!(received.buffered >= 1, "{received:?}");
    assert_eq!(received.segments, 20);
}

/// A lost ACK on the return path is covered by later cumulative ACKs.
#[tokio::test]
async fn dropped_ack_is_absorbed() {
    let (receiver_listener, receiver_addr) = bind_loopback().await;
    let (emulator_listener, emulator_addr) = bind_loopback().await;

    let receiver = spawn_receiver(receiver_listener, ReceiverConfig::default());

    let mut acks = 0usize;
    let policy = move |packet: &Packet, route: Route| {
        if route != Route::ToSender || packet.packet_type != PacketType::Ack {
            return false;
        }
        acks += 1;
        acks == 4
    };
    let emulator: JoinHandle<rdt_transfer::Result<RelayStats>> = tokio::spawn(async move {
        let sender_side = PacketStream::accept(&emulator_listener).await?;
        let receiver_side = PacketStream::connect(receiver_addr).await?;
        NetworkEmulator::new(policy, Duration::ZERO)
            .relay(sender_side, receiver_side, &mut TransferLog::new("emulator"))
            .await
    });

    let data = pattern(12 * 512 + 100);
    let (_, window_drained) =
        run_sender_to(emulator_addr, data.clone(), &SenderConfig::default()).await;
    let (_, sink) = join(receiver, "receiver").await;
    let stats = join(emulator, "emulator").await;

    assert!(window_drained);
    assert_eq!(sink.data, data);
    assert_eq!(stats.to_sender.dropped, 1);
}

/// Delayed packets still arrive intact, and the relay logs each one on the
/// way in and on the way out.
#[tokio::test]
async fn delayed_relay_delivers_identical_bytes() {
    let (receiver_listener, receiver_addr) = bind_loopback().await;
    let (emulator_listener, emulator_addr) = bind_loopback().await;

    let receiver = spawn_receiver(receiver_listener, ReceiverConfig::default());
    let emulator: JoinHandle<rdt_transfer::Result<(RelayStats, TransferLog)>> =
        tokio::spawn(async move {
            let config = EmulatorConfig {
                bit_error_rate: 0.0,
                delay: Duration::from_millis(3),
                seed: Some(11),
            };
            let mut log = TransferLog::new("emulator").with_history();
            let stats = run_emulator(&emulator_listener, receiver_addr, &config, &mut log).await?;
            Ok((stats, log))
        });

    let data = pattern(10_000);
    let (_, window_drained) =
        run_sender_to(emulator_addr, data.clone(), &SenderConfig::default()).await;
    let (_, sink) = join(receiver, "receiver").await;
    let (stats, log) = join(emulator, "emulator").await;

    assert!(window_drained);
    assert_eq!(sink.data, data);
    assert_eq!(stats.to_receiver.dropped + stats.to_sender.dropped, 0);

    let records = log.records();
    let arrivals = records.iter().filter(|r| r.direction == Direction::Recv).count() as u64;
    let deliveries = records.iter().filter(|r| r.direction == Direction::Send).count() as u64;
    assert_eq!(deliveries, stats.to_receiver.relayed + stats.to_sender.relayed);
    assert!(arrivals >= deliveries);
    assert!(records
        .iter()
        .all(|r| r.phase == Route::ToReceiver.label() || r.phase == Route::ToSender.label()));
    assert!(records.iter().all(|r| r.timeout == Duration::from_millis(3)));
}

/// Heavy seeded loss in both directions slows the transfer down but never
/// aborts it: every phase keeps retransmitting until it gets through.
#[tokio::test]
async fn seeded_bit_errors_do_not_abort_transfer() {
    let (receiver_listener, receiver_addr) = bind_loopback().await;
    let (emulator_listener, emulator_addr) = bind_loopback().await;

    let receiver_config = ReceiverConfig {
        control_timeout: Duration::from_millis(50),
        ..ReceiverConfig::default()
    };
    let receiver = spawn_receiver(receiver_listener, receiver_config);
    let emulator: JoinHandle<rdt_transfer::Result<RelayStats>> = tokio::spawn(async move {
        let config = EmulatorConfig {
            bit_error_rate: 0.4,
            delay: Duration::ZERO,
            seed: Some(0x5eed),
        };
        let mut log = TransferLog::new("emulator");
        run_emulator(&emulator_listener, receiver_addr, &config, &mut log).await
    });

    let sender_config = SenderConfig {
        initial_rtt: Duration::from_millis(10),
        initial_timeout: Duration::from_millis(50),
        max_timeout: Duration::from_millis(400),
        ..SenderConfig::default()
    };
    let data = pattern(20 * 512);
    let (sent, _) = run_sender_to(emulator_addr, data.clone(), &sender_config).await;
    let (_, sink) = join(receiver, "receiver").await;
    let stats = join(emulator, "emulator").await;

    assert_eq!(sink.data, data, "file reassembled incorrectly");
    assert!(sink.finished);
    assert!(stats.to_receiver.dropped + stats.to_sender.dropped > 0, "{stats}");
    assert!(sent.retransmissions > 0, "{sent:?}");
}
