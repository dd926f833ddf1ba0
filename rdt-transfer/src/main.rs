//! Entry point for `rdt`.
//!
//! Parses CLI arguments and dispatches into **send**, **receive** or
//! **emulate** mode.  All protocol work is delegated to library modules;
//! `main.rs` owns only process setup (logging, signal handling, argument
//! parsing, configuration).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;

use rdt_transfer::config::{
    Config, EmulatorConfig, ReceiverConfig, SenderConfig, DEFAULT_WINDOW,
};
use rdt_transfer::connection::{receive_file, send_file};
use rdt_transfer::emulator::run_emulator;
use rdt_transfer::transfer_log::TransferLog;

/// Reliable file transfer with congestion control over a lossy relay.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Connection file with network_ip/network_port/receiver_ip/receiver_port.
    #[arg(short, long, global = true, default_value = "connections.cfg")]
    config: PathBuf,

    /// Append the per-packet transfer log to this file.
    #[arg(long, global = true, default_value = "output.log")]
    log_file: PathBuf,

    /// Do not write a transfer log file.
    #[arg(long, global = true)]
    no_log_file: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Send a file to the receiver through the network emulator.
    Send {
        /// File to transfer.
        file: PathBuf,
    },
    /// Wait for one sender and write the file it sends.
    Receive {
        /// Receive window, in 512-byte segments.
        #[arg(default_value_t = DEFAULT_WINDOW, value_parser = clap::value_parser!(u32).range(1..))]
        window: u32,
        /// Directory the received file is written into.
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Relay between sender and receiver, dropping and delaying packets.
    Emulate {
        /// Probability in 0.0..=1.0 that a packet is dropped.
        #[arg(value_parser = parse_rate)]
        ber: f64,
        /// Propagation delay added to every packet, in microseconds.
        delay_us: u64,
        /// Seed for reproducible drops.
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn parse_rate(s: &str) -> Result<f64, String> {
    let rate: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("{rate} is not within 0.0..=1.0"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let component = match cli.mode {
        Mode::Send { .. } => "sender",
        Mode::Receive { .. } => "receiver",
        Mode::Emulate { .. } => "emulator",
    };
    let mut log = TransferLog::new(component);
    if !cli.no_log_file {
        log = log
            .with_file(&cli.log_file)
            .with_context(|| format!("cannot open transfer log {}", cli.log_file.display()))?;
    }

    tokio::select! {
        res = run(cli.mode, &config, &mut log) => res,
        _ = tokio::signal::ctrl_c() => {
            log::info!("[{component}] interrupted; exiting");
            Ok(())
        }
    }
}

async fn run(mode: Mode, config: &Config, log: &mut TransferLog) -> anyhow::Result<()> {
    match mode {
        Mode::Send { file } => {
            let (host, port) = config.sender_target()?;
            log::info!("[sender] sending {} via {host}:{port}", file.display());
            send_file((host.as_str(), port), &file, &SenderConfig::default(), log)
                .await
                .with_context(|| format!("sending {}", file.display()))?;
        }
        Mode::Receive { window, output_dir } => {
            let port = config.receiver_port()?;
            let listener = TcpListener::bind(("0.0.0.0", port))
                .await
                .with_context(|| format!("cannot listen on port {port}"))?;
            log::info!("[receiver] listening on port {port}, window {window}");
            let receiver_config = ReceiverConfig {
                window,
                output_dir,
                ..ReceiverConfig::default()
            };
            receive_file(&listener, &receiver_config, log).await?;
        }
        Mode::Emulate {
            ber,
            delay_us,
            seed,
        } => {
            let (listen_port, host, port) = config.emulator_endpoints()?;
            let listener = TcpListener::bind(("0.0.0.0", listen_port))
                .await
                .with_context(|| format!("cannot listen on port {listen_port}"))?;
            log::info!("[emulator] listening on port {listen_port}");
            let emulator_config = EmulatorConfig {
                bit_error_rate: ber,
                delay: Duration::from_micros(delay_us),
                seed,
            };
            run_emulator(&listener, (host.as_str(), port), &emulator_config, log).await?;
        }
    }
    Ok(())
}
