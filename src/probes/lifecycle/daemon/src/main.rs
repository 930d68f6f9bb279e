//! tcpwatch: TCP connection lifecycle tracer
//!
//! Attaches kprobes to the kernel's TCP connect/accept/close paths,
//! discovers the `struct sock` field offsets it needs by guessing against
//! loopback connections, then streams connect/accept/close events.
//!
//! ## Usage
//!
//! ```bash
//! # Trace until interrupted, one line per event
//! sudo tcpwatch --ebpf-object path/to/tcpwatch-ebpf
//!
//! # Trace for a minute, emitting JSON
//! sudo tcpwatch --ebpf-object path/to/tcpwatch-ebpf --duration 60 --format json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;

use tcpwatch_userspace::{events, BpfStatusChannel, EventType, GuessConfig, ProbeLoader, TcpEvent};

/// TCP connection lifecycle tracer using eBPF
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the eBPF object file (if not embedded)
    #[clap(long)]
    ebpf_object: Option<PathBuf>,

    /// How long to trace (seconds, 0 = until interrupted)
    #[clap(short, long, default_value_t = 0)]
    duration: u64,

    /// Output format for events (text, json)
    #[clap(short, long, default_value = "text")]
    format: String,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Default)]
struct EventCounts {
    connect: u64,
    accept: u64,
    close: u64,
}

impl EventCounts {
    fn bump(&mut self, kind: EventType) {
        match kind {
            EventType::Connect => self.connect += 1,
            EventType::Accept => self.accept += 1,
            EventType::Close => self.close += 1,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let format = match args.format.to_lowercase().as_str() {
        "text" => OutputFormat::Text,
        "json" => OutputFormat::Json,
        _ => anyhow::bail!("unsupported format: {}. use text or json", args.format),
    };

    let mut loader = ProbeLoader::load(args.ebpf_object)?;
    loader.init_logger();
    loader.attach_probes()?;

    // The connect probes sample during the guessing dials, so they must
    // be attached before the session starts. The session itself is
    // synchronous socket work; keep it off the runtime threads.
    let status_map = loader.take_status_map()?;
    tokio::task::spawn_blocking(move || {
        let mut channel = BpfStatusChannel::new(status_map);
        tcpwatch_userspace::guess(&mut channel, &GuessConfig::default())
    })
    .await?
    .context("offset guessing failed")?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    events::spawn_readers(loader.take_events_v4()?, loader.take_events_v6()?, tx)?;

    info!("tracing tcp connections");

    let mut counts = EventCounts::default();
    tokio::select! {
        res = consume(&mut rx, &mut counts, format) => res?,
        _ = signal::ctrl_c() => info!("interrupted, shutting down"),
        _ = deadline(args.duration) => info!("duration reached, shutting down"),
    }

    info!(
        "summary: {} connect, {} accept, {} close",
        counts.connect, counts.accept, counts.close
    );

    Ok(())
}

async fn consume(
    rx: &mut mpsc::UnboundedReceiver<TcpEvent>,
    counts: &mut EventCounts,
    format: OutputFormat,
) -> Result<()> {
    while let Some(event) = rx.recv().await {
        counts.bump(event.kind);
        match format {
            OutputFormat::Text => println!("{event}"),
            OutputFormat::Json => println!("{}", serde_json::to_string(&event)?),
        }
    }
    Ok(())
}

async fn deadline(secs: u64) {
    match secs {
        0 => std::future::pending().await,
        n => tokio::time::sleep(Duration::from_secs(n)).await,
    }
}
