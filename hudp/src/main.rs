//! Entry point for `hudp`.
//!
//! Parses CLI arguments and dispatches into one of the three roles (sender,
//! receiver, emulator) or the offline `reconcile` step.  All protocol work is
//! delegated to library modules; `main.rs` owns only process setup (logging,
//! signal handling, argument parsing) and the demo traffic pattern.
//!
//! A typical run, one terminal per role:
//!
//! ```text
//! hudp emulator --loss 0.2 --delay 30 --jitter 20
//! hudp receiver --duration 15 --metrics-json recv.json
//! hudp sender   --duration 10 --metrics-json send.json --pdr-from recv.json
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::Rng;

use hudp::aggregate::{load_snapshot, reconcile_pair, reconcile_with_peer_file};
use hudp::config::{ReceiverConfig, SenderConfig, DEFAULT_GAP_TIMEOUT, DEFAULT_MAX_RETRIES, DEFAULT_RTO};
use hudp::emulator::{Emulator, EmulatorConfig, Endpoints, JitterDistribution};
use hudp::error::TransportError;
use hudp::metrics::MetricsSnapshot;
use hudp::packet::Channel;
use hudp::receiver::Receiver;
use hudp::sender::{ReliableOutcome, Sender};
use hudp::socket::Socket;

const SENDER_ADDR: &str = "127.0.0.1:12000";
const RECEIVER_ADDR: &str = "127.0.0.1:12001";
const EMULATOR_ADDR: &str = "127.0.0.1:11000";

/// Hybrid reliable / unreliable messaging over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Only log warnings and errors (RUST_LOG still wins).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Generate demo traffic on both channels.
    Sender(SenderArgs),
    /// Receive, ACK and count traffic.
    Receiver(ReceiverArgs),
    /// Relay between sender and receiver with loss, delay and jitter.
    Emulator(EmulatorArgs),
    /// Join a sender and a receiver snapshot into a PDR report.
    Reconcile {
        first: PathBuf,
        second: PathBuf,
    },
}

/// Options shared by the two metric-producing roles.
#[derive(Args)]
struct Output {
    /// Run time in seconds.
    #[arg(long)]
    duration: f64,

    /// Write the final metrics snapshot here as JSON.
    #[arg(long)]
    metrics_json: Option<PathBuf>,

    /// Peer snapshot to reconcile against for PDR.
    #[arg(long)]
    pdr_from: Option<PathBuf>,
}

#[derive(Args)]
struct SenderArgs {
    #[arg(long, default_value = SENDER_ADDR)]
    bind: SocketAddr,

    #[arg(long, default_value = RECEIVER_ADDR)]
    receiver: SocketAddr,

    #[arg(long, default_value = EMULATOR_ADDR)]
    emulator: SocketAddr,

    /// Send straight to the receiver, bypassing the emulator.
    #[arg(long)]
    direct: bool,

    #[command(flatten)]
    output: Output,

    /// Messages per second.
    #[arg(long, default_value_t = 10.0)]
    rate: f64,

    /// Fraction of messages sent on the reliable channel.
    #[arg(long, default_value_t = 0.5)]
    reliable_ratio: f64,

    /// Pad every payload to this many bytes.
    #[arg(long)]
    payload_size: Option<usize>,

    /// Retransmission timeout in ms (initial value when adaptive).
    #[arg(long, default_value_t = DEFAULT_RTO.as_millis() as u64)]
    rto: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    #[arg(long)]
    adaptive_rto: bool,
}

#[derive(Args)]
struct ReceiverArgs {
    #[arg(long, default_value = RECEIVER_ADDR)]
    bind: SocketAddr,

    #[command(flatten)]
    output: Output,

    /// Hand reliable messages up in sequence order.
    #[arg(long)]
    ordered: bool,

    /// How long a missing reliable seq may hold back delivery, in ms.
    #[arg(long, default_value_t = DEFAULT_GAP_TIMEOUT.as_millis() as u64)]
    gap_timeout: u64,
}

#[derive(Args)]
struct EmulatorArgs {
    #[arg(long, default_value = EMULATOR_ADDR)]
    bind: SocketAddr,

    #[arg(long, default_value = SENDER_ADDR)]
    sender: SocketAddr,

    #[arg(long, default_value = RECEIVER_ADDR)]
    receiver: SocketAddr,

    /// Drop probability in [0, 1].
    #[arg(long, default_value_t = 0.2)]
    loss: f64,

    /// Mean one-way delay in ms.
    #[arg(long, default_value_t = 30)]
    delay: u64,

    /// Jitter in ms (half-width, or σ with --gaussian).
    #[arg(long, default_value_t = 20)]
    jitter: u64,

    #[arg(long)]
    gaussian: bool,

    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    duration: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.mode {
        Mode::Sender(args) => run_sender(args).await,
        Mode::Receiver(args) => run_receiver(args).await,
        Mode::Emulator(args) => run_emulator(args).await,
        Mode::Reconcile { first, second } => run_reconcile(&first, &second),
    }
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

async fn run_sender(args: SenderArgs) -> Result<()> {
    if !(0.0..=1.0).contains(&args.reliable_ratio) {
        bail!("--reliable-ratio must be in [0, 1]");
    }
    let period = send_period(args.rate)?;
    let run_for = seconds(args.output.duration)?;

    let peer = if args.direct { args.receiver } else { args.emulator };
    let socket = Socket::bind(args.bind).await.context("sender startup")?;
    let config = SenderConfig {
        rto: Duration::from_millis(args.rto),
        max_retries: args.max_retries,
        adaptive_rto: args.adaptive_rto,
        ..SenderConfig::new(peer)
    };
    let grace = config
        .rto
        .saturating_mul(config.max_retries.saturating_add(2))
        .min(config.max_rto.saturating_mul(8));
    let (sender, mut completions) = Sender::start(socket, config).context("sender startup")?;

    let reporter = tokio::spawn(async move {
        while let Some(c) = completions.next().await {
            match c.outcome {
                ReliableOutcome::Delivered { latency } => {
                    log::debug!("[sender] seq={} delivered, latency {latency:?}", c.seq)
                }
                ReliableOutcome::Failed { retries } => {
                    log::warn!("[sender] seq={} failed after {retries} retries", c.seq)
                }
            }
        }
    });

    let mut ticker = tokio::time::interval(period);
    let deadline = tokio::time::Instant::now() + run_for;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                log::info!("[sender] interrupted");
                break;
            }
            _ = tokio::time::sleep_until(deadline) => break,
            _ = ticker.tick() => {
                let reliable = rand::rng().random::<f64>() < args.reliable_ratio;
                let channel = if reliable { Channel::Reliable } else { Channel::Unreliable };
                let payload = demo_payload(channel, args.payload_size);
                match sender.send(channel, &payload).await {
                    Ok(submitted) => log::info!("[sender] sent {channel} seq={}", submitted.seq()),
                    Err(TransportError::Closed) => break,
                    Err(e) => log::warn!("[sender] {channel} send failed: {e}"),
                }
            }
        }
    }

    if !sender.drain(grace).await {
        log::warn!(
            "[sender] {} reliable message(s) unresolved after {grace:?}",
            sender.pending()
        );
    }
    let snapshot = sender.shutdown().await.context("sender transport failed")?;
    let _ = reporter.await;

    finish(snapshot, &args.output)
}

async fn run_receiver(args: ReceiverArgs) -> Result<()> {
    let run_for = seconds(args.output.duration)?;

    let socket = Socket::bind(args.bind).await.context("receiver startup")?;
    let config = ReceiverConfig {
        ordered_reliable: args.ordered,
        gap_timeout: Duration::from_millis(args.gap_timeout),
        ..ReceiverConfig::default()
    };
    let mut receiver = Receiver::start(socket, config).context("receiver startup")?;
    let mut deliveries = receiver.poll()?;

    let deadline = tokio::time::sleep(run_for);
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                log::info!("[receiver] interrupted");
                break;
            }
            _ = &mut deadline => break,
            delivery = deliveries.next() => {
                let Some(d) = delivery else { break };
                log::info!(
                    "[receiver] got {} seq={} data={}",
                    d.channel,
                    d.seq,
                    String::from_utf8_lossy(&d.payload)
                );
            }
        }
    }

    let snapshot = receiver.shutdown().await.context("receiver transport failed")?;
    finish(snapshot, &args.output)
}

async fn run_emulator(args: EmulatorArgs) -> Result<()> {
    let config = EmulatorConfig {
        loss: args.loss,
        base_delay: Duration::from_millis(args.delay),
        jitter: Duration::from_millis(args.jitter),
        distribution: if args.gaussian {
            JitterDistribution::Gaussian
        } else {
            JitterDistribution::Uniform
        },
        seed: args.seed,
        ..EmulatorConfig::default()
    };
    let endpoints = Endpoints {
        sender: args.sender,
        receiver: args.receiver,
    };
    let emulator = Emulator::bind(args.bind, endpoints, config)
        .await
        .context("emulator startup")?
        .start();

    match args.duration {
        Some(secs) => {
            let run_for = seconds(secs)?;
            tokio::select! {
                _ = tokio::time::sleep(run_for) => {}
                _ = tokio::signal::ctrl_c() => log::info!("[emulator] interrupted"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            log::info!("[emulator] interrupted");
        }
    }

    let report = emulator.shutdown().await.context("emulator failed")?;
    println!(
        "[emulator] received={} dropped={} forwarded={} bytes={} unknown_source={}",
        report.received,
        report.dropped,
        report.forwarded,
        report.bytes_forwarded,
        report.unknown_source
    );
    Ok(())
}

fn run_reconcile(first: &Path, second: &Path) -> Result<()> {
    let mut a = load_snapshot(first).with_context(|| format!("reading {}", first.display()))?;
    let mut b = load_snapshot(second).with_context(|| format!("reading {}", second.display()))?;

    let report = reconcile_pair(&a, &b);
    report.apply(&mut a);
    report.apply(&mut b);
    print!("{}", a.summary_table());
    print!("{}", b.summary_table());
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Reconcile (if asked), export (if asked) and print the final snapshot.
fn finish(mut snapshot: MetricsSnapshot, output: &Output) -> Result<()> {
    if let Some(peer) = &output.pdr_from {
        reconcile_with_peer_file(&snapshot, peer).apply(&mut snapshot);
    }
    if let Some(path) = &output.metrics_json {
        let json = snapshot.to_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("writing metrics to {}", path.display()))?;
        log::info!("metrics written to {}", path.display());
    }
    print!("{}", snapshot.summary_table());
    Ok(())
}

/// `hello_R` / `hello_U`, optionally padded to `size` bytes.
fn demo_payload(channel: Channel, size: Option<usize>) -> Vec<u8> {
    let tag = match channel {
        Channel::Reliable => "R",
        Channel::Unreliable => "U",
    };
    let mut payload = format!("hello_{tag}").into_bytes();
    if let Some(size) = size {
        payload.resize(size, b'.');
    }
    payload
}

fn seconds(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).with_context(|| format!("invalid duration {secs}"))
}

/// Interval between demo messages for `rate` messages per second.
fn send_period(rate: f64) -> Result<Duration> {
    if !(rate.is_finite() && rate > 0.0) {
        bail!("--rate must be a positive number, got {rate}");
    }
    match Duration::try_from_secs_f64(1.0 / rate) {
        Ok(period) if !period.is_zero() => Ok(period),
        _ => bail!("--rate {rate} is too high"),
    }
}
