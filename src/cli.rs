use anyhow::{Context, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;

use crate::frame::check_chunk_size;
use crate::handshake::RetryPolicy;
use crate::link::{LinkConfig, PeerAddress, RateProfile};
use crate::stats::ReportMode;
use crate::transfer::{ReceiveConfig, TransferConfig};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "link-hammer",
    about = "Peer-to-peer link tester (tx/rx) with handshake, pause/resume & throughput"
)]
pub struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Handshake with the peer, then send chunks as fast as the link allows
    Tx(TxOpts),
    /// Ack the handshake and count what arrives
    Rx(RxOpts),
    /// Run both roles in one process over a simulated lossy link
    Loopback(LoopbackOpts),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Serial,
}

#[derive(Args, Debug, Clone)]
pub struct LinkOpts {
    /// Transport carrying the frames
    #[arg(long, value_enum, default_value_t = Transport::Udp)]
    pub transport: Transport,
    /// Local UDP socket
    #[arg(long, default_value = "0.0.0.0:4210")]
    pub bind: SocketAddr,
    /// Remote UDP socket
    #[arg(long, default_value = "127.0.0.1:4211")]
    pub remote: SocketAddr,
    /// Serial device of the radio bridge
    #[arg(long, default_value = "/dev/ttyUSB0")]
    pub dev: String,
    /// Baud rate
    #[arg(long, default_value_t = 921_600)]
    pub baud: u32,
    /// Enable RTS/CTS
    #[arg(long, default_value_t = false)]
    pub rtscts: bool,
    /// Our link address (aa:bb:cc:dd:ee:ff)
    #[arg(long)]
    pub addr: PeerAddress,
    /// Peer link address
    #[arg(long)]
    pub peer: PeerAddress,
    /// Radio channel, same on both ends
    #[arg(long, default_value_t = 1)]
    pub channel: u8,
    /// "default", "robust" or "fast"
    #[arg(long, default_value = "default")]
    pub rate: RateProfile,
}

impl LinkOpts {
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            channel: self.channel,
            rate: self.rate,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseInput {
    /// Enter on stdin toggles pause
    Stdin,
    /// Push button pulling the CTS line of `--button-dev`
    Cts,
    #[value(name = "none")]
    Off,
}

#[derive(Args, Debug, Clone)]
pub struct TxOpts {
    #[command(flatten)]
    pub link: LinkOpts,
    /// Chunk size in bytes, same on both ends
    #[arg(long, default_value_t = 1024)]
    pub len: usize,
    /// "max" or milliseconds between chunks
    #[arg(long, default_value = "max")]
    pub gap: String,
    /// Handshake retry interval in ms
    #[arg(long, default_value_t = 50)]
    pub retry_ms: u64,
    /// Back off the retry interval up to this many ms (default: no backoff)
    #[arg(long)]
    pub max_retry_ms: Option<u64>,
    /// Handshake attempts before giving up
    #[arg(long, default_value_t = 200)]
    pub attempts: u32,
    /// Seconds of active sending before stopping
    #[arg(long)]
    pub duration: Option<f64>,
    /// Chunks to send before stopping
    #[arg(long)]
    pub frames: Option<u64>,
    /// Max wait for a send completion, ms
    #[arg(long, default_value_t = 2000)]
    pub stall_ms: u64,
    /// Where pause/resume presses come from
    #[arg(long, value_enum, default_value_t = PauseInput::Stdin)]
    pub pause_input: PauseInput,
    /// Serial device whose CTS line carries the button
    #[arg(long, default_value = "/dev/ttyUSB1")]
    pub button_dev: String,
    /// Also toggle pause every N seconds
    #[arg(long)]
    pub toggle_every: Option<f64>,
    /// Pause locally without sending Stop/Continue
    #[arg(long, default_value_t = false)]
    pub no_pause_signal: bool,
    /// "periodic" or "boundaries"
    #[arg(long, default_value = "periodic")]
    pub report: String,
    /// Periodic report interval in seconds
    #[arg(long, default_value_t = 5.0)]
    pub stats: f64,
}

#[derive(Args, Debug, Clone)]
pub struct RxOpts {
    #[command(flatten)]
    pub link: LinkOpts,
    /// Chunk size in bytes, same on both ends
    #[arg(long, default_value_t = 1024)]
    pub len: usize,
    /// "periodic" or "boundaries"
    #[arg(long, default_value = "periodic")]
    pub report: String,
    /// Periodic report interval in seconds
    #[arg(long, default_value_t = 5.0)]
    pub stats: f64,
    /// Treat this many ms without data as a pause
    #[arg(long)]
    pub silence_ms: Option<u64>,
    /// Seconds of active receiving before stopping
    #[arg(long)]
    pub duration: Option<f64>,
    /// Give up if no handshake arrives within N seconds
    #[arg(long)]
    pub idle_timeout: Option<f64>,
}

#[derive(Args, Debug, Clone)]
pub struct LoopbackOpts {
    /// Chunk size in bytes
    #[arg(long, default_value_t = 1024)]
    pub len: usize,
    /// "max" or milliseconds between chunks
    #[arg(long, default_value = "max")]
    pub gap: String,
    /// Frame loss probability, 0.0..1.0
    #[arg(long, default_value_t = 0.0)]
    pub loss: f64,
    /// Seed for the loss pattern
    #[arg(long, default_value_t = 0x5EED)]
    pub seed: u64,
    /// Make the transmitter's link reject every submission after N
    #[arg(long)]
    pub fail_after: Option<u64>,
    /// Seconds of active sending
    #[arg(long, default_value_t = 3.0)]
    pub duration: f64,
    /// Toggle pause every N seconds
    #[arg(long)]
    pub toggle_every: Option<f64>,
    /// Handshake attempts before giving up
    #[arg(long, default_value_t = 200)]
    pub attempts: u32,
    /// "periodic" or "boundaries"
    #[arg(long, default_value = "periodic")]
    pub report: String,
    /// Periodic report interval in seconds
    #[arg(long, default_value_t = 1.0)]
    pub stats: f64,
}

/// Typed pacing model for the gap between chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    Max,
    Fixed(Duration),
}

impl Pacing {
    pub fn from_cli(gap: &str) -> anyhow::Result<Self> {
        if gap.eq_ignore_ascii_case("max") {
            Ok(Pacing::Max)
        } else {
            let ms: u64 = gap
                .parse()
                .map_err(|_| anyhow!("gap must be integer ms or 'max'"))?;
            Ok(Pacing::Fixed(Duration::from_millis(ms)))
        }
    }

    pub fn sleep_for(self) -> Option<Duration> {
        match self {
            Pacing::Max => None,
            Pacing::Fixed(d) if d.is_zero() => None,
            Pacing::Fixed(d) => Some(d),
        }
    }
}

pub fn seconds(name: &str, v: Option<f64>) -> anyhow::Result<Option<Duration>> {
    match v {
        None => Ok(None),
        Some(s) if s > 0.0 && s.is_finite() => Duration::try_from_secs_f64(s)
            .map(Some)
            .map_err(|e| anyhow!("--{name} {s}: {e}")),
        Some(s) => bail!("--{name} must be a positive number of seconds, got {s}"),
    }
}

/// Upper bound for the millisecond timing options.
pub const MAX_WAIT_MS: u64 = 3_600_000;

fn millis(name: &str, ms: u64) -> anyhow::Result<Duration> {
    if ms > MAX_WAIT_MS {
        bail!("--{name} must be at most {MAX_WAIT_MS} ms, got {ms}");
    }
    Ok(Duration::from_millis(ms))
}

/// Everything a role needs, validated.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub local: PeerAddress,
    pub peer: PeerAddress,
    pub link: LinkConfig,
    pub report: ReportMode,
    pub retry: RetryPolicy,
    pub transfer: TransferConfig,
    pub receive: ReceiveConfig,
}

impl SessionConfig {
    /// Common checks; `mtu` is the link's.
    fn base(
        local: PeerAddress,
        peer: PeerAddress,
        link: LinkConfig,
        len: usize,
        mtu: usize,
        report: (&str, f64),
    ) -> anyhow::Result<Self> {
        if local == peer {
            bail!("local address and peer address are both {local}");
        }
        let chunk_size = check_chunk_size(len, mtu).context("--len")?;
        Ok(Self {
            local,
            peer,
            link,
            report: ReportMode::from_cli(report.0, report.1)?,
            retry: RetryPolicy::default(),
            transfer: TransferConfig {
                chunk_size,
                duration: None,
                max_chunks: None,
                stall_timeout: Duration::from_secs(2),
                pacing: Pacing::Max,
                signal_pause: true,
            },
            receive: ReceiveConfig::default(),
        })
    }

    pub fn for_tx(opts: &TxOpts, mtu: usize) -> anyhow::Result<Self> {
        let mut cfg = Self::base(
            opts.link.addr,
            opts.link.peer,
            opts.link.link_config(),
            opts.len,
            mtu,
            (&opts.report, opts.stats),
        )?;
        if opts.attempts == 0 {
            bail!("--attempts must be at least 1");
        }
        let interval = millis("retry-ms", opts.retry_ms.max(1))?;
        let stall = millis("stall-ms", opts.stall_ms)?;
        let max_interval = match opts.max_retry_ms {
            Some(ms) => millis("max-retry-ms", ms)?.max(interval),
            None => interval,
        };
        cfg.retry = RetryPolicy {
            interval,
            max_interval,
            max_attempts: opts.attempts,
            completion_timeout: stall,
        };
        cfg.transfer.duration = seconds("duration", opts.duration)?;
        cfg.transfer.max_chunks = opts.frames;
        cfg.transfer.stall_timeout = stall;
        cfg.transfer.pacing = Pacing::from_cli(&opts.gap)?;
        cfg.transfer.signal_pause = !opts.no_pause_signal;
        Ok(cfg)
    }

    pub fn for_rx(opts: &RxOpts, mtu: usize) -> anyhow::Result<Self> {
        let mut cfg = Self::base(
            opts.link.addr,
            opts.link.peer,
            opts.link.link_config(),
            opts.len,
            mtu,
            (&opts.report, opts.stats),
        )?;
        cfg.receive = ReceiveConfig {
            duration: seconds("duration", opts.duration)?,
            idle_timeout: seconds("idle-timeout", opts.idle_timeout)?,
            silence: opts.silence_ms.map(Duration::from_millis),
        };
        Ok(cfg)
    }

    pub fn for_loopback(
        opts: &LoopbackOpts,
        local: PeerAddress,
        peer: PeerAddress,
        mtu: usize,
    ) -> anyhow::Result<Self> {
        if !(0.0..=1.0).contains(&opts.loss) {
            bail!("--loss must be within 0.0..=1.0, got {}", opts.loss);
        }
        let mut cfg = Self::base(
            local,
            peer,
            LinkConfig::default(),
            opts.len,
            mtu,
            (&opts.report, opts.stats),
        )?;
        if opts.attempts == 0 {
            bail!("--attempts must be at least 1");
        }
        cfg.retry.max_attempts = opts.attempts;
        cfg.transfer.duration = seconds("duration", Some(opts.duration))?;
        cfg.transfer.pacing = Pacing::from_cli(&opts.gap)?;
        Ok(cfg)
    }
}
