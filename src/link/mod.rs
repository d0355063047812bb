//! Unreliable datagram link consumed by the test controller.
//!
//! A link delivers whole frames, best effort, with no ordering guarantee.
//! Submitting a frame with [`Link::send`] returns immediately; the outcome of
//! the transmission is reported later through [`LinkHandler::on_send_complete`].
//! Inbound frames are pushed to [`LinkHandler::on_receive`]. Both callbacks run
//! on the link's own thread and must not block.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;

use crate::cli::{LinkOpts, Transport};
use crate::error::LinkError;

pub mod serial;
pub mod sim;
pub mod udp;

pub const ADDR_LEN: usize = 6;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(pub [u8; ADDR_LEN]);

impl PeerAddress {
    pub const BROADCAST: PeerAddress = PeerAddress([0xFF; ADDR_LEN]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for PeerAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; ADDR_LEN];
        let mut parts = s.split([':', '-']);
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("address '{s}' has fewer than {ADDR_LEN} octets"))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| format!("bad octet '{part}' in address '{s}'"))?;
        }
        if parts.next().is_some() {
            return Err(format!("address '{s}' has more than {ADDR_LEN} octets"));
        }
        Ok(PeerAddress(out))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateProfile {
    /// Link default
    Default,
    /// Conservative rate, fewer losses on weak signal
    Robust,
    /// Highest rate the link offers
    Fast,
}

impl FromStr for RateProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(RateProfile::Default),
            "robust" => Ok(RateProfile::Robust),
            "fast" => Ok(RateProfile::Fast),
            _ => Err(format!("unknown rate profile '{s}'")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    pub channel: u8,
    pub rate: RateProfile,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            channel: 1,
            rate: RateProfile::Default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    Failure,
}

/// Callbacks invoked from the link's delivery context.
pub trait LinkHandler: Send + Sync {
    fn on_send_complete(&self, peer: &PeerAddress, status: SendStatus);
    fn on_receive(&self, src: &PeerAddress, data: &[u8]);
}

/// Setup (`configure`, `register_peer`) happens while the link is still
/// exclusively owned; after that it is shared behind an `Arc` so a handler
/// can hold it and answer from the callback context.
pub trait Link: Send + Sync {
    /// Apply channel and rate. Called once, before `start`.
    fn configure(&mut self, config: &LinkConfig) -> Result<(), LinkError>;
    fn register_peer(&mut self, peer: PeerAddress) -> Result<(), LinkError>;
    /// Begin delivering callbacks to `handler`.
    fn start(&self, handler: Arc<dyn LinkHandler>) -> Result<(), LinkError>;
    /// Submit one frame. `Ok` means accepted, not delivered.
    fn send(&self, peer: &PeerAddress, data: &[u8]) -> Result<(), LinkError>;
    /// Largest frame `send` accepts.
    fn mtu(&self) -> usize;
    /// Stop callbacks and drop the handler.
    fn stop(&self);
}

/// Open the transport named on the command line.
pub fn open(opts: &LinkOpts) -> anyhow::Result<Box<dyn Link>> {
    let link: Box<dyn Link> = match opts.transport {
        Transport::Udp => Box::new(
            udp::UdpLink::open(opts.bind, opts.remote, opts.addr)
                .with_context(|| format!("bind {}", opts.bind))?,
        ),
        Transport::Serial => {
            let settings = serial::SerialSettings {
                dev: opts.dev.clone(),
                baud: opts.baud,
                rtscts: opts.rtscts,
            };
            Box::new(
                serial::SerialLink::open(&settings)
                    .with_context(|| format!("open {}", opts.dev))?,
            )
        }
    };
    Ok(link)
}
