//! Link through a USB-UART radio bridge.
//!
//! The bridge is a small radio board that forwards frames between its serial
//! port and the air. Host and bridge exchange binary records:
//!
//! ```text
//! A5 5A | kind | addr (6) | len (u16 LE) | payload (len) | sum
//! ```
//!
//! `sum` is the wrapping byte sum of everything from `kind` to the end of the
//! payload. Kinds:
//!
//! | kind | dir         | addr         | payload                 |
//! |------|-------------|--------------|-------------------------|
//! | 0x00 | host->radio | destination  | frame                   |
//! | 0x01 | host->radio | zero         | `[channel, rate]`       |
//! | 0x02 | host->radio | peer         | `[channel]`             |
//! | 0x80 | radio->host | source       | frame                   |
//! | 0x81 | radio->host | destination  | `[0]` ok, `[1]` failed  |

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, trace, warn};

use super::{ADDR_LEN, Link, LinkConfig, LinkHandler, PeerAddress, RateProfile, SendStatus};
use crate::error::LinkError;
use crate::frame::checksum;

pub const BRIDGE_MTU: usize = 1470;
const SYNC: [u8; 2] = [0xA5, 0x5A];
const HEAD_LEN: usize = 2 + 1 + ADDR_LEN + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Data = 0x00,
    Config = 0x01,
    AddPeer = 0x02,
    Received = 0x80,
    SendStatus = 0x81,
}

impl RecordKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(RecordKind::Data),
            0x01 => Some(RecordKind::Config),
            0x02 => Some(RecordKind::AddPeer),
            0x80 => Some(RecordKind::Received),
            0x81 => Some(RecordKind::SendStatus),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordKind,
    pub addr: PeerAddress,
    pub payload: Vec<u8>,
}

pub fn encode_record(kind: RecordKind, addr: &PeerAddress, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEAD_LEN + payload.len() + 1);
    out.extend_from_slice(&SYNC);
    out.push(kind as u8);
    out.extend_from_slice(&addr.0);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out.push(checksum(&out[2..]));
    out
}

/// Incremental record parser that resynchronises on the sync bytes.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    buf: Vec<u8>,
    dropped: u64,
}

impl RecordDecoder {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Records rejected for a bad checksum, length or kind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn next_record(&mut self) -> Option<Record> {
        loop {
            let start = self.buf.windows(2).position(|w| w == SYNC);
            match start {
                Some(0) => {}
                Some(n) => {
                    self.buf.drain(..n);
                }
                None => {
                    // keep a trailing 0xA5, it may be half of the next sync
                    let keep = usize::from(self.buf.last() == Some(&SYNC[0]));
                    let cut = self.buf.len() - keep;
                    self.buf.drain(..cut);
                    return None;
                }
            }
            if self.buf.len() < HEAD_LEN {
                return None;
            }
            let len = u16::from_le_bytes([self.buf[HEAD_LEN - 2], self.buf[HEAD_LEN - 1]]) as usize;
            if len > BRIDGE_MTU {
                self.reject();
                continue;
            }
            let total = HEAD_LEN + len + 1;
            if self.buf.len() < total {
                return None;
            }
            let sum = self.buf[total - 1];
            let kind = RecordKind::from_byte(self.buf[2]);
            match kind {
                Some(kind) if checksum(&self.buf[2..total - 1]) == sum => {
                    let mut addr = [0u8; ADDR_LEN];
                    addr.copy_from_slice(&self.buf[3..3 + ADDR_LEN]);
                    let payload = self.buf[HEAD_LEN..HEAD_LEN + len].to_vec();
                    self.buf.drain(..total);
                    return Some(Record {
                        kind,
                        addr: PeerAddress(addr),
                        payload,
                    });
                }
                _ => self.reject(),
            }
        }
    }

    // Skip this sync pair and look for the next one.
    fn reject(&mut self) {
        self.dropped += 1;
        self.buf.drain(..2);
    }
}

#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub dev: String,
    pub baud: u32,
    pub rtscts: bool,
}

pub fn open_port(opts: &SerialSettings) -> Result<Box<dyn SerialPort>, LinkError> {
    let builder = serialport::new(&opts.dev, opts.baud)
        .timeout(Duration::from_millis(100))
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(if opts.rtscts {
            FlowControl::Hardware
        } else {
            FlowControl::None
        });

    Ok(builder.open()?)
}

fn rate_byte(rate: RateProfile) -> u8 {
    match rate {
        RateProfile::Default => 0,
        RateProfile::Robust => 1,
        RateProfile::Fast => 2,
    }
}

pub struct SerialLink {
    writer: Mutex<Box<dyn SerialPort>>,
    config: LinkConfig,
    handler: RwLock<Option<Arc<dyn LinkHandler>>>,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SerialLink {
    pub fn open(opts: &SerialSettings) -> Result<Self, LinkError> {
        let port = open_port(opts)?;
        debug!(dev = %opts.dev, baud = opts.baud, "[serial] bridge port open");
        Ok(Self {
            writer: Mutex::new(port),
            config: LinkConfig::default(),
            handler: RwLock::new(None),
            running: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
        })
    }

    fn write_record(&self, kind: RecordKind, addr: &PeerAddress, payload: &[u8]) -> Result<(), LinkError> {
        let rec = encode_record(kind, addr, payload);
        let mut port = self.writer.lock().map_err(|_| LinkError::Closed)?;
        port.write_all(&rec)?;
        Ok(())
    }
}

fn dispatch(rec: Record, handler: &dyn LinkHandler) {
    match rec.kind {
        RecordKind::Received => handler.on_receive(&rec.addr, &rec.payload),
        RecordKind::SendStatus => {
            let status = match rec.payload.first() {
                Some(0) => SendStatus::Success,
                _ => SendStatus::Failure,
            };
            handler.on_send_complete(&rec.addr, status);
        }
        other => trace!(kind = ?other, "[serial] unexpected record from bridge"),
    }
}

impl Link for SerialLink {
    fn configure(&mut self, config: &LinkConfig) -> Result<(), LinkError> {
        self.write_record(
            RecordKind::Config,
            &PeerAddress([0; ADDR_LEN]),
            &[config.channel, rate_byte(config.rate)],
        )?;
        self.config = *config;
        Ok(())
    }

    fn register_peer(&mut self, peer: PeerAddress) -> Result<(), LinkError> {
        self.write_record(RecordKind::AddPeer, &peer, &[self.config.channel])
    }

    fn start(&self, handler: Arc<dyn LinkHandler>) -> Result<(), LinkError> {
        let mut port = self
            .writer
            .lock()
            .map_err(|_| LinkError::Closed)?
            .try_clone()?;
        let running = Arc::clone(&self.running);
        let cb = Arc::clone(&handler);
        running.store(true, Ordering::Release);

        let reader = thread::spawn(move || {
            let mut decoder = RecordDecoder::default();
            let mut buf = [0u8; 512];
            while running.load(Ordering::Acquire) {
                match port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => decoder.push(&buf[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        warn!("[serial] read: {}", e);
                        break;
                    }
                }
                while let Some(rec) = decoder.next_record() {
                    dispatch(rec, cb.as_ref());
                }
            }
            debug!(dropped = decoder.dropped(), "[serial] reader exit");
        });
        *self.reader.lock().map_err(|_| LinkError::Closed)? = Some(reader);
        *self.handler.write().map_err(|_| LinkError::Closed)? = Some(handler);
        Ok(())
    }

    fn send(&self, peer: &PeerAddress, data: &[u8]) -> Result<(), LinkError> {
        let started = self
            .handler
            .read()
            .map_err(|_| LinkError::Closed)?
            .is_some();
        if !started {
            return Err(LinkError::NotStarted);
        }
        if data.len() > BRIDGE_MTU {
            return Err(LinkError::TooLarge {
                len: data.len(),
                mtu: BRIDGE_MTU,
            });
        }
        // Completion arrives later as a SendStatus record.
        self.write_record(RecordKind::Data, peer, data)
    }

    fn mtu(&self) -> usize {
        BRIDGE_MTU
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let reader = self.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(h) = reader {
            let _ = h.join();
        }
        if let Ok(mut h) = self.handler.write() {
            *h = None;
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.stop();
    }
}
