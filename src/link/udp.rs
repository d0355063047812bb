//! Link over UDP between two hosts.
//!
//! Datagram layout: `channel | source address (6) | payload`. Frames on
//! another channel or from an unregistered source are dropped.

use std::collections::HashSet;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::{ADDR_LEN, Link, LinkConfig, LinkHandler, PeerAddress, SendStatus};
use crate::error::LinkError;

pub const UDP_MTU: usize = 1470;
const HEADER_LEN: usize = 1 + ADDR_LEN;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct UdpLink {
    socket: UdpSocket,
    remote: SocketAddr,
    local: PeerAddress,
    config: LinkConfig,
    peers: Arc<RwLock<HashSet<PeerAddress>>>,
    handler: RwLock<Option<Arc<dyn LinkHandler>>>,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

impl UdpLink {
    pub fn open(bind: SocketAddr, remote: SocketAddr, local: PeerAddress) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind(bind)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        debug!(%bind, %remote, %local, "[udp] socket bound");
        Ok(Self {
            socket,
            remote,
            local,
            config: LinkConfig::default(),
            peers: Arc::new(RwLock::new(HashSet::new())),
            handler: RwLock::new(None),
            running: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
        })
    }
}

pub(crate) fn encode(channel: u8, src: &PeerAddress, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(channel);
    out.extend_from_slice(&src.0);
    out.extend_from_slice(payload);
    out
}

pub(crate) fn decode(datagram: &[u8]) -> Option<(u8, PeerAddress, &[u8])> {
    if datagram.len() < HEADER_LEN {
        return None;
    }
    let mut addr = [0u8; ADDR_LEN];
    addr.copy_from_slice(&datagram[1..HEADER_LEN]);
    Some((datagram[0], PeerAddress(addr), &datagram[HEADER_LEN..]))
}

impl Link for UdpLink {
    fn configure(&mut self, config: &LinkConfig) -> Result<(), LinkError> {
        debug!(channel = config.channel, rate = ?config.rate, "[udp] configured");
        self.config = *config;
        Ok(())
    }

    fn register_peer(&mut self, peer: PeerAddress) -> Result<(), LinkError> {
        self.peers
            .write()
            .map_err(|_| LinkError::Closed)?
            .insert(peer);
        Ok(())
    }

    fn start(&self, handler: Arc<dyn LinkHandler>) -> Result<(), LinkError> {
        let socket = self.socket.try_clone()?;
        let peers = Arc::clone(&self.peers);
        let running = Arc::clone(&self.running);
        let channel = self.config.channel;
        let cb = Arc::clone(&handler);
        running.store(true, Ordering::Release);

        let reader = thread::spawn(move || {
            let mut buf = vec![0u8; HEADER_LEN + UDP_MTU];
            while running.load(Ordering::Acquire) {
                let n = match socket.recv_from(&mut buf) {
                    Ok((n, _)) => n,
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        warn!("[udp] recv: {}", e);
                        continue;
                    }
                };
                let Some((ch, src, payload)) = decode(&buf[..n]) else {
                    trace!(len = n, "[udp] runt datagram");
                    continue;
                };
                if ch != channel {
                    trace!(ch, "[udp] frame on other channel");
                    continue;
                }
                let known = peers.read().map(|p| p.contains(&src)).unwrap_or(false);
                if !known {
                    trace!(%src, "[udp] frame from unknown source");
                    continue;
                }
                cb.on_receive(&src, payload);
            }
        });
        *self.reader.lock().map_err(|_| LinkError::Closed)? = Some(reader);
        *self.handler.write().map_err(|_| LinkError::Closed)? = Some(handler);
        Ok(())
    }

    fn send(&self, peer: &PeerAddress, data: &[u8]) -> Result<(), LinkError> {
        let handler = self
            .handler
            .read()
            .map_err(|_| LinkError::Closed)?
            .clone()
            .ok_or(LinkError::NotStarted)?;
        let known = self
            .peers
            .read()
            .map_err(|_| LinkError::Closed)?
            .contains(peer);
        if !known {
            return Err(LinkError::UnknownPeer(*peer));
        }
        if data.len() > UDP_MTU {
            return Err(LinkError::TooLarge {
                len: data.len(),
                mtu: UDP_MTU,
            });
        }
        let datagram = encode(self.config.channel, &self.local, data);
        self.socket.send_to(&datagram, self.remote)?;
        // The kernel took the datagram; that is all UDP will ever confirm.
        handler.on_send_complete(peer, SendStatus::Success);
        Ok(())
    }

    fn mtu(&self) -> usize {
        UDP_MTU
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

impl Drop for UdpLink {
    fn drop(&mut self) {
        self.stop();
    }
}
