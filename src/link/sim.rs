//! In-process link medium with random loss.
//!
//! Frames are delivered synchronously on the sending thread, which then also
//! receives the send completion. Unicast completions report `Failure` when
//! the frame was dropped, like a radio that saw no link-layer ack; broadcast
//! completions always report `Success`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use super::{Link, LinkConfig, LinkHandler, PeerAddress, SendStatus};
use crate::error::LinkError;

pub const SIM_MTU: usize = 1470;

#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Probability in 0.0..=1.0 that a frame is lost
    pub loss: f64,
    pub seed: u64,
    pub mtu: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            loss: 0.0,
            seed: 0x5EED,
            mtu: SIM_MTU,
        }
    }
}

struct Station {
    channel: u8,
    handler: Arc<dyn LinkHandler>,
}

pub struct SimMedium {
    config: SimConfig,
    rng: Mutex<StdRng>,
    stations: Mutex<HashMap<PeerAddress, Station>>,
}

impl SimMedium {
    pub fn new(config: SimConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            stations: Mutex::new(HashMap::new()),
        })
    }

    /// A link attached to this medium under `local`.
    pub fn attach(self: &Arc<Self>, local: PeerAddress) -> SimLink {
        SimLink {
            medium: Arc::clone(self),
            local,
            config: LinkConfig::default(),
            peers: HashSet::new(),
            handler: RwLock::new(None),
            fail_after: None,
            submitted: AtomicU64::new(0),
        }
    }

    fn lost(&self) -> bool {
        if self.config.loss <= 0.0 {
            return false;
        }
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_bool(self.config.loss.min(1.0)),
            Err(_) => false,
        }
    }

    /// Handlers on `channel` that should see a frame from `src` to `dst`.
    fn receivers(
        &self,
        src: PeerAddress,
        dst: PeerAddress,
        channel: u8,
    ) -> Vec<Arc<dyn LinkHandler>> {
        let Ok(stations) = self.stations.lock() else {
            return Vec::new();
        };
        stations
            .iter()
            .filter(|(addr, st)| {
                **addr != src && st.channel == channel && (dst.is_broadcast() || **addr == dst)
            })
            .map(|(_, st)| Arc::clone(&st.handler))
            .collect()
    }
}

pub struct SimLink {
    medium: Arc<SimMedium>,
    local: PeerAddress,
    config: LinkConfig,
    peers: HashSet<PeerAddress>,
    handler: RwLock<Option<Arc<dyn LinkHandler>>>,
    fail_after: Option<u64>,
    submitted: AtomicU64,
}

impl SimLink {
    /// Make every submission after the first `n` fail.
    pub fn fail_after(mut self, n: u64) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }
}

impl Link for SimLink {
    fn configure(&mut self, config: &LinkConfig) -> Result<(), LinkError> {
        self.config = *config;
        Ok(())
    }

    fn register_peer(&mut self, peer: PeerAddress) -> Result<(), LinkError> {
        self.peers.insert(peer);
        Ok(())
    }

    fn start(&self, handler: Arc<dyn LinkHandler>) -> Result<(), LinkError> {
        let mut stations = self.medium.stations.lock().map_err(|_| LinkError::Closed)?;
        stations.insert(
            self.local,
            Station {
                channel: self.config.channel,
                handler: Arc::clone(&handler),
            },
        );
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
        if !self.peers.contains(peer) {
            return Err(LinkError::UnknownPeer(*peer));
        }
        if data.len() > self.medium.config.mtu {
            return Err(LinkError::TooLarge {
                len: data.len(),
                mtu: self.medium.config.mtu,
            });
        }
        let n = self.submitted.fetch_add(1, Ordering::Relaxed);
        if let Some(limit) = self.fail_after
            && n >= limit
        {
            return Err(LinkError::Injected);
        }

        let mut delivered = false;
        for rx in self
            .medium
            .receivers(self.local, *peer, self.config.channel)
        {
            if self.medium.lost() {
                trace!(len = data.len(), "[sim] frame lost");
                continue;
            }
            rx.on_receive(&self.local, data);
            delivered = true;
        }

        let status = if delivered || peer.is_broadcast() {
            SendStatus::Success
        } else {
            SendStatus::Failure
        };
        handler.on_send_complete(peer, status);
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.medium.config.mtu
    }

    fn stop(&self) {
        if let Ok(mut stations) = self.medium.stations.lock() {
            stations.remove(&self.local);
        }
        if let Ok(mut h) = self.handler.write() {
            *h = None;
        }
    }
}
