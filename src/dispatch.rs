//! Link-boundary handlers: classify each inbound frame once, update the
//! session's atomics, and hand anything slow to the owning task over a
//! bounded channel. Nothing here blocks.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;

use tracing::trace;

use crate::clock::Clock;
use crate::frame::{ControlMessage, Inbound, classify};
use crate::handshake::{self, AckOutcome};
use crate::link::{Link, LinkHandler, PeerAddress, SendStatus};
use crate::session::Session;

const EVENT_QUEUE: usize = 64;

/// What the transmitter's link callbacks report to the transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEvent {
    SendDone(SendStatus),
    HandshakeAck,
}

pub struct TxDispatch {
    session: Arc<Session>,
    chunk_size: usize,
    events: SyncSender<TxEvent>,
}

impl TxDispatch {
    pub fn new(session: Arc<Session>, chunk_size: usize) -> (Arc<Self>, Receiver<TxEvent>) {
        let (events, rx) = mpsc::sync_channel(EVENT_QUEUE);
        (
            Arc::new(Self {
                session,
                chunk_size,
                events,
            }),
            rx,
        )
    }

    fn push(&self, ev: TxEvent) {
        if self.events.try_send(ev).is_err() {
            trace!(?ev, "[tx] event dropped");
        }
    }
}

impl LinkHandler for TxDispatch {
    fn on_send_complete(&self, _peer: &PeerAddress, status: SendStatus) {
        self.push(TxEvent::SendDone(status));
    }

    fn on_receive(&self, src: &PeerAddress, data: &[u8]) {
        let peer = self.session.peer();
        if !peer.is_broadcast() && *src != peer {
            self.session.counters.inc_ignored();
            return;
        }
        match classify(data, self.chunk_size) {
            Inbound::Control(ControlMessage::HandshakeAck) => self.push(TxEvent::HandshakeAck),
            _ => self.session.counters.inc_ignored(),
        }
    }
}

/// What the receiver's link callbacks report to the receive task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxEvent {
    SessionStarted,
    AckFailed,
    ReAcked,
    Paused,
    Resumed,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseDetection {
    /// Stop / Continue messages only
    Explicit,
    /// Also infer a pause from silence; any chunk resumes
    Silence,
}

const NEVER: i64 = i64::MIN;

pub struct RxDispatch {
    session: Arc<Session>,
    link: Arc<dyn Link>,
    clock: Arc<dyn Clock>,
    chunk_size: usize,
    detection: PauseDetection,
    last_chunk_at: AtomicI64,
    events: SyncSender<RxEvent>,
}

impl RxDispatch {
    pub fn new(
        session: Arc<Session>,
        link: Arc<dyn Link>,
        clock: Arc<dyn Clock>,
        chunk_size: usize,
        detection: PauseDetection,
    ) -> (Arc<Self>, Receiver<RxEvent>) {
        let (events, rx) = mpsc::sync_channel(EVENT_QUEUE);
        (
            Arc::new(Self {
                session,
                link,
                clock,
                chunk_size,
                detection,
                last_chunk_at: AtomicI64::new(NEVER),
                events,
            }),
            rx,
        )
    }

    /// Arrival time of the most recent counted chunk, or of the latest
    /// session start or resume if that came later.
    pub fn last_chunk_at(&self) -> Option<i64> {
        match self.last_chunk_at.load(Ordering::Acquire) {
            NEVER => None,
            t => Some(t),
        }
    }

    pub fn detection(&self) -> PauseDetection {
        self.detection
    }

    fn push(&self, ev: RxEvent) {
        if self.events.try_send(ev).is_err() {
            trace!(?ev, "[rx] event dropped");
        }
    }

    fn on_chunk(&self, len: usize) {
        let now = self.clock.now_micros();
        if self.detection == PauseDetection::Silence && self.session.resume(now) {
            self.push(RxEvent::Resumed);
        }
        if self.session.accept_chunk(len) {
            self.last_chunk_at.store(now, Ordering::Release);
        }
    }

    fn on_control(&self, msg: ControlMessage) {
        let now = self.clock.now_micros();
        match msg {
            ControlMessage::HandshakeRequest => {
                match handshake::on_handshake_request(&self.session, self.link.as_ref(), now) {
                    AckOutcome::Started => {
                        self.last_chunk_at.store(now, Ordering::Release);
                        self.push(RxEvent::SessionStarted);
                    }
                    AckOutcome::ReAcked => self.push(RxEvent::ReAcked),
                    AckOutcome::SendFailed => self.push(RxEvent::AckFailed),
                    AckOutcome::Ignored => {}
                }
            }
            ControlMessage::Stop => {
                if self.session.pause(now) {
                    self.push(RxEvent::Paused);
                }
            }
            ControlMessage::Continue => {
                if self.session.resume(now) {
                    // silence is measured from the resume, not the chunk before the pause
                    self.last_chunk_at.store(now, Ordering::Release);
                    self.push(RxEvent::Resumed);
                }
            }
            ControlMessage::Finish => {
                if self.session.started_at().is_some() && self.session.complete(now) {
                    self.push(RxEvent::Finished);
                }
            }
            ControlMessage::HandshakeAck => self.session.counters.inc_ignored(),
        }
    }
}

impl LinkHandler for RxDispatch {
    fn on_send_complete(&self, _peer: &PeerAddress, status: SendStatus) {
        trace!(?status, "[rx] send complete");
    }

    fn on_receive(&self, src: &PeerAddress, data: &[u8]) {
        let peer = self.session.peer();
        if !peer.is_broadcast() && *src != peer {
            self.session.counters.inc_ignored();
            return;
        }
        match classify(data, self.chunk_size) {
            Inbound::Data => self.on_chunk(data.len()),
            Inbound::Control(msg) => self.on_control(msg),
            Inbound::Unknown => {
                trace!(len = data.len(), "[rx] unclassified frame");
                self.session.counters.inc_ignored();
            }
        }
    }
}
