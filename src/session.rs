//! Session state shared between the transfer task and the link callbacks.
//!
//! Everything here is lock free: the callback side only ever does atomic
//! loads, stores, compare-exchanges and increments.

use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};

use crate::link::PeerAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Handshaking = 1,
    Active = 2,
    Paused = 3,
    Completed = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Idle,
            1 => SessionState::Handshaking,
            2 => SessionState::Active,
            3 => SessionState::Paused,
            _ => SessionState::Completed,
        }
    }
}

#[derive(Debug, Default)]
pub struct TransferCounters {
    total_bytes: AtomicU64,
    total_packets: AtomicU64,
    failed_packets: AtomicU64,
    ignored_frames: AtomicU64,
}

impl TransferCounters {
    pub fn add_chunk(&self, bytes: usize) {
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.total_packets.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_failed(&self) {
        self.failed_packets.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_ignored(&self) {
        self.ignored_frames.fetch_add(1, Ordering::Relaxed);
    }
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
    pub fn total_packets(&self) -> u64 {
        self.total_packets.load(Ordering::Relaxed)
    }
    pub fn failed_packets(&self) -> u64 {
        self.failed_packets.load(Ordering::Relaxed)
    }
    pub fn ignored_frames(&self) -> u64 {
        self.ignored_frames.load(Ordering::Relaxed)
    }
}

const NO_INTERVAL: i64 = i64::MIN;

/// Accumulates time spent in `Active`. At most one interval is open.
#[derive(Debug)]
pub struct ActiveIntervalTracker {
    start: AtomicI64,
    accumulated: AtomicU64,
}

impl Default for ActiveIntervalTracker {
    fn default() -> Self {
        Self {
            start: AtomicI64::new(NO_INTERVAL),
            accumulated: AtomicU64::new(0),
        }
    }
}

impl ActiveIntervalTracker {
    /// Open an interval at `now`. Returns false if one is already open.
    pub fn open(&self, now: i64) -> bool {
        self.start
            .compare_exchange(NO_INTERVAL, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Close the open interval at `now`. Returns false if none was open.
    pub fn close(&self, now: i64) -> bool {
        let start = self.start.swap(NO_INTERVAL, Ordering::AcqRel);
        if start == NO_INTERVAL {
            return false;
        }
        let span = now.saturating_sub(start).max(0) as u64;
        self.accumulated.fetch_add(span, Ordering::AcqRel);
        true
    }

    pub fn is_open(&self) -> bool {
        self.start.load(Ordering::Acquire) != NO_INTERVAL
    }

    /// Start of the open interval, if any.
    pub fn open_since(&self) -> Option<i64> {
        match self.start.load(Ordering::Acquire) {
            NO_INTERVAL => None,
            t => Some(t),
        }
    }

    /// Drop the open interval without counting it.
    fn discard(&self) {
        self.start.store(NO_INTERVAL, Ordering::Release);
    }

    /// Closed intervals only.
    pub fn active_micros(&self) -> u64 {
        self.accumulated.load(Ordering::Acquire)
    }

    /// Closed intervals plus the running one, as of `now`.
    pub fn elapsed_micros(&self, now: i64) -> u64 {
        let acc = self.accumulated.load(Ordering::Acquire);
        match self.start.load(Ordering::Acquire) {
            NO_INTERVAL => acc,
            start => acc + now.saturating_sub(start).max(0) as u64,
        }
    }
}

#[derive(Debug)]
pub struct Session {
    peer: PeerAddress,
    channel: u8,
    state: AtomicU8,
    started_at: AtomicI64,
    pub counters: TransferCounters,
    pub tracker: ActiveIntervalTracker,
}

impl Session {
    pub fn new(peer: PeerAddress, channel: u8) -> Self {
        Self {
            peer,
            channel,
            state: AtomicU8::new(SessionState::Idle as u8),
            started_at: AtomicI64::new(NO_INTERVAL),
            counters: TransferCounters::default(),
            tracker: ActiveIntervalTracker::default(),
        }
    }

    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn is_completed(&self) -> bool {
        self.state() == SessionState::Completed
    }

    /// Session start timestamp, once the handshake has completed.
    pub fn started_at(&self) -> Option<i64> {
        match self.started_at.load(Ordering::Acquire) {
            NO_INTERVAL => None,
            t => Some(t),
        }
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Idle -> Handshaking.
    pub fn begin_handshake(&self) -> bool {
        self.transition(SessionState::Idle, SessionState::Handshaking)
    }

    /// Idle|Handshaking -> Active, opening the first interval.
    pub fn confirm(&self, now: i64) -> bool {
        let ok = self.transition(SessionState::Handshaking, SessionState::Active)
            || self.transition(SessionState::Idle, SessionState::Active);
        if ok {
            self.started_at.store(now, Ordering::Release);
            self.open_unless_completed(now);
        }
        ok
    }

    /// Active -> Idle, undoing a `confirm` whose ack never left. Nothing
    /// from the aborted start is counted.
    pub fn unconfirm(&self) -> bool {
        if !self.transition(SessionState::Active, SessionState::Idle) {
            return false;
        }
        self.tracker.discard();
        self.started_at.store(NO_INTERVAL, Ordering::Release);
        true
    }

    /// Active -> Paused, closing the open interval at `now`.
    pub fn pause(&self, now: i64) -> bool {
        if !self.transition(SessionState::Active, SessionState::Paused) {
            return false;
        }
        self.tracker.close(now);
        true
    }

    /// Paused -> Active, opening a new interval at `now`.
    pub fn resume(&self, now: i64) -> bool {
        if !self.transition(SessionState::Paused, SessionState::Active) {
            return false;
        }
        self.open_unless_completed(now);
        true
    }

    // A concurrent `complete` may land between the transition and the open.
    fn open_unless_completed(&self, now: i64) {
        self.tracker.open(now);
        if self.is_completed() {
            self.tracker.close(now);
        }
    }

    /// Any -> Completed. Closes the open interval. Returns false if already completed.
    pub fn complete(&self, now: i64) -> bool {
        let prev = self.state.swap(SessionState::Completed as u8, Ordering::AcqRel);
        if prev == SessionState::Completed as u8 {
            return false;
        }
        self.tracker.close(now);
        true
    }

    /// Count one data chunk if the session is active.
    pub fn accept_chunk(&self, len: usize) -> bool {
        if self.is_active() {
            self.counters.add_chunk(len);
            true
        } else {
            self.counters.inc_ignored();
            false
        }
    }
}
