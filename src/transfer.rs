//! Transfer controller: the transmitter's paced pump and the receiver's
//! accounting loop. Both run on the role's main thread; the link callbacks
//! only feed them events.

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cli::Pacing;
use crate::clock::{Clock, deadline_after};
use crate::dispatch::{PauseDetection, RxDispatch, RxEvent, TxEvent};
use crate::error::{LinkError, SessionError};
use crate::frame::{ControlMessage, build_chunk};
use crate::input::InputEvent;
use crate::link::{Link, SendStatus};
use crate::session::{Session, SessionState};
use crate::stats::{Report, Reporter};

const PAUSED_WAIT: Duration = Duration::from_secs(1);
const RX_POLL: Duration = Duration::from_millis(100);
const RX_GRACE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub chunk_size: usize,
    /// Stop after this much active time
    pub duration: Option<Duration>,
    /// Stop after this many chunks accepted by the link
    pub max_chunks: Option<u64>,
    pub stall_timeout: Duration,
    pub pacing: Pacing,
    /// Tell the receiver about pause/resume with Stop/Continue
    pub signal_pause: bool,
}

#[derive(Debug)]
pub struct TransferOutcome {
    pub report: Report,
    /// Chunks the link accepted, whatever their completion said
    pub sent: u64,
    pub error: Option<SessionError>,
}

/// Drives an established session from the transmitting side.
pub struct Transmitter<'a> {
    link: &'a dyn Link,
    session: &'a Session,
    events: &'a Receiver<TxEvent>,
    cfg: TransferConfig,
    sent: u64,
}

impl<'a> Transmitter<'a> {
    pub fn new(
        link: &'a dyn Link,
        session: &'a Session,
        events: &'a Receiver<TxEvent>,
        cfg: TransferConfig,
    ) -> Self {
        Self {
            link,
            session,
            events,
            cfg,
            sent: 0,
        }
    }

    /// Submit one frame; `Ok` means the link accepted it.
    fn submit(&self, data: &[u8]) -> Result<(), SessionError> {
        self.link
            .send(&self.session.peer(), data)
            .map_err(SessionError::LinkSendFailure)
    }

    /// Block until the completion of the frame in flight arrives.
    fn wait_done(&self) -> Result<SendStatus, SessionError> {
        let deadline = deadline_after(self.cfg.stall_timeout);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(left) {
                Ok(TxEvent::SendDone(status)) => return Ok(status),
                // late re-ack from the receiver
                Ok(TxEvent::HandshakeAck) => continue,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SessionError::SendStall(self.cfg.stall_timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SessionError::LinkSendFailure(LinkError::Closed));
                }
            }
        }
    }

    fn send_and_wait(&self, data: &[u8]) -> Result<SendStatus, SessionError> {
        self.submit(data)?;
        self.wait_done()
    }

    fn signal(&self, msg: ControlMessage) -> Result<(), SessionError> {
        if !self.cfg.signal_pause {
            return Ok(());
        }
        if self.send_and_wait(&msg.encode())? == SendStatus::Failure {
            warn!(?msg, "[tx] control message not confirmed by link");
        }
        Ok(())
    }

    /// Active -> Paused, then tell the receiver.
    pub fn pause(&self, now: i64) -> Result<bool, SessionError> {
        if !self.session.pause(now) {
            return Ok(false);
        }
        info!("[tx] paused");
        self.signal(ControlMessage::Stop)?;
        Ok(true)
    }

    /// Tell the receiver, then Paused -> Active.
    pub fn resume(&self, now: i64) -> Result<bool, SessionError> {
        if self.session.state() != SessionState::Paused {
            return Ok(false);
        }
        self.signal(ControlMessage::Continue)?;
        let resumed = self.session.resume(now);
        if resumed {
            info!("[tx] resumed");
        }
        Ok(resumed)
    }

    fn toggle(&self, reporter: &mut Reporter, clock: &dyn Clock) -> Result<(), SessionError> {
        let now = clock.now_micros();
        match self.session.state() {
            SessionState::Active => {
                if self.pause(now)? {
                    reporter.on_pause(self.session, now);
                }
            }
            SessionState::Paused => {
                self.resume(now)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn budget_spent(&self, now: i64) -> bool {
        if let Some(d) = self.cfg.duration
            && self.session.tracker.elapsed_micros(now) >= micros(d) as u64
        {
            debug!("[tx] active duration reached");
            return true;
        }
        if let Some(max) = self.cfg.max_chunks
            && self.sent >= max
        {
            debug!(max, "[tx] chunk budget reached");
            return true;
        }
        false
    }

    /// Drain pending presses; block for the next one while paused.
    fn poll_input(
        &self,
        input: &Receiver<InputEvent>,
        input_open: &mut bool,
        reporter: &mut Reporter,
        clock: &dyn Clock,
    ) -> Result<(), SessionError> {
        while *input_open {
            match input.try_recv() {
                Ok(InputEvent::Press) => self.toggle(reporter, clock)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => *input_open = false,
            }
        }

        if self.session.state() != SessionState::Paused {
            return Ok(());
        }
        if !*input_open {
            warn!("[tx] input closed while paused, resuming");
            self.resume(clock.now_micros())?;
            return Ok(());
        }
        let wait = reporter
            .until_due(clock.now_micros())
            .unwrap_or(PAUSED_WAIT)
            .min(PAUSED_WAIT);
        match input.recv_timeout(wait) {
            Ok(InputEvent::Press) => self.toggle(reporter, clock)?,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => *input_open = false,
        }
        reporter.maybe_report(self.session, clock.now_micros());
        Ok(())
    }

    fn pump(
        &mut self,
        input: &Receiver<InputEvent>,
        clock: &dyn Clock,
        reporter: &mut Reporter,
    ) -> Result<(), SessionError> {
        let chunk = build_chunk(self.cfg.chunk_size)
            .map_err(|e| SessionError::Allocation(e.to_string()))?;
        let mut input_open = true;
        reporter.arm(clock.now_micros());

        while !self.session.is_completed() {
            self.poll_input(input, &mut input_open, reporter, clock)?;
            if self.session.state() == SessionState::Paused {
                continue;
            }
            if self.budget_spent(clock.now_micros()) {
                break;
            }

            self.submit(&chunk)?;
            self.sent += 1;
            match self.wait_done()? {
                SendStatus::Success => self.session.counters.add_chunk(chunk.len()),
                SendStatus::Failure => self.session.counters.inc_failed(),
            }

            reporter.maybe_report(self.session, clock.now_micros());
            if let Some(gap) = self.cfg.pacing.sleep_for() {
                thread::sleep(gap);
            }
        }
        Ok(())
    }

    /// Pump chunks until a stop condition, then complete the session, send
    /// `Finish` and produce the final report.
    pub fn run(
        mut self,
        input: &Receiver<InputEvent>,
        clock: &dyn Clock,
        reporter: &mut Reporter,
    ) -> TransferOutcome {
        let error = self.pump(input, clock, reporter).err();

        let now = clock.now_micros();
        self.session.complete(now);
        if let Some(e) = &error {
            warn!("[tx] stopping: {}", e);
        }
        if let Err(e) = self.send_and_wait(&ControlMessage::Finish.encode()) {
            debug!("[tx] finish not delivered: {}", e);
        }
        TransferOutcome {
            report: reporter.finish(self.session, now),
            sent: self.sent,
            error,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveConfig {
    /// Stop after this much active time (plus a short grace period)
    pub duration: Option<Duration>,
    /// Give up if no session starts within this time
    pub idle_timeout: Option<Duration>,
    /// With silence detection: quiet time that counts as a pause
    pub silence: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveEnd {
    Finished,
    DurationElapsed,
    IdleTimeout,
    LinkClosed,
}

#[derive(Debug)]
pub struct ReceiveOutcome {
    pub report: Report,
    pub end: ReceiveEnd,
}

fn micros(d: Duration) -> i64 {
    d.as_micros().min(i64::MAX as u128) as i64
}

/// Receiver task: reacts to the dispatcher's events, applies the time-based
/// stop conditions and silence detection, and reports.
pub fn run_receiver(
    session: &Session,
    dispatch: &RxDispatch,
    events: &Receiver<RxEvent>,
    clock: &dyn Clock,
    cfg: &ReceiveConfig,
    reporter: &mut Reporter,
) -> ReceiveOutcome {
    let waiting_since = clock.now_micros();

    let end = loop {
        let now = clock.now_micros();
        if session.is_completed() {
            break ReceiveEnd::Finished;
        }

        if session.started_at().is_none() {
            if let Some(idle) = cfg.idle_timeout
                && now - waiting_since >= micros(idle)
            {
                session.complete(now);
                break ReceiveEnd::IdleTimeout;
            }
        } else {
            if let Some(d) = cfg.duration
                && session.tracker.elapsed_micros(now) >= micros(d.saturating_add(RX_GRACE)) as u64
            {
                session.complete(now);
                break ReceiveEnd::DurationElapsed;
            }
            // the quiet span never reaches back past the open interval
            if dispatch.detection() == PauseDetection::Silence
                && let (Some(quiet), Some(last)) = (cfg.silence, dispatch.last_chunk_at())
                && session.is_active()
                && let Some(since) = session.tracker.open_since().map(|open| open.max(last))
                && now - since >= micros(quiet)
                && session.pause(since)
            {
                info!(quiet_ms = quiet.as_millis() as u64, "[rx] link quiet, paused");
                reporter.on_pause(session, now);
            }
            reporter.maybe_report(session, now);
        }

        let wait = reporter.until_due(now).unwrap_or(RX_POLL).min(RX_POLL);
        match events.recv_timeout(wait) {
            Ok(RxEvent::SessionStarted) => {
                info!(peer = %session.peer(), "[rx] session started");
                reporter.arm(clock.now_micros());
            }
            Ok(RxEvent::AckFailed) => warn!("[rx] handshake ack could not be sent"),
            Ok(RxEvent::ReAcked) => debug!("[rx] duplicate handshake request, re-acked"),
            Ok(RxEvent::Paused) => {
                info!("[rx] paused by peer");
                reporter.on_pause(session, clock.now_micros());
            }
            Ok(RxEvent::Resumed) => info!("[rx] resumed"),
            Ok(RxEvent::Finished) => info!("[rx] peer finished"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                session.complete(clock.now_micros());
                break ReceiveEnd::LinkClosed;
            }
        }
    };

    ReceiveOutcome {
        report: reporter.finish(session, clock.now_micros()),
        end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, MonotonicClock};
    use crate::dispatch::TxDispatch;
    use crate::input;
    use crate::link::sim::tests::Recorder;
    use crate::link::sim::{SimConfig, SimLink, SimMedium};
    use crate::link::{LinkConfig, LinkHandler, PeerAddress};
    use crate::stats::ReportMode;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, RwLock};

    const TX: PeerAddress = PeerAddress([0x0A; 6]);
    const RX: PeerAddress = PeerAddress([0x0B; 6]);

    fn cfg(chunk_size: usize) -> TransferConfig {
        TransferConfig {
            chunk_size,
            duration: None,
            max_chunks: None,
            stall_timeout: Duration::from_millis(500),
            pacing: Pacing::Max,
            signal_pause: true,
        }
    }

    /// Transmitter link on a fresh medium plus a recorder on the far side.
    fn tx_pair(fail_after: Option<u64>) -> (SimLink, Arc<Session>, Receiver<TxEvent>, Arc<Recorder>) {
        let medium = SimMedium::new(SimConfig::default());
        let mut rx = medium.attach(RX);
        rx.register_peer(TX).unwrap();
        let seen = Arc::new(Recorder::default());
        rx.start(seen.clone()).unwrap();

        let mut tx = medium.attach(TX);
        if let Some(n) = fail_after {
            tx = tx.fail_after(n);
        }
        tx.register_peer(RX).unwrap();
        let session = Arc::new(Session::new(RX, 1));
        let (dispatch, events) = TxDispatch::new(session.clone(), 1024);
        tx.start(dispatch).unwrap();
        (tx, session, events, seen)
    }

    fn frames(r: &Recorder) -> Vec<Vec<u8>> {
        r.frames.lock().unwrap().iter().map(|(_, f)| f.clone()).collect()
    }

    #[test]
    fn pause_and_resume_accumulate_active_time() {
        let (link, session, events, seen) = tx_pair(None);
        let t = Transmitter::new(&link, &session, &events, cfg(1024));

        // 1 s already accumulated, current interval opened at 0
        session.confirm(-2_000_000);
        session.pause(-1_000_000);
        session.resume(0);
        assert_eq!(session.tracker.active_micros(), 1_000_000);

        assert!(t.pause(1_000_000).unwrap());
        assert_eq!(session.state(), SessionState::Paused);
        assert_eq!(session.tracker.active_micros(), 2_000_000);

        assert!(t.resume(1_500_000).unwrap());
        session.complete(2_500_000);
        assert_eq!(session.tracker.active_micros(), 3_000_000);
        assert_eq!(frames(&seen), vec![vec![0x03], vec![0x04]]);
    }

    #[test]
    fn send_failure_completes_with_frozen_counters() {
        let (link, session, events, seen) = tx_pair(Some(5));
        session.confirm(0);
        let clock = ManualClock::at(0);
        let (_press, input) = input::channel();
        let mut rep = Reporter::new("tx", ReportMode::Boundaries);
        let out = Transmitter::new(&link, &session, &events, cfg(256)).run(
            &input,
            &clock,
            &mut rep,
        );

        assert!(matches!(
            out.error,
            Some(SessionError::LinkSendFailure(LinkError::Injected))
        ));
        assert_eq!(session.state(), SessionState::Completed);
        // the rejected sixth chunk is not counted as sent
        assert_eq!(out.sent, 5);
        assert_eq!(out.report.total_packets, 5);
        assert_eq!(out.report.total_bytes, 5 * 256);
        assert_eq!(session.counters.total_packets(), 5);
        // the Finish attempt was rejected too
        assert_eq!(frames(&seen).len(), 5);
    }

    #[test]
    fn chunk_budget_then_finish() {
        let (link, session, events, seen) = tx_pair(None);
        session.confirm(0);
        let (_press, input) = input::channel();
        let mut rep = Reporter::new("tx", ReportMode::Boundaries);
        let c = TransferConfig {
            max_chunks: Some(7),
            ..cfg(128)
        };
        let out = Transmitter::new(&link, &session, &events, c).run(
            &input,
            &MonotonicClock::new(),
            &mut rep,
        );
        assert!(out.error.is_none());
        assert_eq!(out.sent, 7);
        assert_eq!(out.report.total_bytes, 7 * 128);
        let f = frames(&seen);
        assert_eq!(f.len(), 8);
        assert_eq!(f.last().unwrap(), &vec![0x05]);
        assert!(f[..7].iter().all(|c| c.len() == 128));
    }

    #[test]
    fn presses_pause_and_resume_the_pump() {
        let (link, session, events, seen) = tx_pair(None);
        session.confirm(0);
        let (press, input) = input::channel();
        press.send(InputEvent::Press).unwrap();
        press.send(InputEvent::Press).unwrap();
        let mut rep = Reporter::new("tx", ReportMode::Boundaries);
        let c = TransferConfig {
            max_chunks: Some(3),
            ..cfg(64)
        };
        let out = Transmitter::new(&link, &session, &events, c).run(
            &input,
            &MonotonicClock::new(),
            &mut rep,
        );
        assert!(out.error.is_none());
        // one report at the pause, one final
        assert_eq!(rep.emitted(), 2);
        let f = frames(&seen);
        assert_eq!(f[0], vec![0x03]);
        assert_eq!(f[1], vec![0x04]);
        assert_eq!(f.len(), 2 + 3 + 1);
        drop(press);
    }

    #[test]
    fn unsignalled_pause_sends_nothing() {
        let (link, session, events, seen) = tx_pair(None);
        session.confirm(0);
        let c = TransferConfig {
            signal_pause: false,
            ..cfg(64)
        };
        let t = Transmitter::new(&link, &session, &events, c);
        assert!(t.pause(10).unwrap());
        assert!(t.resume(20).unwrap());
        assert!(frames(&seen).is_empty());
    }

    #[test]
    fn duration_counts_active_time_only() {
        let (link, session, events, _seen) = tx_pair(None);
        let clock = MonotonicClock::new();
        session.confirm(clock.now_micros());
        let (_press, input) = input::channel();
        let mut rep = Reporter::new("tx", ReportMode::Boundaries);
        let c = TransferConfig {
            duration: Some(Duration::from_millis(30)),
            pacing: Pacing::Fixed(Duration::from_millis(1)),
            ..cfg(512)
        };
        let out = Transmitter::new(&link, &session, &events, c).run(&input, &clock, &mut rep);
        assert!(out.error.is_none());
        assert!(out.report.duration_seconds >= 0.030);
        assert!(out.report.total_packets > 0);
    }

    /// Completes every send from another thread and records how many
    /// submissions were ever outstanding at once.
    #[derive(Default)]
    struct DeferredLink {
        handler: RwLock<Option<Arc<dyn LinkHandler>>>,
        in_flight: Arc<AtomicU64>,
        max_in_flight: AtomicU64,
    }

    impl Link for DeferredLink {
        fn configure(&mut self, _: &LinkConfig) -> Result<(), LinkError> {
            Ok(())
        }
        fn register_peer(&mut self, _: PeerAddress) -> Result<(), LinkError> {
            Ok(())
        }
        fn start(&self, handler: Arc<dyn LinkHandler>) -> Result<(), LinkError> {
            *self.handler.write().unwrap() = Some(handler);
            Ok(())
        }
        fn send(&self, peer: &PeerAddress, _: &[u8]) -> Result<(), LinkError> {
            let h = self.handler.read().unwrap().clone().ok_or(LinkError::NotStarted)?;
            let n = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(n, Ordering::SeqCst);
            let in_flight = self.in_flight.clone();
            let peer = *peer;
            thread::spawn(move || {
                thread::sleep(Duration::from_micros(200));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                h.on_send_complete(&peer, SendStatus::Success);
            });
            Ok(())
        }
        fn mtu(&self) -> usize {
            1470
        }
        fn stop(&self) {}
    }

    #[test]
    fn at_most_one_chunk_in_flight() {
        let link = DeferredLink::default();
        let session = Arc::new(Session::new(RX, 1));
        let (dispatch, events) = TxDispatch::new(session.clone(), 1024);
        link.start(dispatch).unwrap();
        session.confirm(0);
        let (_press, input) = input::channel();
        let mut rep = Reporter::new("tx", ReportMode::Boundaries);
        let c = TransferConfig {
            max_chunks: Some(50),
            ..cfg(1024)
        };
        let out = Transmitter::new(&link, &session, &events, c).run(
            &input,
            &MonotonicClock::new(),
            &mut rep,
        );
        assert!(out.error.is_none());
        assert_eq!(out.report.total_packets, 50);
        assert_eq!(link.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_completion_is_a_stall() {
        struct Mute;
        impl Link for Mute {
            fn configure(&mut self, _: &LinkConfig) -> Result<(), LinkError> {
                Ok(())
            }
            fn register_peer(&mut self, _: PeerAddress) -> Result<(), LinkError> {
                Ok(())
            }
            fn start(&self, _: Arc<dyn LinkHandler>) -> Result<(), LinkError> {
                Ok(())
            }
            fn send(&self, _: &PeerAddress, _: &[u8]) -> Result<(), LinkError> {
                Ok(())
            }
            fn mtu(&self) -> usize {
                1470
            }
            fn stop(&self) {}
        }
        let session = Arc::new(Session::new(RX, 1));
        let (_dispatch, events) = TxDispatch::new(session.clone(), 1024);
        session.confirm(0);
        let (_press, input) = input::channel();
        let mut rep = Reporter::new("tx", ReportMode::Boundaries);
        let c = TransferConfig {
            stall_timeout: Duration::from_millis(20),
            ..cfg(64)
        };
        let out = Transmitter::new(&Mute, &session, &events, c).run(
            &input,
            &ManualClock::default(),
            &mut rep,
        );
        assert!(matches!(out.error, Some(SessionError::SendStall(_))));
        assert_eq!(session.state(), SessionState::Completed);
    }

    struct RxBench {
        clock: Arc<ManualClock>,
        session: Arc<Session>,
        dispatch: Arc<RxDispatch>,
        events: Receiver<RxEvent>,
    }

    fn rx_bench(detection: PauseDetection) -> RxBench {
        let medium = SimMedium::new(SimConfig::default());
        let mut link = medium.attach(RX);
        link.register_peer(TX).unwrap();
        let link: Arc<dyn Link> = Arc::new(link);
        let clock = Arc::new(ManualClock::at(0));
        let session = Arc::new(Session::new(TX, 1));
        let (dispatch, events) =
            RxDispatch::new(session.clone(), link.clone(), clock.clone(), 128, detection);
        link.start(dispatch.clone()).unwrap();
        RxBench {
            clock,
            session,
            dispatch,
            events,
        }
    }

    #[test]
    fn receiver_gives_up_when_nobody_calls() {
        let b = rx_bench(PauseDetection::Explicit);
        b.clock.set(10_000_000);
        let c = ReceiveConfig {
            idle_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        // idle clock starts at entry; jump it forward from another thread
        let clock = b.clock.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            clock.advance(2_000_000);
        });
        let mut rep = Reporter::new("rx", ReportMode::Boundaries);
        let out = run_receiver(&b.session, &b.dispatch, &b.events, b.clock.as_ref(), &c, &mut rep);
        h.join().unwrap();
        assert_eq!(out.end, ReceiveEnd::IdleTimeout);
        assert_eq!(out.report.total_bytes, 0);
        assert_eq!(out.report.throughput_kbps, 0.0);
    }

    #[test]
    fn receiver_stops_after_duration_plus_grace() {
        let b = rx_bench(PauseDetection::Explicit);
        b.dispatch.on_receive(&TX, &ControlMessage::HandshakeRequest.encode());
        for _ in 0..4 {
            b.dispatch.on_receive(&TX, &build_chunk(128).unwrap());
        }
        b.clock.set(1_050_000);
        let c = ReceiveConfig {
            duration: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let mut rep = Reporter::new("rx", ReportMode::Boundaries);
        let out = run_receiver(&b.session, &b.dispatch, &b.events, b.clock.as_ref(), &c, &mut rep);
        assert_eq!(out.end, ReceiveEnd::DurationElapsed);
        assert_eq!(out.report.total_packets, 4);
        assert_eq!(b.session.tracker.active_micros(), 1_050_000);
        assert_eq!(b.session.state(), SessionState::Completed);
    }

    #[test]
    fn receiver_infers_pause_from_silence() {
        let b = rx_bench(PauseDetection::Silence);
        b.dispatch.on_receive(&TX, &ControlMessage::HandshakeRequest.encode());
        b.clock.set(100);
        b.dispatch.on_receive(&TX, &build_chunk(128).unwrap());
        b.clock.set(600_000);

        let dispatch = b.dispatch.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            dispatch.on_receive(&TX, &ControlMessage::Finish.encode());
        });
        let c = ReceiveConfig {
            silence: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        let mut rep = Reporter::new("rx", ReportMode::Boundaries);
        let out = run_receiver(&b.session, &b.dispatch, &b.events, b.clock.as_ref(), &c, &mut rep);
        h.join().unwrap();
        assert_eq!(out.end, ReceiveEnd::Finished);
        // closed at the last chunk, not when the silence was noticed
        assert_eq!(b.session.tracker.active_micros(), 100);
        assert_eq!(out.report.total_packets, 1);
        // the pause boundary and the final report
        assert_eq!(rep.emitted(), 2);
    }

    #[test]
    fn silence_is_measured_from_an_explicit_resume() {
        let b = rx_bench(PauseDetection::Silence);
        b.dispatch.on_receive(&TX, &ControlMessage::HandshakeRequest.encode());
        b.clock.set(100);
        b.dispatch.on_receive(&TX, &build_chunk(128).unwrap());
        b.clock.set(200);
        b.dispatch.on_receive(&TX, &ControlMessage::Stop.encode());
        b.clock.set(1_000_000);
        b.dispatch.on_receive(&TX, &ControlMessage::Continue.encode());

        let (clock, dispatch) = (b.clock.clone(), b.dispatch.clone());
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            clock.set(1_001_000);
            dispatch.on_receive(&TX, &build_chunk(128).unwrap());
            clock.set(1_002_000);
            dispatch.on_receive(&TX, &ControlMessage::Finish.encode());
        });
        let c = ReceiveConfig {
            silence: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        let mut rep = Reporter::new("rx", ReportMode::Boundaries);
        let out = run_receiver(&b.session, &b.dispatch, &b.events, b.clock.as_ref(), &c, &mut rep);
        h.join().unwrap();
        assert_eq!(out.end, ReceiveEnd::Finished);
        assert_eq!(b.session.tracker.active_micros(), 2_200);
        assert_eq!(out.report.total_packets, 2);
        // the explicit pause and the final report, no silence pause
        assert_eq!(rep.emitted(), 2);
    }
}
