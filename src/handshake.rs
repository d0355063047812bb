//! Session establishment.
//!
//! The transmitter repeats a one-byte request until the receiver's one-byte
//! ack comes back. The receiver answers every request; only the first one
//! while idle starts its session.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::clock::{Clock, deadline_after};
use crate::dispatch::TxEvent;
use crate::error::{LinkError, SessionError};
use crate::frame::ControlMessage;
use crate::link::{Link, SendStatus};
use crate::session::{Session, SessionState};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// Upper bound for the backed-off interval; equal to `interval` for a fixed cadence.
    pub max_interval: Duration,
    pub max_attempts: u32,
    /// How long to wait for each request's send completion.
    pub completion_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(50),
            max_attempts: 200,
            completion_timeout: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn next_interval(&self, current: Duration) -> Duration {
        current
            .saturating_mul(2)
            .min(self.max_interval.max(self.interval))
    }
}

/// Transmitter side. Returns the number of requests it took.
///
/// On success the session is `Active` with its first interval open. On
/// `HandshakeTimeout` the session is left `Handshaking` for the caller to
/// complete.
pub fn establish_session(
    link: &dyn Link,
    session: &Session,
    events: &Receiver<TxEvent>,
    clock: &dyn Clock,
    policy: &RetryPolicy,
) -> Result<u32, SessionError> {
    session.begin_handshake();
    let peer = session.peer();
    let request = ControlMessage::HandshakeRequest.encode();
    let mut wait = policy.interval;

    for attempt in 1..=policy.max_attempts {
        link.send(&peer, &request)
            .map_err(SessionError::LinkSendFailure)?;
        debug!(attempt, %peer, "[handshake] request sent");

        let deadline = deadline_after(wait);
        let completion_deadline = deadline_after(policy.completion_timeout);
        let mut completed = false;
        let mut acked = false;

        // Each request's completion is consumed here so none leaks into the pump.
        while !completed || (!acked && Instant::now() < deadline) {
            let until = if completed { deadline } else { completion_deadline };
            let left = until.saturating_duration_since(Instant::now());
            match events.recv_timeout(left) {
                Ok(TxEvent::SendDone(status)) => {
                    if status == SendStatus::Failure {
                        debug!(attempt, "[handshake] request not confirmed by link");
                    }
                    completed = true;
                }
                Ok(TxEvent::HandshakeAck) => acked = true,
                Err(RecvTimeoutError::Timeout) if !completed => {
                    return Err(SessionError::SendStall(policy.completion_timeout));
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SessionError::LinkSendFailure(LinkError::Closed));
                }
            }
        }

        if acked {
            session.confirm(clock.now_micros());
            return Ok(attempt);
        }
        wait = policy.next_interval(wait);
    }

    warn!(
        attempts = policy.max_attempts,
        "[handshake] giving up, no ack from {}", peer
    );
    Err(SessionError::HandshakeTimeout {
        attempts: policy.max_attempts,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// First request: acked and the session is now active
    Started,
    /// Session already running: acked again, nothing else changed
    ReAcked,
    /// Idle, but the ack could not be submitted; still idle
    SendFailed,
    Ignored,
}

/// Receiver side. Runs in the link callback context.
///
/// The session goes active before the ack is sent, so chunks that follow the
/// ack on another thread are counted.
pub fn on_handshake_request(session: &Session, link: &dyn Link, now: i64) -> AckOutcome {
    let ack = ControlMessage::HandshakeAck.encode();
    match session.state() {
        SessionState::Idle => {
            if !session.confirm(now) {
                return AckOutcome::Ignored;
            }
            if let Err(e) = link.send(&session.peer(), &ack) {
                debug!("[handshake] ack not submitted: {}", e);
                session.unconfirm();
                return AckOutcome::SendFailed;
            }
            AckOutcome::Started
        }
        SessionState::Active | SessionState::Paused => {
            // The first ack may have been lost; the transmitter keeps asking.
            if let Err(e) = link.send(&session.peer(), &ack) {
                debug!("[handshake] re-ack not submitted: {}", e);
            }
            AckOutcome::ReAcked
        }
        SessionState::Handshaking | SessionState::Completed => AckOutcome::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dispatch::TxDispatch;
    use crate::link::sim::tests::Recorder;
    use crate::link::sim::{SimConfig, SimMedium};
    use crate::link::{LinkHandler, PeerAddress};
    use std::sync::{Arc, Mutex};

    const TX: PeerAddress = PeerAddress([0x0A; 6]);
    const RX: PeerAddress = PeerAddress([0x0B; 6]);

    /// Receiver stand-in that acks the n-th request and later ones.
    struct AckOnNth {
        link: Mutex<Option<Arc<dyn Link>>>,
        seen: Mutex<u32>,
        nth: u32,
    }

    impl LinkHandler for AckOnNth {
        fn on_send_complete(&self, _: &PeerAddress, _: SendStatus) {}
        fn on_receive(&self, src: &PeerAddress, data: &[u8]) {
            assert_eq!(data, &[ControlMessage::HandshakeRequest as u8]);
            let mut seen = self.seen.lock().unwrap();
            *seen += 1;
            if *seen >= self.nth
                && let Some(l) = self.link.lock().unwrap().as_ref()
            {
                l.send(src, &ControlMessage::HandshakeAck.encode()).unwrap();
            }
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(5),
            max_attempts,
            completion_timeout: Duration::from_millis(200),
        }
    }

    fn setup(nth: u32, loss: f64) -> (Arc<dyn Link>, Arc<Session>, Receiver<TxEvent>, Arc<AckOnNth>) {
        let medium = SimMedium::new(SimConfig {
            loss,
            ..Default::default()
        });
        let mut tx = medium.attach(TX);
        tx.register_peer(RX).unwrap();
        let mut rx = medium.attach(RX);
        rx.register_peer(TX).unwrap();
        let rx: Arc<dyn Link> = Arc::new(rx);
        let responder = Arc::new(AckOnNth {
            link: Mutex::new(Some(rx.clone())),
            seen: Mutex::new(0),
            nth,
        });
        rx.start(responder.clone()).unwrap();

        let session = Arc::new(Session::new(RX, 1));
        let (dispatch, events) = TxDispatch::new(session.clone(), 1024);
        let tx: Arc<dyn Link> = Arc::new(tx);
        tx.start(dispatch).unwrap();
        (tx, session, events, responder)
    }

    #[test]
    fn establishes_after_retries() {
        let (tx, session, events, responder) = setup(3, 0.0);
        let clock = ManualClock::at(7);
        let attempts =
            establish_session(tx.as_ref(), &session, &events, &clock, &policy(10)).unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(*responder.seen.lock().unwrap(), 3);
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.started_at(), Some(7));
        assert!(session.tracker.is_open());
        // no stray completions left for the pump
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn bounded_attempts_time_out() {
        let (tx, session, events, responder) = setup(u32::MAX, 0.0);
        let err = establish_session(
            tx.as_ref(),
            &session,
            &events,
            &ManualClock::default(),
            &policy(4),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::HandshakeTimeout { attempts: 4 }));
        assert_eq!(*responder.seen.lock().unwrap(), 4);
        assert_eq!(session.state(), SessionState::Handshaking);
    }

    #[test]
    fn lossy_link_times_out_instead_of_spinning() {
        let (tx, session, events, _) = setup(1, 1.0);
        let err = establish_session(
            tx.as_ref(),
            &session,
            &events,
            &ManualClock::default(),
            &policy(3),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::HandshakeTimeout { .. }));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let p = RetryPolicy {
            interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(300),
            ..Default::default()
        };
        let mut w = p.interval;
        let mut seen = vec![];
        for _ in 0..5 {
            w = p.next_interval(w);
            seen.push(w.as_millis());
        }
        assert_eq!(seen, vec![100, 200, 300, 300, 300]);
        assert_eq!(
            RetryPolicy::default().next_interval(Duration::from_millis(50)),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn submission_error_is_fatal() {
        let medium = SimMedium::new(SimConfig::default());
        let mut tx = medium.attach(TX).fail_after(0);
        tx.register_peer(RX).unwrap();
        let session = Arc::new(Session::new(RX, 1));
        let (dispatch, events) = TxDispatch::new(session.clone(), 1024);
        tx.start(dispatch).unwrap();
        let err = establish_session(&tx, &session, &events, &ManualClock::default(), &policy(3))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::LinkSendFailure(LinkError::Injected)
        ));
    }

    #[test]
    fn receiver_acks_once_then_reacks_without_state_change() {
        let medium = SimMedium::new(SimConfig::default());
        let mut rx = medium.attach(RX);
        rx.register_peer(TX).unwrap();
        rx.start(Arc::new(Recorder::default())).unwrap();
        let mut tx = medium.attach(TX);
        tx.register_peer(RX).unwrap();
        let seen = Arc::new(Recorder::default());
        tx.start(seen.clone()).unwrap();

        let session = Session::new(TX, 1);
        assert_eq!(on_handshake_request(&session, &rx, 10), AckOutcome::Started);
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.counters.total_bytes(), 0);
        assert_eq!(on_handshake_request(&session, &rx, 20), AckOutcome::ReAcked);
        assert_eq!(session.started_at(), Some(10));
        session.complete(30);
        assert_eq!(on_handshake_request(&session, &rx, 40), AckOutcome::Ignored);
        let frames = seen.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|(_, f)| f.as_slice() == [0x02]));
    }

    #[test]
    fn receiver_stays_idle_when_ack_cannot_be_sent() {
        let medium = SimMedium::new(SimConfig::default());
        let rx = medium.attach(RX);
        // TX never registered on the receiver's link
        rx.start(Arc::new(Recorder::default())).unwrap();
        let session = Session::new(TX, 1);
        assert_eq!(on_handshake_request(&session, &rx, 0), AckOutcome::SendFailed);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.started_at(), None);
        assert!(!session.tracker.is_open());
    }

    /// Transmitter-side handler that notes the receiver's state when the ack lands.
    struct StateAtAck {
        receiver: Arc<Session>,
        seen: Mutex<Option<SessionState>>,
    }

    impl LinkHandler for StateAtAck {
        fn on_send_complete(&self, _: &PeerAddress, _: SendStatus) {}
        fn on_receive(&self, _: &PeerAddress, data: &[u8]) {
            assert_eq!(data, &[ControlMessage::HandshakeAck as u8]);
            *self.seen.lock().unwrap() = Some(self.receiver.state());
        }
    }

    #[test]
    fn receiver_is_active_before_its_ack_arrives() {
        let medium = SimMedium::new(SimConfig::default());
        let mut rx = medium.attach(RX);
        rx.register_peer(TX).unwrap();
        rx.start(Arc::new(Recorder::default())).unwrap();
        let mut tx = medium.attach(TX);
        tx.register_peer(RX).unwrap();

        let session = Arc::new(Session::new(TX, 1));
        let watcher = Arc::new(StateAtAck {
            receiver: session.clone(),
            seen: Mutex::new(None),
        });
        tx.start(watcher.clone()).unwrap();

        assert_eq!(on_handshake_request(&session, &rx, 5), AckOutcome::Started);
        assert_eq!(*watcher.seen.lock().unwrap(), Some(SessionState::Active));
    }

    #[test]
    fn failed_reack_leaves_session_running() {
        let medium = SimMedium::new(SimConfig::default());
        let rx = medium.attach(RX);
        // TX not registered, so every ack is rejected
        rx.start(Arc::new(Recorder::default())).unwrap();
        let session = Session::new(TX, 1);
        session.confirm(10);
        assert_eq!(on_handshake_request(&session, &rx, 20), AckOutcome::ReAcked);
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.started_at(), Some(10));
    }
}
