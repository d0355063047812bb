//! Both roles in one process over the simulated medium. The receiver runs on
//! its own thread; the transmitter on the caller's.

use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::cli::{LoopbackOpts, SessionConfig, seconds};
use crate::clock::{Clock, MonotonicClock};
use crate::dispatch::TxDispatch;
use crate::error::SessionError;
use crate::input;
use crate::link::sim::{SimConfig, SimMedium};
use crate::link::{Link, PeerAddress};
use crate::rx;
use crate::session::Session;
use crate::stats::Report;
use crate::transfer::{ReceiveEnd, TransferOutcome};
use crate::tx;

pub const TX_ADDR: PeerAddress = PeerAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
pub const RX_ADDR: PeerAddress = PeerAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);

pub struct LoopbackOutcome {
    pub tx: Result<TransferOutcome, SessionError>,
    pub rx: Report,
    pub rx_end: ReceiveEnd,
}

/// Run one session across `medium`. `toggle` presses pause on the
/// transmitter at that period; `fail_after` injects a submission failure.
pub fn run_pair(
    medium: &Arc<SimMedium>,
    tx_cfg: &SessionConfig,
    toggle: Option<Duration>,
    fail_after: Option<u64>,
) -> Result<LoopbackOutcome> {
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());

    // Receiver mirrors the transmitter's addresses. Its own duration and
    // idle limits only back up a lost Finish or a failed handshake.
    let mut rx_cfg = tx_cfg.clone();
    rx_cfg.local = tx_cfg.peer;
    rx_cfg.peer = tx_cfg.local;
    rx_cfg.receive.duration = tx_cfg.transfer.duration;
    rx_cfg.receive.idle_timeout = Some(
        tx_cfg
            .retry
            .max_interval
            .saturating_mul(tx_cfg.retry.max_attempts)
            .saturating_add(Duration::from_secs(1)),
    );

    let mut rx_link = medium.attach(rx_cfg.local);
    rx_link.configure(&rx_cfg.link)?;
    rx_link.register_peer(rx_cfg.peer)?;
    let rx_link: Arc<dyn Link> = Arc::new(rx_link);
    let receiving = rx::attach(&rx_link, Arc::clone(&clock), &rx_cfg).context("start receiver")?;

    let mut tx_link = medium.attach(tx_cfg.local);
    if let Some(n) = fail_after {
        tx_link = tx_link.fail_after(n);
    }
    tx_link.configure(&tx_cfg.link)?;
    tx_link.register_peer(tx_cfg.peer)?;
    let session = Arc::new(Session::new(tx_cfg.peer, tx_cfg.link.channel));
    let (dispatch, events) = TxDispatch::new(Arc::clone(&session), tx_cfg.transfer.chunk_size);
    tx_link.start(dispatch).context("start transmitter")?;

    let rx_clock = Arc::clone(&clock);
    let receiver = thread::spawn(move || rx::receive(&receiving, rx_clock.as_ref(), &rx_cfg));

    let (press, input) = input::channel();
    if let Some(every) = toggle {
        input::spawn_toggle(press.clone(), every);
    }
    drop(press);

    let tx = tx::transmit(&tx_link, &session, &events, &input, clock.as_ref(), tx_cfg);
    tx_link.stop();
    debug!(submitted = tx_link.submitted(), "[loopback] transmitter done");

    let rx_out = receiver
        .join()
        .map_err(|_| anyhow!("receiver thread panicked"))?;
    rx_link.stop();

    Ok(LoopbackOutcome {
        tx,
        rx: rx_out.report,
        rx_end: rx_out.end,
    })
}

pub fn run(opts: LoopbackOpts) -> Result<()> {
    let medium = SimMedium::new(SimConfig {
        loss: opts.loss,
        seed: opts.seed,
        ..Default::default()
    });
    let cfg = SessionConfig::for_loopback(&opts, TX_ADDR, RX_ADDR, crate::link::sim::SIM_MTU)?;
    let toggle = seconds("toggle-every", opts.toggle_every)?;
    info!(loss = opts.loss, seed = opts.seed, "[loopback] starting");

    let out = run_pair(&medium, &cfg, toggle, opts.fail_after)?;
    let tx = out.tx.context("session not established")?;

    let ratio = out.rx.delivery_ratio(tx.sent).unwrap_or(0.0);
    info!(
        sent = tx.sent,
        confirmed = tx.report.total_packets,
        received = out.rx.total_packets,
        delivery_ratio = format_args!("{:.4}", ratio),
        rx_end = ?out.rx_end,
        "[loopback] {} of {} chunks arrived ({:.2}%)",
        out.rx.total_packets,
        tx.sent,
        ratio * 100.0
    );
    if let Some(e) = tx.error {
        error!("[loopback] transmitter failed: {}", e);
        return Err(e).context("transfer");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Pacing;
    use crate::handshake::RetryPolicy;
    use crate::link::LinkConfig;
    use crate::stats::ReportMode;
    use crate::transfer::{ReceiveConfig, TransferConfig};

    fn cfg(max_chunks: Option<u64>, duration: Option<Duration>) -> SessionConfig {
        SessionConfig {
            local: TX_ADDR,
            peer: RX_ADDR,
            link: LinkConfig::default(),
            report: ReportMode::Boundaries,
            retry: RetryPolicy {
                interval: Duration::from_millis(5),
                max_interval: Duration::from_millis(5),
                max_attempts: 400,
                completion_timeout: Duration::from_millis(500),
            },
            transfer: TransferConfig {
                chunk_size: 1024,
                duration,
                max_chunks,
                stall_timeout: Duration::from_millis(500),
                pacing: Pacing::Max,
                signal_pause: true,
            },
            receive: ReceiveConfig::default(),
        }
    }

    #[test]
    fn clean_link_delivers_everything() {
        let medium = SimMedium::new(SimConfig::default());
        let out = run_pair(&medium, &cfg(Some(200), None), None, None).unwrap();
        let tx = out.tx.unwrap();
        assert!(tx.error.is_none());
        assert_eq!(out.rx_end, ReceiveEnd::Finished);
        assert_eq!(tx.sent, 200);
        assert_eq!(out.rx.total_packets, 200);
        assert_eq!(out.rx.total_bytes, 200 * 1024);
        assert_eq!(out.rx.delivery_ratio(tx.sent), Some(1.0));
    }

    #[test]
    fn lossy_link_counts_what_arrived() {
        let medium = SimMedium::new(SimConfig {
            loss: 0.2,
            seed: 7,
            ..Default::default()
        });
        let out = run_pair(
            &medium,
            &cfg(None, Some(Duration::from_millis(200))),
            None,
            None,
        )
        .unwrap();
        let tx = out.tx.unwrap();
        assert!(tx.error.is_none());
        // a unicast completion is Success exactly when the frame arrived
        assert_eq!(tx.report.total_packets, out.rx.total_packets);
        assert_eq!(tx.report.failed_packets + tx.report.total_packets, tx.sent);
        assert!(tx.report.failed_packets > 0);
        assert!(out.rx.total_packets < tx.sent);
        assert!(matches!(
            out.rx_end,
            ReceiveEnd::Finished | ReceiveEnd::DurationElapsed
        ));
    }

    #[test]
    fn dead_link_fails_the_handshake() {
        let medium = SimMedium::new(SimConfig {
            loss: 1.0,
            ..Default::default()
        });
        let mut c = cfg(Some(10), None);
        c.retry.max_attempts = 5;
        let out = run_pair(&medium, &c, None, None).unwrap();
        assert!(matches!(
            out.tx,
            Err(SessionError::HandshakeTimeout { attempts: 5 })
        ));
        assert_eq!(out.rx_end, ReceiveEnd::IdleTimeout);
        assert_eq!(out.rx.total_bytes, 0);
    }

    #[test]
    fn pauses_reach_the_receiver() {
        let medium = SimMedium::new(SimConfig::default());
        let c = SessionConfig {
            transfer: TransferConfig {
                pacing: Pacing::Fixed(Duration::from_millis(1)),
                ..cfg(None, Some(Duration::from_millis(150))).transfer
            },
            ..cfg(None, None)
        };
        let out = run_pair(&medium, &c, Some(Duration::from_millis(40)), None).unwrap();
        let tx = out.tx.unwrap();
        assert!(tx.error.is_none());
        assert_eq!(out.rx.total_packets, tx.report.total_packets);
        // active time only: both sides stopped the clock while paused
        assert!(tx.report.duration_seconds < 0.3);
        assert!(out.rx.duration_seconds <= tx.report.duration_seconds + 0.05);
    }
}
