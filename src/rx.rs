use anyhow::{Context, Result, bail};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use tracing::{debug, info, warn};

use crate::cli::{RxOpts, SessionConfig};
use crate::clock::{Clock, MonotonicClock};
use crate::dispatch::{PauseDetection, RxDispatch, RxEvent};
use crate::error::SessionError;
use crate::link::{self, Link};
use crate::session::Session;
use crate::stats::Reporter;
use crate::transfer::{ReceiveEnd, ReceiveOutcome, run_receiver};

pub struct Receiving {
    pub session: Arc<Session>,
    pub dispatch: Arc<RxDispatch>,
    pub events: Receiver<RxEvent>,
}

/// Attach a receiving session to a configured link and start it.
pub fn attach(
    link: &Arc<dyn Link>,
    clock: Arc<dyn Clock>,
    cfg: &SessionConfig,
) -> Result<Receiving, SessionError> {
    let detection = if cfg.receive.silence.is_some() {
        PauseDetection::Silence
    } else {
        PauseDetection::Explicit
    };
    let session = Arc::new(Session::new(cfg.peer, cfg.link.channel));
    let (dispatch, events) = RxDispatch::new(
        Arc::clone(&session),
        Arc::clone(link),
        clock,
        cfg.transfer.chunk_size,
        detection,
    );
    link.start(dispatch.clone()).map_err(SessionError::Setup)?;
    Ok(Receiving {
        session,
        dispatch,
        events,
    })
}

pub fn receive(r: &Receiving, clock: &dyn Clock, cfg: &SessionConfig) -> ReceiveOutcome {
    info!(
        peer = %r.session.peer(),
        channel = r.session.channel(),
        len = cfg.transfer.chunk_size,
        detection = ?r.dispatch.detection(),
        "[rx] waiting for handshake"
    );
    let mut reporter = Reporter::new("rx", cfg.report);
    let out = run_receiver(
        &r.session,
        &r.dispatch,
        &r.events,
        clock,
        &cfg.receive,
        &mut reporter,
    );
    debug!(reports = reporter.emitted(), "[rx] receiver stopped");
    out
}

pub fn run(opts: RxOpts) -> Result<()> {
    let mut link = link::open(&opts.link)?;
    let cfg = SessionConfig::for_rx(&opts, link.mtu())?;

    link.configure(&cfg.link)
        .map_err(SessionError::Setup)
        .context("configure link")?;
    link.register_peer(cfg.peer)
        .map_err(SessionError::Setup)
        .with_context(|| format!("register peer {}", cfg.peer))?;
    let link: Arc<dyn Link> = Arc::from(link);

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let receiving = attach(&link, Arc::clone(&clock), &cfg).context("start link")?;
    let out = receive(&receiving, clock.as_ref(), &cfg);
    link.stop();

    match out.end {
        ReceiveEnd::IdleTimeout => bail!("no handshake from {} before idle timeout", cfg.peer),
        ReceiveEnd::LinkClosed => {
            warn!("[rx] link closed");
            Ok(())
        }
        ReceiveEnd::Finished | ReceiveEnd::DurationElapsed => {
            info!(end = ?out.end, "[rx] done");
            Ok(())
        }
    }
}
