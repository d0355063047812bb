use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::cli::{PauseInput, SessionConfig, TxOpts, seconds};
use crate::clock::{Clock, MonotonicClock};
use crate::dispatch::{TxDispatch, TxEvent};
use crate::error::SessionError;
use crate::handshake::establish_session;
use crate::input::{self, InputEvent};
use crate::link::serial::{SerialSettings, open_port};
use crate::link::{self, Link};
use crate::session::Session;
use crate::stats::Reporter;
use crate::transfer::{TransferOutcome, Transmitter};

const BUTTON_POLL: Duration = Duration::from_millis(10);

/// Handshake, then pump until a stop condition. A failed handshake
/// completes the session and is returned as the error.
pub fn transmit(
    link: &dyn Link,
    session: &Session,
    events: &Receiver<TxEvent>,
    input: &Receiver<InputEvent>,
    clock: &dyn Clock,
    cfg: &SessionConfig,
) -> Result<TransferOutcome, SessionError> {
    info!(
        peer = %session.peer(),
        channel = session.channel(),
        len = cfg.transfer.chunk_size,
        "[tx] handshaking"
    );
    let attempts = match establish_session(link, session, events, clock, &cfg.retry) {
        Ok(n) => n,
        Err(e) => {
            session.complete(clock.now_micros());
            return Err(e);
        }
    };
    info!(attempts, "[tx] session established");

    let mut reporter = Reporter::new("tx", cfg.report);
    let out = Transmitter::new(link, session, events, cfg.transfer).run(input, clock, &mut reporter);
    debug!(reports = reporter.emitted(), "[tx] pump stopped");
    Ok(out)
}

pub fn run(opts: TxOpts) -> Result<()> {
    let mut link = link::open(&opts.link)?;
    let cfg = SessionConfig::for_tx(&opts, link.mtu())?;

    link.configure(&cfg.link)
        .map_err(SessionError::Setup)
        .context("configure link")?;
    link.register_peer(cfg.peer)
        .map_err(SessionError::Setup)
        .with_context(|| format!("register peer {}", cfg.peer))?;
    let link: Arc<dyn Link> = Arc::from(link);

    let session = Arc::new(Session::new(cfg.peer, cfg.link.channel));
    let (dispatch, events) = TxDispatch::new(Arc::clone(&session), cfg.transfer.chunk_size);
    link.start(dispatch)
        .map_err(SessionError::Setup)
        .context("start link")?;

    let (press, input) = input::channel();
    match opts.pause_input {
        PauseInput::Stdin => {
            info!("[tx] press Enter to pause/resume");
            input::spawn_stdin(press.clone());
        }
        PauseInput::Cts => {
            let settings = SerialSettings {
                dev: opts.button_dev.clone(),
                baud: 9600,
                rtscts: false,
            };
            let mut port = open_port(&settings)
                .with_context(|| format!("open button line {}", opts.button_dev))?;
            info!(dev = %opts.button_dev, "[tx] button on CTS toggles pause");
            // pressed asserts CTS; the edge detector wants released = high
            input::spawn_polled(
                press.clone(),
                move || port.read_clear_to_send().ok().map(|cts| !cts),
                BUTTON_POLL,
                Arc::new(MonotonicClock::new()),
            );
        }
        PauseInput::Off => {}
    }
    if let Some(every) = seconds("toggle-every", opts.toggle_every)? {
        input::spawn_toggle(press.clone(), every);
    }
    drop(press);

    let clock = MonotonicClock::new();
    let result = transmit(link.as_ref(), &session, &events, &input, &clock, &cfg);
    link.stop();

    let outcome = result.context("session not established")?;
    match outcome.error {
        Some(e) => {
            error!("[tx] session failed after {} chunks: {}", outcome.sent, e);
            Err(e).context("transfer")
        }
        None => {
            info!(sent = outcome.sent, "[tx] done");
            Ok(())
        }
    }
}
