//! Pause/resume input sources. Every source hands presses to the transfer
//! task over a channel, so the task can block on it instead of polling.

use std::io::BufRead;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Press,
}

const EVENT_QUEUE: usize = 16;
pub const BUTTON_DEBOUNCE: Duration = Duration::from_millis(50);

pub fn channel() -> (SyncSender<InputEvent>, Receiver<InputEvent>) {
    mpsc::sync_channel(EVENT_QUEUE)
}

/// Turns a sampled active-low button level into debounced press edges.
#[derive(Debug)]
pub struct ButtonEdge {
    last_level: bool,
    last_edge: Option<i64>,
    debounce_micros: i64,
}

impl ButtonEdge {
    pub fn new(debounce: Duration) -> Self {
        Self {
            last_level: true,
            last_edge: None,
            debounce_micros: debounce.as_micros() as i64,
        }
    }

    /// Feed one sample (`true` = released). Returns a press on a high-to-low edge.
    pub fn sample(&mut self, level: bool, now: i64) -> Option<InputEvent> {
        let falling = self.last_level && !level;
        self.last_level = level;
        if !falling {
            return None;
        }
        if let Some(prev) = self.last_edge
            && now - prev < self.debounce_micros
        {
            return None;
        }
        self.last_edge = Some(now);
        Some(InputEvent::Press)
    }
}

fn deliver(tx: &SyncSender<InputEvent>, ev: InputEvent) -> bool {
    match tx.try_send(ev) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("[input] event queue full, press dropped");
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

/// Each line on stdin (Enter) is a button press.
pub fn spawn_stdin(tx: SyncSender<InputEvent>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            if line.is_err() {
                break;
            }
            debug!("[input] stdin press");
            if !deliver(&tx, InputEvent::Press) {
                break;
            }
        }
    })
}

/// Press the button every `every`, forever or until the receiver goes away.
pub fn spawn_toggle(tx: SyncSender<InputEvent>, every: Duration) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        loop {
            thread::sleep(every);
            debug!("[input] scheduled press");
            if !deliver(&tx, InputEvent::Press) {
                break;
            }
        }
    })
}

/// Sample a level source at `period` and forward debounced presses. Stops
/// when the source returns `None`.
pub fn spawn_polled<F>(
    tx: SyncSender<InputEvent>,
    mut level: F,
    period: Duration,
    clock: Arc<dyn Clock>,
) -> thread::JoinHandle<()>
where
    F: FnMut() -> Option<bool> + Send + 'static,
{
    thread::spawn(move || {
        let mut edge = ButtonEdge::new(BUTTON_DEBOUNCE);
        while let Some(l) = level() {
            if let Some(ev) = edge.sample(l, clock.now_micros())
                && !deliver(&tx, ev)
            {
                break;
            }
            thread::sleep(period);
        }
    })
}
