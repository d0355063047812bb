use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::session::Session;

/// Point-in-time copy of the counters a report is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub total_bytes: u64,
    pub total_packets: u64,
    pub failed_packets: u64,
    pub ignored_frames: u64,
    pub active_micros: u64,
}

impl Snapshot {
    /// Read the session without touching it. `now` only extends the
    /// running interval, if one is open.
    pub fn take(session: &Session, now: i64) -> Self {
        Self {
            total_bytes: session.counters.total_bytes(),
            total_packets: session.counters.total_packets(),
            failed_packets: session.counters.failed_packets(),
            ignored_frames: session.counters.ignored_frames(),
            active_micros: session.tracker.elapsed_micros(now),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    pub total_bytes: u64,
    pub total_packets: u64,
    pub failed_packets: u64,
    pub ignored_frames: u64,
    pub duration_seconds: f64,
    pub throughput_kbps: f64,
}

impl Report {
    pub fn compute(s: &Snapshot) -> Self {
        let duration_seconds = s.active_micros as f64 / 1_000_000.0;
        let throughput_kbps = if s.active_micros == 0 {
            0.0
        } else {
            (s.total_bytes as f64 / 1024.0) / duration_seconds
        };
        Self {
            total_bytes: s.total_bytes,
            total_packets: s.total_packets,
            failed_packets: s.failed_packets,
            ignored_frames: s.ignored_frames,
            duration_seconds,
            throughput_kbps,
        }
    }

    /// Fraction of `sent` packets this report accounts for.
    pub fn delivery_ratio(&self, sent: u64) -> Option<f64> {
        (sent > 0).then(|| self.total_packets as f64 / sent as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Periodic,
    Paused,
    Final,
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReportKind::Periodic => "periodic",
            ReportKind::Paused => "paused",
            ReportKind::Final => "final",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    /// Every interval of wall-clock time, paused or not
    Periodic(Duration),
    /// Only at pause and stop
    Boundaries,
}

impl ReportMode {
    pub fn from_cli(mode: &str, interval_s: f64) -> anyhow::Result<Self> {
        match mode.parse::<ReportModeName>()? {
            ReportModeName::Periodic => {
                if !(interval_s > 0.0 && interval_s.is_finite()) {
                    anyhow::bail!("report interval must be positive, got {interval_s}");
                }
                let every = Duration::try_from_secs_f64(interval_s)
                    .map_err(|e| anyhow::anyhow!("report interval {interval_s}: {e}"))?;
                Ok(ReportMode::Periodic(every))
            }
            ReportModeName::Boundaries => Ok(ReportMode::Boundaries),
        }
    }
}

enum ReportModeName {
    Periodic,
    Boundaries,
}

impl FromStr for ReportModeName {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "periodic" => Ok(ReportModeName::Periodic),
            "boundaries" => Ok(ReportModeName::Boundaries),
            _ => Err(anyhow::anyhow!(
                "report mode must be 'periodic' or 'boundaries', got '{s}'"
            )),
        }
    }
}

/// Decides when to report and writes reports to the log.
#[derive(Debug)]
pub struct Reporter {
    role: &'static str,
    mode: ReportMode,
    last: Option<i64>,
    emitted: u32,
}

impl Reporter {
    pub fn new(role: &'static str, mode: ReportMode) -> Self {
        Self {
            role,
            mode,
            last: None,
            emitted: 0,
        }
    }

    /// Start the periodic schedule at `now`.
    pub fn arm(&mut self, now: i64) {
        self.last = Some(now);
    }

    /// How long until the next periodic report is due.
    pub fn until_due(&self, now: i64) -> Option<Duration> {
        match (self.mode, self.last) {
            (ReportMode::Periodic(every), Some(last)) => {
                let every = i64::try_from(every.as_micros()).unwrap_or(i64::MAX);
                let due = last.saturating_add(every);
                Some(Duration::from_micros(due.saturating_sub(now).max(0) as u64))
            }
            _ => None,
        }
    }

    /// Emit a periodic report if one is due. Returns it when emitted.
    pub fn maybe_report(&mut self, session: &Session, now: i64) -> Option<Report> {
        if self.until_due(now)? > Duration::ZERO {
            return None;
        }
        self.last = Some(now);
        Some(self.report(ReportKind::Periodic, session, now))
    }

    pub fn on_pause(&mut self, session: &Session, now: i64) -> Option<Report> {
        match self.mode {
            ReportMode::Boundaries => Some(self.report(ReportKind::Paused, session, now)),
            ReportMode::Periodic(_) => None,
        }
    }

    pub fn finish(&mut self, session: &Session, now: i64) -> Report {
        self.report(ReportKind::Final, session, now)
    }

    pub fn emitted(&self) -> u32 {
        self.emitted
    }

    fn report(&mut self, kind: ReportKind, session: &Session, now: i64) -> Report {
        let r = Report::compute(&Snapshot::take(session, now));
        self.emitted += 1;
        info!(
            role = self.role,
            %kind,
            total_bytes = r.total_bytes,
            total_packets = r.total_packets,
            failed_packets = r.failed_packets,
            ignored_frames = r.ignored_frames,
            duration_seconds = format_args!("{:.2}", r.duration_seconds),
            throughput_kbps = format_args!("{:.2}", r.throughput_kbps),
            "[{}] {} bytes ({} packets) over {:.2}s => {:.2} KB/s",
            self.role,
            r.total_bytes,
            r.total_packets,
            r.duration_seconds,
            r.throughput_kbps,
        );
        r
    }
}
