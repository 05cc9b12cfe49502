//! Log-driven phase detection over a server's console output.
//!
//! The server's log format is not versioned, so markers are plain substring
//! matches against raw lines.

use anyhow::Result;
use std::collections::VecDeque;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::WatchError;

pub const READY_MARKER: &str = "Done";
pub const PREGEN_STARTED_MARKER: &str = "Starting pregen";
pub const PREGEN_COMPLETE_MARKER: &str = "Pregen is complete";
pub const STOPPING_MARKER: &str = "Stopping server";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub text: String,
    /// When the line was read from the server.
    pub at: Instant,
}

impl LogLine {
    pub fn new(text: impl Into<String>, at: Instant) -> Self {
        Self {
            text: text.into(),
            at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextLine {
    Line(LogLine),
    TimedOut,
    /// The stream has ended; no further lines will arrive.
    Closed,
}

/// Pull-based source of console lines. `timeout: None` blocks until a line
/// arrives or the stream closes.
pub trait LineSource {
    fn next_line(&mut self, timeout: Option<Duration>) -> NextLine;
}

/// A finite, pre-recorded line stream.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLines {
    lines: VecDeque<LogLine>,
}

impl ScriptedLines {
    pub fn new(lines: impl IntoIterator<Item = LogLine>) -> Self {
        Self {
            lines: lines.into_iter().collect(),
        }
    }

    pub fn push(&mut self, line: LogLine) {
        self.lines.push_back(line);
    }

    pub fn remaining(&self) -> usize {
        self.lines.len()
    }
}

impl LineSource for ScriptedLines {
    fn next_line(&mut self, _timeout: Option<Duration>) -> NextLine {
        match self.lines.pop_front() {
            Some(line) => NextLine::Line(line),
            None => NextLine::Closed,
        }
    }
}

pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// Where raw server lines are echoed as they are consumed.
#[derive(Clone, Default)]
pub enum EchoTarget {
    #[default]
    Stdout,
    Stderr,
    Silent,
    Writer(SharedWriter),
}

impl fmt::Debug for EchoTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EchoTarget::Stdout => f.write_str("Stdout"),
            EchoTarget::Stderr => f.write_str("Stderr"),
            EchoTarget::Silent => f.write_str("Silent"),
            EchoTarget::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerMatch {
    pub marker: String,
    pub line: LogLine,
}

impl MarkerMatch {
    pub fn is(&self, marker: &str) -> bool {
        self.marker == marker
    }
}

/// Consumes server output until one of a set of markers shows up, echoing
/// every line to the operator unchanged.
#[derive(Debug, Clone, Default)]
pub struct LogWatcher {
    echo: EchoTarget,
}

impl LogWatcher {
    pub fn new(echo: EchoTarget) -> Self {
        Self { echo }
    }

    /// Returns the first marker contained in a consumed line. Markers are
    /// checked in the order given, so when one line contains several the
    /// earliest listed wins.
    pub fn await_marker<S: LineSource + ?Sized>(
        &self,
        source: &mut S,
        markers: &[&str],
        timeout: Option<Duration>,
    ) -> Result<MarkerMatch> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                return Err(self.timed_out(markers, started));
            }
            match source.next_line(remaining) {
                NextLine::Line(line) => {
                    self.echo_line(&line.text);
                    if let Some(marker) = markers.iter().find(|m| line.text.contains(**m)) {
                        return Ok(MarkerMatch {
                            marker: (*marker).to_string(),
                            line,
                        });
                    }
                }
                NextLine::TimedOut => return Err(self.timed_out(markers, started)),
                NextLine::Closed => {
                    return Err(WatchError::StreamEnded {
                        expected: owned(markers),
                    }
                    .into())
                }
            }
        }
    }

    fn timed_out(&self, markers: &[&str], started: Instant) -> anyhow::Error {
        WatchError::TimedOut {
            expected: owned(markers),
            waited: started.elapsed(),
        }
        .into()
    }

    fn echo_line(&self, text: &str) {
        match &self.echo {
            EchoTarget::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{}", text);
            }
            EchoTarget::Stderr => {
                let mut err = std::io::stderr().lock();
                let _ = writeln!(err, "{}", text);
            }
            EchoTarget::Silent => {}
            EchoTarget::Writer(writer) => {
                let mut out = writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let _ = writeln!(out, "{}", text);
            }
        }
    }
}

fn owned(markers: &[&str]) -> Vec<String> {
    markers.iter().map(|m| m.to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Ready,
    PregenRunning,
    PregenComplete,
    Stopped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Starting => "starting",
            Phase::Ready => "ready",
            Phase::PregenRunning => "pregen_running",
            Phase::PregenComplete => "pregen_complete",
            Phase::Stopped => "stopped",
        }
    }
}

/// Current server phase, derived only from lines seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTracker {
    phase: Phase,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self {
            phase: Phase::Starting,
        }
    }
}

impl PhaseTracker {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Folds one console line in and returns the phase afterwards.
    pub fn observe(&mut self, text: &str) -> Phase {
        let next = if text.contains(PREGEN_COMPLETE_MARKER) {
            Phase::PregenComplete
        } else if text.contains(PREGEN_STARTED_MARKER) {
            Phase::PregenRunning
        } else if text.contains(STOPPING_MARKER) {
            Phase::Stopped
        } else if text.contains(READY_MARKER) && self.phase == Phase::Starting {
            Phase::Ready
        } else {
            self.phase
        };
        self.phase = next;
        next
    }

    /// Marks the end of the stream or a reaped process.
    pub fn mark_stopped(&mut self) {
        self.phase = Phase::Stopped;
    }
}

/// Measures the pregeneration phase between its start and end markers.
#[derive(Debug, Clone, Copy, Default)]
pub struct PregenTimer {
    started_at: Option<Instant>,
}

impl PregenTimer {
    pub fn start(&mut self, at: Instant) {
        self.started_at = Some(at);
    }

    /// Elapsed time since [`start`](Self::start), or `None` if no start was
    /// ever recorded.
    pub fn finish(&self, at: Instant) -> Option<Duration> {
        self.started_at.map(|s| at.saturating_duration_since(s))
    }
}

/// Rounds to whole seconds and renders `H:MM:SS`, e.g. `0:00:10`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = round_to_secs(elapsed);
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

pub fn round_to_secs(elapsed: Duration) -> u64 {
    let millis = elapsed.as_millis();
    ((millis + 500) / 1000) as u64
}
