//! Progress monitoring
//!
//! A [`ProgressMonitor`] owns one background thread that reads a process's
//! status stream line by line, hands each line to a backend specific
//! [`StatusParser`] and forwards the resulting events to the job's status
//! owner. Once the process has exited the monitor is wound down with a short
//! grace period, the stop hook and a bounded join.

use crate::process::{for_each_line, join_with_timeout, StatusStream, StopHook};
use crate::status::StatusSink;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What a parser wants after a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Continue,
    /// End sentinel seen, stop reading
    End,
}

/// Turns status lines into status events
pub trait StatusParser: Send {
    fn parse_line(&mut self, line: &str, sink: &StatusSink) -> LineOutcome;
}

/// Parser for ffmpeg's `-progress` protocol: newline delimited `key=value`
/// blocks terminated by `progress=end`.
#[derive(Debug, Clone)]
pub struct KeyValueParser {
    total_frames: u64,
}

impl KeyValueParser {
    pub fn new(total_frames: u64) -> Self {
        Self { total_frames }
    }
}

impl StatusParser for KeyValueParser {
    fn parse_line(&mut self, line: &str, sink: &StatusSink) -> LineOutcome {
        let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        let Some((key, value)) = compact.split_once('=') else {
            return LineOutcome::Continue;
        };

        if key == "frame" {
            if let Some(perc) = value
                .parse::<u64>()
                .ok()
                .and_then(|frame| progress_percent(frame, self.total_frames))
            {
                sink.progress(perc);
            }
        }

        let end = key == "progress" && value == "end";
        sink.record(key, value);
        if end {
            sink.progress(100.0);
            return LineOutcome::End;
        }
        LineOutcome::Continue
    }
}

/// `100 * frame / total`, rounded to two decimals and capped at 100.
/// `None` when the total is unknown.
pub fn progress_percent(frame: u64, total_frames: u64) -> Option<f64> {
    if total_frames == 0 {
        return None;
    }
    let perc = frame as f64 * 100.0 / total_frames as f64;
    Some(((perc * 100.0).round() / 100.0).min(100.0))
}

/// Timing used when winding a monitor down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTiming {
    /// How long a reader may keep going after its process exited
    pub grace: Duration,
    /// Bounded join after the stop hook fired
    pub join_timeout: Duration,
}

impl Default for MonitorTiming {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(100),
            join_timeout: Duration::from_secs(2),
        }
    }
}

/// How the reader thread ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Reader hit the end sentinel or EOF on its own
    Completed,
    /// Reader needed the stop hook
    Stopped,
    /// Reader never finished and was left behind
    Detached,
}

/// Background reader for one process's status stream
pub struct ProgressMonitor {
    handle: JoinHandle<()>,
    stop: StopHook,
    name: String,
}

impl ProgressMonitor {
    pub fn spawn(
        name: &str,
        stream: StatusStream,
        mut parser: Box<dyn StatusParser>,
        sink: StatusSink,
    ) -> io::Result<Self> {
        let (reader, stop) = stream.into_parts();
        let handle = thread::Builder::new()
            .name(format!("progress-{}", name))
            .spawn(move || {
                for_each_line(reader, |line| {
                    parser.parse_line(line, &sink) == LineOutcome::Continue
                });
            })?;
        Ok(Self {
            handle,
            stop,
            name: name.to_string(),
        })
    }

    /// Wind the reader down after its process exited.
    ///
    /// Never fails: a reader that cannot be stopped is detached with a warning.
    pub fn finish(self, timing: MonitorTiming) -> MonitorExit {
        let deadline = Instant::now() + timing.grace;
        while !self.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let exit = if self.handle.is_finished() {
            join_with_timeout(self.handle, timing.join_timeout);
            MonitorExit::Completed
        } else {
            debug!(monitor = %self.name, "reader still running after exit, firing stop hook");
            self.stop.stop();
            if join_with_timeout(self.handle, timing.join_timeout) {
                MonitorExit::Stopped
            } else {
                warn!(monitor = %self.name, "progress reader did not stop, detaching it");
                MonitorExit::Detached
            }
        };
        // the parent's write end is released in every case
        self.stop.stop();
        exit
    }
}
