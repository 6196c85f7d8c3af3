//! Jobs and their live status
//!
//! A [`Job`] is one encoder invocation: an input, a resolved argument row and
//! the paths it writes. Jobs are shared as `Arc<Job>` between the scheduler,
//! the status recorder and the usage sampler; everything that changes while a
//! job runs lives behind interior mutability with a single writer per field.

use crate::setting::TranscodeSetting;
use crate::usage::{wall_clock, UsageLog};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

/// Workflow state, in the order a job moves through them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Waiting,
    Running,
    FirstPass,
    SecondPass,
    MeasuringDecode,
    Decoding,
    Finished,
}

impl WorkflowState {
    /// Convert state to the label used in logs and usage files
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Waiting => "waiting",
            WorkflowState::Running => "running",
            WorkflowState::FirstPass => "first pass",
            WorkflowState::SecondPass => "second pass",
            WorkflowState::MeasuringDecode => "measuring decode",
            WorkflowState::Decoding => "decoding",
            WorkflowState::Finished => "finished",
        }
    }

    /// A process belonging to the job may be alive in this state
    pub fn is_active(&self) -> bool {
        !matches!(self, WorkflowState::Waiting | WorkflowState::Finished)
    }

    fn rank(&self) -> u8 {
        match self {
            WorkflowState::Waiting => 0,
            WorkflowState::Running | WorkflowState::FirstPass => 1,
            WorkflowState::SecondPass => 2,
            WorkflowState::MeasuringDecode => 3,
            WorkflowState::Decoding => 4,
            WorkflowState::Finished => 5,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "message", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded)
    }
}

/// Typed status update, consumed by the job's single status owner
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// Raw `key=value` record from a progress stream
    Record { key: String, value: String },
    /// Progress percentage within the current phase
    Progress(f64),
    State(WorkflowState),
    Outcome(JobOutcome),
}

/// Live status of a job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub frame: u64,
    pub fps: f64,
    /// Cumulative output size in bytes
    pub total_size: u64,
    /// Encoded media time, as reported by the encoder
    pub out_time: String,
    pub speed: f64,
    pub bitrate: String,
    pub progress_perc: f64,
    pub state: WorkflowState,
    /// Every state visited, in order
    pub history: Vec<WorkflowState>,
    pub outcome: Option<JobOutcome>,
    /// Records without a dedicated field
    pub extra: BTreeMap<String, String>,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            frame: 0,
            fps: 0.0,
            total_size: 0,
            out_time: String::new(),
            speed: 0.0,
            bitrate: String::new(),
            progress_perc: 0.0,
            state: WorkflowState::Waiting,
            history: vec![WorkflowState::Waiting],
            outcome: None,
            extra: BTreeMap::new(),
        }
    }
}

impl JobStatus {
    /// Apply one event. Returns true if the event changed the workflow state
    /// or the progress percentage.
    pub fn apply(&mut self, event: StatusEvent) -> bool {
        match event {
            StatusEvent::Record { key, value } => {
                self.apply_record(key, value);
                false
            }
            StatusEvent::Progress(perc) => {
                let perc = perc.clamp(0.0, 100.0);
                if perc > self.progress_perc {
                    self.progress_perc = perc;
                    true
                } else {
                    false
                }
            }
            StatusEvent::State(next) => self.transition(next),
            StatusEvent::Outcome(outcome) => {
                if self.outcome.is_none() {
                    self.outcome = Some(outcome);
                }
                false
            }
        }
    }

    /// Progress with two decimals, as displayed
    pub fn progress_label(&self) -> String {
        format!("{:.2}", self.progress_perc)
    }

    fn apply_record(&mut self, key: String, value: String) {
        match key.as_str() {
            "frame" => {
                if let Ok(frame) = value.parse() {
                    self.frame = frame;
                }
            }
            "fps" => {
                if let Ok(fps) = value.parse() {
                    self.fps = fps;
                }
            }
            "total_size" => {
                if let Ok(size) = value.parse() {
                    self.total_size = size;
                }
            }
            "speed" => {
                if let Ok(speed) = value.trim_end_matches('x').parse() {
                    self.speed = speed;
                }
            }
            "out_time" => self.out_time = value,
            "bitrate" => self.bitrate = value,
            _ => {
                self.extra.insert(key, value);
            }
        }
    }

    fn transition(&mut self, next: WorkflowState) -> bool {
        if self.state == WorkflowState::Finished || next == self.state {
            return false;
        }
        if next.rank() < self.state.rank() {
            debug!(from = %self.state, to = %next, "ignoring backwards state transition");
            return false;
        }
        if next != WorkflowState::Finished {
            // a new phase counts its own frames
            self.progress_perc = 0.0;
            self.frame = 0;
        }
        self.state = next;
        self.history.push(next);
        true
    }
}

/// Mutable per-job bookkeeping shared with the recorder and the sampler
#[derive(Debug, Default)]
struct JobRuntime {
    status: RwLock<JobStatus>,
    /// 0 while no process is running
    pid: AtomicU32,
    /// Wall clock at the first process launch
    started_at: OnceLock<Duration>,
    bias_us: AtomicU64,
    finished: AtomicBool,
    samples: AtomicU64,
    usage_log: Mutex<Option<UsageLog>>,
}

/// One encoder invocation
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub input: PathBuf,
    pub args: Vec<String>,
    /// Final container written for the job
    pub output: PathBuf,
    /// Raw bitstream, for backends that cannot write the container
    pub encoded: Option<PathBuf>,
    /// Converted input, for backends that cannot read the original
    pub input_variant: Option<PathBuf>,
    /// Output subfolders contributed by separate sweeps
    pub subfolders: Vec<String>,
    pub setting: Arc<TranscodeSetting>,
    runtime: JobRuntime,
}

impl Job {
    pub fn new(
        input: impl Into<PathBuf>,
        args: Vec<String>,
        output: impl Into<PathBuf>,
        setting: Arc<TranscodeSetting>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            input: input.into(),
            args,
            output: output.into(),
            encoded: None,
            input_variant: None,
            subfolders: Vec::new(),
            setting,
            runtime: JobRuntime::default(),
        }
    }

    pub fn with_encoded(mut self, encoded: impl Into<PathBuf>) -> Self {
        self.encoded = Some(encoded.into());
        self
    }

    pub fn with_input_variant(mut self, variant: impl Into<PathBuf>) -> Self {
        self.input_variant = Some(variant.into());
        self
    }

    pub fn with_subfolders(mut self, subfolders: Vec<String>) -> Self {
        self.subfolders = subfolders;
        self
    }

    /// Short id for thread names and log lines
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }

    /// The file the encoder reads: the converted variant if there is one
    pub fn encoder_input(&self) -> &Path {
        self.input_variant.as_deref().unwrap_or(&self.input)
    }

    /// Prefix shared by both passes of a two-pass encode
    pub fn passlog_prefix(&self) -> PathBuf {
        self.output_dir().join(format!("{}_passlog", self.id))
    }

    pub fn usage_log_path(&self) -> PathBuf {
        self.sibling("_usage.log")
    }

    /// Encoder log of a two-stage backend
    pub fn report_path(&self, first_pass: bool) -> PathBuf {
        if first_pass {
            self.sibling("_first_pass.report")
        } else {
            self.sibling(".report")
        }
    }

    pub fn output_dir(&self) -> &Path {
        self.output.parent().unwrap_or_else(|| Path::new("."))
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let stem = self
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.clone());
        self.output.with_file_name(format!("{}{}", stem, suffix))
    }

    /// Snapshot of the current status
    pub fn status(&self) -> JobStatus {
        self.runtime.status.read().clone()
    }

    pub fn state(&self) -> WorkflowState {
        self.runtime.status.read().state
    }

    pub fn pid(&self) -> Option<u32> {
        match self.runtime.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn started_at(&self) -> Option<Duration> {
        self.runtime.started_at.get().copied()
    }

    pub fn bias(&self) -> Duration {
        Duration::from_micros(self.runtime.bias_us.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.runtime.finished.load(Ordering::Acquire)
    }

    /// Usage rows written so far
    pub fn sample_count(&self) -> u64 {
        self.runtime.samples.load(Ordering::Relaxed)
    }

    /// Only the status recorder calls this.
    pub(crate) fn apply(&self, event: StatusEvent) -> bool {
        self.runtime.status.write().apply(event)
    }

    pub(crate) fn process_started(&self, pid: u32) {
        self.runtime.started_at.get_or_init(wall_clock);
        self.runtime.pid.store(pid, Ordering::Release);
    }

    pub(crate) fn process_exited(&self) {
        self.runtime.pid.store(0, Ordering::Release);
    }

    pub(crate) fn add_bias(&self, gap: Duration) {
        let micros = u64::try_from(gap.as_micros()).unwrap_or(u64::MAX);
        self.runtime.bias_us.fetch_add(micros, Ordering::AcqRel);
    }

    pub(crate) fn count_sample(&self) {
        self.runtime.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn usage_log(&self) -> &Mutex<Option<UsageLog>> {
        &self.runtime.usage_log
    }

    /// Terminal bookkeeping: no process, no more sampling.
    pub(crate) fn mark_finished(&self) {
        self.runtime.pid.store(0, Ordering::Release);
        self.runtime.finished.store(true, Ordering::Release);
    }

    /// Record a terminal outcome for a job whose status owner is gone, such
    /// as after a worker panic.
    pub(crate) fn force_outcome(&self, outcome: JobOutcome) {
        let mut status = self.runtime.status.write();
        status.apply(StatusEvent::State(WorkflowState::Finished));
        status.apply(StatusEvent::Outcome(outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_job;

    fn record(key: &str, value: &str) -> StatusEvent {
        StatusEvent::Record {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_records_update_fields() {
        let mut status = JobStatus::default();
        status.apply(record("frame", "120"));
        status.apply(record("fps", "59.94"));
        status.apply(record("total_size", "1048576"));
        status.apply(record("speed", "1.25x"));
        status.apply(record("out_time", "00:00:04.004000"));
        status.apply(record("bitrate", "2094.2kbits/s"));
        status.apply(record("dup_frames", "0"));

        assert_eq!(status.frame, 120);
        assert!((status.fps - 59.94).abs() < 1e-9);
        assert_eq!(status.total_size, 1_048_576);
        assert!((status.speed - 1.25).abs() < 1e-9);
        assert_eq!(status.out_time, "00:00:04.004000");
        assert_eq!(status.bitrate, "2094.2kbits/s");
        assert_eq!(status.extra.get("dup_frames").map(String::as_str), Some("0"));
    }

    #[test]
    fn test_unparseable_values_are_ignored() {
        let mut status = JobStatus::default();
        status.apply(record("frame", "10"));
        status.apply(record("frame", "N/A"));
        status.apply(record("speed", "N/A"));
        assert_eq!(status.frame, 10);
        assert_eq!(status.speed, 0.0);
    }

    #[test]
    fn test_progress_is_monotonic_within_a_phase() {
        let mut status = JobStatus::default();
        status.apply(StatusEvent::State(WorkflowState::FirstPass));
        assert!(status.apply(StatusEvent::Progress(40.0)));
        assert!(!status.apply(StatusEvent::Progress(30.0)));
        assert_eq!(status.progress_label(), "40.00");
        status.apply(StatusEvent::Progress(250.0));
        assert_eq!(status.progress_label(), "100.00");
    }

    #[test]
    fn test_progress_resets_on_next_pass() {
        let mut status = JobStatus::default();
        status.apply(StatusEvent::State(WorkflowState::FirstPass));
        status.apply(StatusEvent::Progress(100.0));
        status.apply(StatusEvent::State(WorkflowState::SecondPass));
        assert_eq!(status.progress_perc, 0.0);
        status.apply(StatusEvent::Progress(12.5));
        status.apply(StatusEvent::State(WorkflowState::Finished));
        // finishing keeps the last value
        assert_eq!(status.progress_label(), "12.50");
    }

    #[test]
    fn test_transitions_are_ordered_and_terminal() {
        let mut status = JobStatus::default();
        assert!(status.apply(StatusEvent::State(WorkflowState::SecondPass)));
        assert!(!status.apply(StatusEvent::State(WorkflowState::FirstPass)));
        assert!(status.apply(StatusEvent::State(WorkflowState::Finished)));
        assert!(!status.apply(StatusEvent::State(WorkflowState::Decoding)));
        assert_eq!(
            status.history,
            vec![
                WorkflowState::Waiting,
                WorkflowState::SecondPass,
                WorkflowState::Finished
            ]
        );
    }

    #[test]
    fn test_outcome_recorded_once() {
        let mut status = JobStatus::default();
        status.apply(StatusEvent::Outcome(JobOutcome::Failed("boom".into())));
        status.apply(StatusEvent::Outcome(JobOutcome::Succeeded));
        assert_eq!(status.outcome, Some(JobOutcome::Failed("boom".into())));
    }

    #[test]
    fn test_derived_paths() {
        let job = test_job("/out/clip_crf_20.mkv");
        assert_eq!(job.usage_log_path(), PathBuf::from("/out/clip_crf_20_usage.log"));
        assert_eq!(job.report_path(false), PathBuf::from("/out/clip_crf_20.report"));
        assert_eq!(
            job.report_path(true),
            PathBuf::from("/out/clip_crf_20_first_pass.report")
        );
        assert_eq!(
            job.passlog_prefix(),
            PathBuf::from(format!("/out/{}_passlog", job.id))
        );
        assert_eq!(job.encoder_input(), Path::new("/in/clip.mkv"));
        assert_eq!(job.short_id().len(), 8);
    }

    #[test]
    fn test_pid_and_bias_bookkeeping() {
        let job = test_job("/out/a.mkv");
        assert_eq!(job.pid(), None);
        assert!(job.started_at().is_none());

        job.process_started(4242);
        assert_eq!(job.pid(), Some(4242));
        let started = job.started_at();
        assert!(started.is_some());

        job.process_exited();
        job.process_started(4343);
        // the first launch defines the sampling origin
        assert_eq!(job.started_at(), started);

        job.add_bias(Duration::from_millis(1500));
        job.add_bias(Duration::from_millis(500));
        assert_eq!(job.bias(), Duration::from_secs(2));

        job.mark_finished();
        assert_eq!(job.pid(), None);
        assert!(job.is_finished());
    }

    #[test]
    fn test_force_outcome() {
        let job = test_job("/out/a.mkv");
        job.force_outcome(JobOutcome::Failed("worker panicked".into()));
        let status = job.status();
        assert_eq!(status.state, WorkflowState::Finished);
        assert_eq!(status.outcome, Some(JobOutcome::Failed("worker panicked".into())));
    }
}
