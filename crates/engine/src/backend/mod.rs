//! Encoder backends
//!
//! A backend knows how to launch one family of encoders: which command lines
//! to build, how the process reports progress, and how to dry-run a set of
//! arguments. The registry is closed; [`BackendKind`] maps the identifier from
//! the experiment file to an implementation.

pub mod ffmpeg;
pub mod vvc;

pub use ffmpeg::FfmpegBackend;
pub use vvc::VvcBackend;

use crate::config::BinariesConfig;
use crate::job::Job;
use crate::monitor::{MonitorTiming, ProgressMonitor, StatusParser};
use crate::probe::{ProbeError, VideoInfo};
use crate::process::{ExitReport, MonitoredChild, ProcessError, StatusStream};
use crate::setting::TranscodeSetting;
use crate::status::StatusSink;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Error type for backend operations
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("unsupported pixel format '{0}' (expected planar yuv4xx)")]
    UnsupportedPixelFormat(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("job has no {0} path")]
    MissingPath(&'static str),
}

impl BackendError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        BackendError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Backend identifier not in the registry
#[derive(Debug, Clone, Error, PartialEq)]
#[error("unknown backend '{0}' (expected ffmpeg or vvc)")]
pub struct UnknownBackend(pub String);

/// Closed registry of backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Ffmpeg,
    Vvc,
}

impl BackendKind {
    pub fn instantiate(self) -> Arc<dyn EncoderBackend> {
        match self {
            BackendKind::Ffmpeg => Arc::new(FfmpegBackend),
            BackendKind::Vvc => Arc::new(VvcBackend),
        }
    }
}

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ffmpeg" => Ok(BackendKind::Ffmpeg),
            "vvc" | "vvenc" => Ok(BackendKind::Vvc),
            _ => Err(UnknownBackend(s.to_string())),
        }
    }
}

/// Static facts about a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The encoder writes the final `.mkv` itself
    pub writes_container: bool,
    /// Extension of the raw bitstream when it does not
    pub bitstream_extension: &'static str,
    /// Input extensions read natively. Empty means every container.
    pub native_inputs: &'static [&'static str],
}

impl Capabilities {
    pub fn accepts(&self, input: &Path) -> bool {
        if self.native_inputs.is_empty() {
            return true;
        }
        input
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .is_some_and(|ext| self.native_inputs.contains(&ext.as_str()))
    }
}

/// Dry run flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckMode {
    /// Synthetic input, edge rows, cached
    #[default]
    Quick,
    /// Real inputs, every row
    Slow,
}

impl FromStr for CheckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(CheckMode::Quick),
            "slow" => Ok(CheckMode::Slow),
            other => Err(format!("unknown check mode '{}' (expected quick or slow)", other)),
        }
    }
}

/// What a dry run encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckTarget<'a> {
    Synthetic,
    Input(&'a Path),
}

/// Helper binaries shared by every backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binaries {
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl Default for Binaries {
    fn default() -> Self {
        Self::from(&BinariesConfig::default())
    }
}

impl From<&BinariesConfig> for Binaries {
    fn from(config: &BinariesConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            ffprobe: config.ffprobe.clone(),
        }
    }
}

/// Everything a backend needs while running one job
#[derive(Clone, Copy)]
pub struct JobContext<'a> {
    pub sink: &'a StatusSink,
    pub info: &'a dyn VideoInfo,
    pub binaries: &'a Binaries,
    pub timing: MonitorTiming,
}

/// Everything a backend needs for input conversion and dry runs
#[derive(Clone, Copy)]
pub struct CheckContext<'a> {
    pub info: &'a dyn VideoInfo,
    pub binaries: &'a Binaries,
    /// Where dry runs may write temporary files
    pub scratch: &'a Path,
}

/// One family of encoders
pub trait EncoderBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Every executable a job of `setting` launches, helpers excluded
    fn executables(&self, setting: &TranscodeSetting) -> Vec<String> {
        vec![setting.binary.clone()]
    }

    /// Produce `variant` from `input` for backends that cannot read `input`
    fn prepare_input(
        &self,
        _input: &Path,
        _variant: &Path,
        _ctx: &CheckContext<'_>,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    /// Launch and supervise every process of `job`, returning once the last
    /// one exited.
    fn start(&self, job: &Job, ctx: &JobContext<'_>) -> Result<(), BackendError>;

    /// Dry run `args`. The error carries the encoder's diagnostics.
    fn check_arguments(
        &self,
        setting: &TranscodeSetting,
        args: &[String],
        target: CheckTarget<'_>,
        ctx: &CheckContext<'_>,
    ) -> Result<(), String>;
}

/// Track `child` as the job's live process while `parser` consumes its status
/// stream, then wind the monitor down and check the exit code.
pub(crate) fn supervise(
    job: &Job,
    ctx: &JobContext<'_>,
    child: MonitoredChild,
    stream: StatusStream,
    parser: Box<dyn StatusParser>,
) -> Result<ExitReport, BackendError> {
    job.process_started(child.pid());
    debug!(job_id = %job.short_id(), pid = child.pid(), command = %child.command(), "process started");

    let stop = stream.stop_hook();
    let monitor = match ProgressMonitor::spawn(job.short_id(), stream, parser, ctx.sink.clone()) {
        Ok(monitor) => monitor,
        Err(e) => {
            stop.stop();
            let waited = child.wait(ctx.timing.join_timeout);
            job.process_exited();
            waited?;
            return Err(BackendError::io("could not start progress monitor", e));
        }
    };

    let waited = child.wait(ctx.timing.join_timeout);
    job.process_exited();
    let exit = monitor.finish(ctx.timing);
    debug!(job_id = %job.short_id(), ?exit, "progress monitor finished");
    Ok(waited?.into_result()?)
}

/// Track a process that has no status stream
pub(crate) fn run_watched(
    job: &Job,
    ctx: &JobContext<'_>,
    child: MonitoredChild,
) -> Result<ExitReport, BackendError> {
    job.process_started(child.pid());
    debug!(job_id = %job.short_id(), pid = child.pid(), command = %child.command(), "process started");
    let waited = child.wait(ctx.timing.join_timeout);
    job.process_exited();
    Ok(waited?.into_result()?)
}

/// Short diagnostic for a failed dry run
pub(crate) fn describe_failure(command: &str, code: Option<i32>, stderr: &[u8]) -> String {
    let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
    format!(
        "`{}` exited with {}\n{}",
        command,
        code,
        String::from_utf8_lossy(stderr).trim()
    )
}

/// Remove a dry run artifact, logging instead of failing
pub(crate) fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove temporary file");
        }
    }
}

/// Fresh scratch file name for a dry run
pub(crate) fn scratch_file(scratch: &Path, extension: &str) -> PathBuf {
    scratch.join(format!("encsweep-check-{}.{}", uuid::Uuid::new_v4(), extension))
}
