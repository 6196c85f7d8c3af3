//! encsweep
//!
//! Execution engine for video transcoding experiments: expands swept encoder
//! options into jobs, runs them under bounded concurrency, tracks their
//! progress and samples their resource usage.

pub mod backend;
pub mod concurrency;
pub mod factory;
pub mod job;
pub mod matrix;
pub mod monitor;
pub mod preflight;
pub mod probe;
pub mod process;
pub mod report;
pub mod scheduler;
pub mod setting;
pub mod status;
pub mod sweep;
pub mod two_pass;
pub mod usage;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_support;

pub use encsweep_config as config;
pub use encsweep_config::Config;
pub use backend::{
    BackendError, BackendKind, Binaries, Capabilities, CheckMode, EncoderBackend, FfmpegBackend,
    VvcBackend,
};
pub use concurrency::{batch_ceiling, ConcurrencyError, ConcurrencyPolicy};
pub use factory::{build_jobs, FactoryError, JobFactory};
pub use job::{Job, JobOutcome, JobStatus, StatusEvent, WorkflowState};
pub use matrix::{MatrixError, OptionSpec, Token};
pub use monitor::{KeyValueParser, MonitorTiming, ProgressMonitor, StatusParser};
pub use preflight::{parse_ffmpeg_version, run_preflight, PreflightError};
pub use probe::{FfprobeInfo, Framerate, ProbeError, VideoInfo, VideoMetadata};
pub use process::{CommandLine, ProcessError};
pub use report::{BatchProgress, JobReport, RunSummary};
pub use scheduler::{JobScheduler, SchedulerError};
pub use setting::{Experiment, SettingError, TranscodeSetting};
pub use status::{StatusRecorder, StatusSink};
pub use sweep::{SweepError, SweepMode, SweepParameter};
pub use two_pass::{Pass, TwoPassController};
pub use usage::{DriftClock, UsageLog, UsageSampler};
pub use validator::ConfigValidator;
