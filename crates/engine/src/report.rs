//! Batch progress and run summaries
//!
//! Provides throttled aggregate progress logging while a batch runs and the
//! per-job summary written as JSON when it ends.

use crate::job::{Job, JobOutcome, WorkflowState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Final record of one job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobReport {
    pub id: String,
    pub setting: String,
    pub input: String,
    pub output: String,
    pub args: Vec<String>,
    pub states: Vec<WorkflowState>,
    pub outcome: JobOutcome,
    pub elapsed_secs: f64,
    pub output_size_bytes: Option<u64>,
    pub usage_samples: u64,
    pub bias_secs: f64,
}

impl JobReport {
    pub fn from_job(job: &Job, elapsed: Duration) -> Self {
        let status = job.status();
        Self {
            id: job.id.clone(),
            setting: job.setting.name.clone(),
            input: job.input.display().to_string(),
            output: job.output.display().to_string(),
            args: job.args.clone(),
            states: status.history,
            outcome: status
                .outcome
                .unwrap_or_else(|| JobOutcome::Failed("no outcome recorded".to_string())),
            elapsed_secs: elapsed.as_secs_f64(),
            output_size_bytes: fs::metadata(&job.output).ok().map(|m| m.len()),
            usage_samples: job.sample_count(),
            bias_secs: job.bias().as_secs_f64(),
        }
    }
}

/// Outcome of a whole batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_secs: f64,
    pub jobs: Vec<JobReport>,
}

impl RunSummary {
    pub fn new(jobs: Vec<JobReport>, elapsed: Duration) -> Self {
        let succeeded = jobs.iter().filter(|j| j.outcome.is_success()).count();
        Self {
            total: jobs.len(),
            succeeded,
            failed: jobs.len() - succeeded,
            elapsed_secs: elapsed.as_secs_f64(),
            jobs,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Failed jobs with their messages
    pub fn failures(&self) -> impl Iterator<Item = (&JobReport, &str)> {
        self.jobs.iter().filter_map(|job| match &job.outcome {
            JobOutcome::Failed(message) => Some((job, message.as_str())),
            JobOutcome::Succeeded => None,
        })
    }

    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(path, json)
    }
}

/// Aggregate counts across a batch
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatchSnapshot {
    pub total: usize,
    pub waiting: usize,
    pub active: usize,
    pub finished: usize,
    pub failed: usize,
    /// Mean progress percentage, finished jobs counting as 100
    pub mean_progress: f64,
}

/// Logs aggregate progress at most once per `every`
#[derive(Debug)]
pub struct BatchProgress {
    jobs: Vec<Arc<Job>>,
    every: Duration,
    last_logged: Mutex<Option<Instant>>,
}

impl BatchProgress {
    pub fn new(jobs: Vec<Arc<Job>>, every: Duration) -> Self {
        Self {
            jobs,
            every,
            last_logged: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        let mut snapshot = BatchSnapshot {
            total: self.jobs.len(),
            waiting: 0,
            active: 0,
            finished: 0,
            failed: 0,
            mean_progress: 0.0,
        };
        let mut progress_sum = 0.0;
        for job in &self.jobs {
            let status = job.status();
            match status.state {
                WorkflowState::Waiting => snapshot.waiting += 1,
                WorkflowState::Finished => {
                    snapshot.finished += 1;
                    if matches!(status.outcome, Some(JobOutcome::Failed(_))) {
                        snapshot.failed += 1;
                    }
                }
                _ => snapshot.active += 1,
            }
            progress_sum += if status.state == WorkflowState::Finished {
                100.0
            } else {
                status.progress_perc
            };
        }
        if snapshot.total > 0 {
            snapshot.mean_progress = progress_sum / snapshot.total as f64;
        }
        snapshot
    }

    /// Called by status recorders on every state or progress change
    pub fn observe(&self) {
        {
            let mut last = self.last_logged.lock();
            let now = Instant::now();
            if last.is_some_and(|at| now.duration_since(at) < self.every) {
                return;
            }
            *last = Some(now);
        }
        let s = self.snapshot();
        info!(
            finished = s.finished,
            active = s.active,
            waiting = s.waiting,
            failed = s.failed,
            total = s.total,
            "batch progress {:.2}%",
            s.mean_progress
        );
    }
}
