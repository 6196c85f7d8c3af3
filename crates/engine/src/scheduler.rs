//! Batch scheduler
//!
//! Runs a batch of jobs under a bounded worker pool. A batch-wide semaphore
//! caps the total number of live jobs and one semaphore per setting caps the
//! jobs of that setting. Every job runs on a blocking worker and owns one
//! external process at a time.
//!
//! A failing or panicking job is recorded as failed and never stops its
//! siblings; [`JobScheduler::run`] always returns a report for every job.

use crate::backend::{BackendError, Binaries, CheckContext, JobContext};
use crate::job::{Job, JobOutcome, WorkflowState};
use crate::monitor::MonitorTiming;
use crate::probe::VideoInfo;
use crate::report::{BatchProgress, JobReport, RunSummary};
use crate::status::{StatusRecorder, StatusSink};
use crate::usage::{attach_log, detach_log, UsageSampler};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Error type for a single scheduled job
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The input variant could not be produced
    #[error("input conversion failed: {0}")]
    Input(String),

    /// The backend reported a failure
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Output directories could not be created
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The worker panicked
    #[error("worker panicked: {0}")]
    Panicked(String),
}

/// Converts each input variant at most once per run.
///
/// Jobs sharing a variant wait for the first conversion and share its result.
#[derive(Default)]
struct InputPreparer {
    variants: Mutex<HashMap<PathBuf, Arc<OnceLock<Result<(), String>>>>>,
}

impl InputPreparer {
    fn ensure(&self, job: &Job, ctx: &CheckContext<'_>) -> Result<(), SchedulerError> {
        let Some(variant) = job.input_variant.as_deref() else {
            return Ok(());
        };
        let cell = self
            .variants
            .lock()
            .entry(variant.to_path_buf())
            .or_default()
            .clone();
        let result = cell.get_or_init(|| {
            info!(
                input = %job.input.display(),
                variant = %variant.display(),
                backend = job.setting.backend.name(),
                "converting input"
            );
            job.setting
                .backend
                .prepare_input(&job.input, variant, ctx)
                .map_err(|e| e.to_string())
        });
        result.clone().map_err(SchedulerError::Input)
    }
}

/// State shared by every worker of one batch
struct Batch {
    info: Arc<dyn VideoInfo>,
    binaries: Binaries,
    timing: MonitorTiming,
    scratch: PathBuf,
    sampling: bool,
    preparer: InputPreparer,
    progress: Arc<BatchProgress>,
}

/// Runs batches of jobs
pub struct JobScheduler {
    info: Arc<dyn VideoInfo>,
    binaries: Binaries,
    timing: MonitorTiming,
    sample_interval: Option<Duration>,
    progress_every: Duration,
    scratch: PathBuf,
}

impl JobScheduler {
    pub fn new(info: Arc<dyn VideoInfo>, binaries: Binaries) -> Self {
        Self {
            info,
            binaries,
            timing: MonitorTiming::default(),
            sample_interval: None,
            progress_every: Duration::from_secs(10),
            scratch: std::env::temp_dir(),
        }
    }

    pub fn with_timing(mut self, timing: MonitorTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Sample CPU and memory of running jobs every `interval`
    pub fn with_sample_interval(mut self, interval: Option<Duration>) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Minimum gap between two aggregate progress lines
    pub fn with_progress_every(mut self, every: Duration) -> Self {
        self.progress_every = every;
        self
    }

    /// Directory for temporary files of input conversion
    pub fn with_scratch(mut self, scratch: impl Into<PathBuf>) -> Self {
        self.scratch = scratch.into();
        self
    }

    /// Run every job and wait until each one is finished.
    ///
    /// At most `ceiling` jobs run at once; the concurrency policy of each
    /// job's setting caps that setting's share.
    pub async fn run(&self, jobs: Vec<Arc<Job>>, ceiling: usize) -> RunSummary {
        let started = Instant::now();
        let ceiling = ceiling.max(1);
        info!(jobs = jobs.len(), ceiling, "starting batch");

        let sampler = self.sample_interval.and_then(|interval| {
            match UsageSampler::spawn(interval) {
                Ok(sampler) => Some(sampler),
                Err(e) => {
                    warn!(error = %e, "could not start usage sampler, running without it");
                    None
                }
            }
        });
        if let Some(sampler) = &sampler {
            for job in &jobs {
                sampler.register(job.clone());
            }
        }

        let batch = Arc::new(Batch {
            info: self.info.clone(),
            binaries: self.binaries.clone(),
            timing: self.timing,
            scratch: self.scratch.clone(),
            sampling: sampler.is_some(),
            preparer: InputPreparer::default(),
            progress: Arc::new(BatchProgress::new(jobs.clone(), self.progress_every)),
        });

        let global = Arc::new(Semaphore::new(ceiling));
        let mut per_setting: HashMap<String, Arc<Semaphore>> = HashMap::new();
        let mut elapsed = vec![Duration::ZERO; jobs.len()];
        let mut tasks = JoinSet::new();

        for (index, job) in jobs.iter().enumerate() {
            let limit = per_setting
                .entry(job.setting.name.clone())
                .or_insert_with(|| {
                    let permits = job.setting.concurrency.resolve().min(ceiling);
                    debug!(setting = %job.setting.name, permits, "setting concurrency");
                    Arc::new(Semaphore::new(permits))
                })
                .clone();
            let global = global.clone();
            let batch = batch.clone();
            let job = job.clone();

            tasks.spawn(async move {
                let _setting_permit = limit.acquire_owned().await;
                let _permit = global.acquire_owned().await;
                let job_started = Instant::now();

                let worker_job = job.clone();
                let result = tokio::task::spawn_blocking(move || run_job(&worker_job, &batch)).await;
                if let Err(e) = result {
                    let message = if e.is_panic() {
                        panic_message(e.into_panic())
                    } else {
                        e.to_string()
                    };
                    let err = SchedulerError::Panicked(message);
                    error!(job_id = %job.short_id(), error = %err, "job worker died");
                    job.force_outcome(JobOutcome::Failed(err.to_string()));
                }
                (index, job_started.elapsed())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, took)) => elapsed[index] = took,
                Err(e) => error!(error = %e, "scheduler task failed"),
            }
        }

        if let Some(sampler) = sampler {
            sampler.stop();
        }

        let reports = jobs
            .iter()
            .zip(elapsed)
            .map(|(job, took)| {
                if job.status().outcome.is_none() {
                    job.force_outcome(JobOutcome::Failed("job ended without an outcome".into()));
                }
                job.mark_finished();
                detach_log(job);
                JobReport::from_job(job, took)
            })
            .collect();

        let summary = RunSummary::new(reports, started.elapsed());
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "batch finished in {:.1}s",
            summary.elapsed_secs
        );
        summary
    }
}

/// Run one job on a blocking worker, from recorder start to terminal outcome
fn run_job(job: &Arc<Job>, batch: &Batch) {
    let (sink, recorder) = match StatusRecorder::spawn(job.clone(), Some(batch.progress.clone())) {
        Ok(pair) => pair,
        Err(e) => {
            error!(job_id = %job.short_id(), error = %e, "could not start status recorder");
            job.force_outcome(JobOutcome::Failed(format!("could not start status recorder: {}", e)));
            return;
        }
    };

    debug!(job_id = %job.short_id(), output = %job.output.display(), "job started");
    let result = execute(job, batch, &sink);

    sink.state(WorkflowState::Finished);
    match &result {
        Ok(()) => sink.outcome(JobOutcome::Succeeded),
        Err(e) => sink.outcome(JobOutcome::Failed(e.to_string())),
    }
    drop(sink);
    recorder.join(batch.timing.join_timeout);
    job.mark_finished();

    match result {
        Ok(()) => info!(job_id = %job.short_id(), output = %job.output.display(), "job succeeded"),
        Err(e) => warn!(job_id = %job.short_id(), error = %e, "job failed"),
    }
}

fn execute(job: &Job, batch: &Batch, sink: &StatusSink) -> Result<(), SchedulerError> {
    create_dir(job.output_dir())?;

    let check_ctx = CheckContext {
        info: batch.info.as_ref(),
        binaries: &batch.binaries,
        scratch: &batch.scratch,
    };
    batch.preparer.ensure(job, &check_ctx)?;

    if batch.sampling {
        if let Err(e) = attach_log(job) {
            warn!(
                job_id = %job.short_id(),
                path = %job.usage_log_path().display(),
                error = %e,
                "could not create usage log, job runs unsampled"
            );
        }
    }

    let ctx = JobContext {
        sink,
        info: batch.info.as_ref(),
        binaries: &batch.binaries,
        timing: batch.timing,
    };
    job.setting.backend.start(job, &ctx)?;
    Ok(())
}

fn create_dir(path: &Path) -> Result<(), SchedulerError> {
    fs::create_dir_all(path).map_err(|source| SchedulerError::Io {
        context: format!("could not create {}", path.display()),
        source,
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Capabilities, CheckTarget, EncoderBackend};
    use crate::concurrency::ConcurrencyPolicy;
    use crate::probe::{Framerate, VideoMetadata};
    use crate::setting::TranscodeSetting;
    use crate::test_support::StaticInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// Tracks how many jobs run at once
    #[derive(Debug, Default)]
    struct CountingBackend {
        running: AtomicUsize,
        peak: AtomicUsize,
        prepared: AtomicUsize,
        native_only: bool,
    }

    impl EncoderBackend for CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                writes_container: true,
                bitstream_extension: "mkv",
                native_inputs: if self.native_only { &["yuv"] } else { &[] },
            }
        }

        fn prepare_input(
            &self,
            input: &Path,
            _variant: &Path,
            _ctx: &CheckContext<'_>,
        ) -> Result<(), BackendError> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            if input.to_string_lossy().contains("broken") {
                return Err(BackendError::UnsupportedPixelFormat("gbrp".into()));
            }
            Ok(())
        }

        fn start(&self, job: &Job, ctx: &JobContext<'_>) -> Result<(), BackendError> {
            ctx.sink.state(WorkflowState::Running);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            self.running.fetch_sub(1, Ordering::SeqCst);
            match job.args.first().map(String::as_str) {
                Some("fail") => Err(BackendError::MissingPath("encoded")),
                Some("panic") => panic!("encoder exploded"),
                _ => Ok(()),
            }
        }

        fn check_arguments(
            &self,
            _setting: &TranscodeSetting,
            _args: &[String],
            _target: CheckTarget<'_>,
            _ctx: &CheckContext<'_>,
        ) -> Result<(), String> {
            Ok(())
        }
    }

    fn scheduler() -> JobScheduler {
        let info = StaticInfo(VideoMetadata {
            duration_secs: 1.0,
            framerate: Framerate { num: 25, den: 1 },
            width: 16,
            height: 16,
            pix_fmt: "yuv420p".to_string(),
        });
        JobScheduler::new(Arc::new(info), Binaries::default())
    }

    fn setting(
        name: &str,
        backend: &Arc<CountingBackend>,
        concurrency: ConcurrencyPolicy,
        root: &Path,
    ) -> Arc<TranscodeSetting> {
        Arc::new(
            TranscodeSetting::new(name, backend.clone(), "encoder")
                .with_concurrency(concurrency)
                .with_output_dir(root.join(name)),
        )
    }

    fn jobs(setting: &Arc<TranscodeSetting>, count: usize) -> Vec<Arc<Job>> {
        (0..count)
            .map(|i| {
                let output = setting.output_dir.join(format!("clip_{}.mkv", i));
                Arc::new(Job::new("/in/clip.mkv", Vec::new(), output, setting.clone()))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_setting_policy_caps_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(CountingBackend::default());
        let setting = setting("par", &backend, ConcurrencyPolicy::Parallel(2), dir.path());

        let summary = scheduler().run(jobs(&setting, 6), 4).await;

        assert_eq!(summary.total, 6);
        assert!(summary.all_succeeded());
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
        assert!(dir.path().join("par").is_dir());
    }

    #[tokio::test]
    async fn test_serial_setting_runs_one_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(CountingBackend::default());
        let setting = setting("serial", &backend, ConcurrencyPolicy::Serial, dir.path());

        let summary = scheduler().run(jobs(&setting, 3), 8).await;

        assert_eq!(summary.succeeded, 3);
        assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(CountingBackend::default());
        let setting = setting("mixed", &backend, ConcurrencyPolicy::Parallel(4), dir.path());
        let jobs: Vec<Arc<Job>> = ["ok", "fail", "panic", "ok"]
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                let output = setting.output_dir.join(format!("clip_{}.mkv", i));
                Arc::new(Job::new(
                    "/in/clip.mkv",
                    vec![arg.to_string()],
                    output,
                    setting.clone(),
                ))
            })
            .collect();

        let summary = scheduler().run(jobs.clone(), 4).await;

        assert_eq!(summary.total, 4);
        assert_eq!(summary.failed, 2);
        assert!(summary.jobs[0].outcome.is_success());
        assert_eq!(
            summary.jobs[1].outcome,
            JobOutcome::Failed("job has no encoded path".to_string())
        );
        match &summary.jobs[2].outcome {
            JobOutcome::Failed(message) => assert!(message.contains("encoder exploded")),
            JobOutcome::Succeeded => panic!("panicking job reported success"),
        }
        assert!(summary.jobs[3].outcome.is_success());
        for job in &jobs {
            assert!(job.is_finished());
            assert_eq!(job.pid(), None);
            assert_eq!(job.state(), WorkflowState::Finished);
        }
    }

    #[tokio::test]
    async fn test_history_ends_finished() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(CountingBackend::default());
        let setting = setting("hist", &backend, ConcurrencyPolicy::Serial, dir.path());
        let jobs = jobs(&setting, 1);

        let summary = scheduler().run(jobs.clone(), 1).await;

        assert_eq!(
            summary.jobs[0].states,
            vec![
                WorkflowState::Waiting,
                WorkflowState::Running,
                WorkflowState::Finished
            ]
        );
        assert_eq!(summary.jobs[0].outcome, JobOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_shared_variant_is_prepared_once() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(CountingBackend {
            native_only: true,
            ..Default::default()
        });
        let setting = setting("raw", &backend, ConcurrencyPolicy::Parallel(3), dir.path());
        let variant = dir.path().join("inputs").join("clip.yuv");
        let broken_variant = dir.path().join("inputs").join("broken.yuv");
        let mut batch: Vec<Arc<Job>> = (0..3)
            .map(|i| {
                Arc::new(
                    Job::new(
                        "/in/clip.mkv",
                        Vec::new(),
                        setting.output_dir.join(format!("clip_{}.mkv", i)),
                        setting.clone(),
                    )
                    .with_input_variant(&variant),
                )
            })
            .collect();
        batch.push(Arc::new(
            Job::new(
                "/in/broken.mkv",
                Vec::new(),
                setting.output_dir.join("broken.mkv"),
                setting.clone(),
            )
            .with_input_variant(&broken_variant),
        ));

        let summary = scheduler().run(batch, 3).await;

        assert_eq!(backend.prepared.load(Ordering::SeqCst), 2);
        assert_eq!(summary.succeeded, 3);
        match &summary.jobs[3].outcome {
            JobOutcome::Failed(message) => {
                assert!(message.starts_with("input conversion failed"))
            }
            JobOutcome::Succeeded => panic!("broken input reported success"),
        }
        assert_eq!(
            summary.jobs[3].states,
            vec![WorkflowState::Waiting, WorkflowState::Finished]
        );
    }

    #[tokio::test]
    async fn test_sampling_writes_usage_log() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(CountingBackend::default());
        let setting = setting("sampled", &backend, ConcurrencyPolicy::Serial, dir.path());
        let jobs = jobs(&setting, 1);

        let summary = scheduler()
            .with_sample_interval(Some(Duration::from_millis(10)))
            .run(jobs.clone(), 1)
            .await;

        assert!(summary.all_succeeded());
        let log = fs::read_to_string(jobs[0].usage_log_path()).unwrap();
        assert!(log.starts_with("time,bias_time,state"));
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic");
    }
}
