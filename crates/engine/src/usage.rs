//! Resource usage sampling
//!
//! One background thread wakes on a fixed wall-clock cadence and appends a CSV
//! row for every registered job that currently has a live process. When the
//! thread wakes far too late (machine suspended, heavy contention) the missed
//! time is added to each live job's bias instead of emitting backlog ticks, so
//! sample times stay comparable between runs.

use crate::job::{Job, WorkflowState};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

pub const USAGE_HEADER: &str = "time,bias_time,state,cpu_time_user,cpu_time_system,\
cpu_time_children_user,cpu_time_children_system,cpu_time_iowait,cpu_percent,RSS,VMS";

/// Clock ticks per second used by `/proc/<pid>/stat`
const USER_HZ: f64 = 100.0;

/// Time since the Unix epoch. Keeps counting across suspend, unlike
/// `Instant` on some platforms.
pub fn wall_clock() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Offset of a sample from the job's first launch, corrected by its bias
pub fn sample_time(now: Duration, started_at: Duration, bias: Duration) -> Duration {
    now.saturating_sub(started_at).saturating_sub(bias)
}

/// CPU times in seconds
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CpuTimes {
    pub user: f64,
    pub system: f64,
    pub children_user: f64,
    pub children_system: f64,
    pub iowait: f64,
}

/// Parse the contents of `/proc/<pid>/stat`.
///
/// The command name may contain spaces and parentheses, so fields are counted
/// from the last `)`.
pub fn parse_proc_stat(content: &str) -> Option<CpuTimes> {
    let (_, rest) = content.rsplit_once(')')?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let ticks = |idx: usize| -> Option<f64> {
        fields
            .get(idx)
            .and_then(|f| f.parse::<f64>().ok())
            .map(|t| t / USER_HZ)
    };
    Some(CpuTimes {
        user: ticks(11)?,
        system: ticks(12)?,
        children_user: ticks(13)?,
        children_system: ticks(14)?,
        // delayacct_blkio_ticks
        iowait: ticks(39).unwrap_or(0.0),
    })
}

#[cfg(target_os = "linux")]
fn read_cpu_times(pid: u32) -> CpuTimes {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|content| parse_proc_stat(&content))
        .unwrap_or_default()
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_times(_pid: u32) -> CpuTimes {
    CpuTimes::default()
}

/// One row of a usage log
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSample {
    pub time: Duration,
    pub bias: Duration,
    pub state: WorkflowState,
    pub cpu: CpuTimes,
    pub cpu_percent: f32,
    /// Bytes
    pub rss: u64,
    /// Bytes
    pub vms: u64,
}

impl UsageSample {
    pub fn csv_row(&self) -> String {
        format!(
            "{:.3},{:.3},{},{:.2},{:.2},{:.2},{:.2},{:.2},{:.1},{},{}",
            self.time.as_secs_f64(),
            self.bias.as_secs_f64(),
            self.state,
            self.cpu.user,
            self.cpu.system,
            self.cpu.children_user,
            self.cpu.children_system,
            self.cpu.iowait,
            self.cpu_percent,
            self.rss,
            self.vms
        )
    }
}

/// Per-job CSV file, `<output stem>_usage.log`
#[derive(Debug)]
pub struct UsageLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl UsageLog {
    /// Create the file and write the header
    pub fn create(path: &Path) -> io::Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{}", USAGE_HEADER)?;
        writer.flush()?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, sample: &UsageSample) -> io::Result<()> {
        writeln!(self.writer, "{}", sample.csv_row())?;
        self.writer.flush()
    }

    pub fn close(mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Open the job's usage log so the sampler can write to it
pub fn attach_log(job: &Job) -> io::Result<()> {
    let log = UsageLog::create(&job.usage_log_path())?;
    *job.usage_log().lock() = Some(log);
    Ok(())
}

/// Flush and close the job's usage log, if open
pub fn detach_log(job: &Job) {
    let log = job.usage_log().lock().take();
    if let Some(log) = log {
        if let Err(e) = log.close() {
            warn!(job_id = %job.short_id(), error = %e, "could not flush usage log");
        }
    }
}

/// Outcome of one timer tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    OnTime,
    /// The tick came more than one interval late; `gap` is the time beyond
    /// one interval since the previous target.
    Resynced { gap: Duration },
}

/// Fixed-rate schedule that skips instead of catching up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftClock {
    interval: Duration,
    next: Duration,
}

impl DriftClock {
    pub fn new(interval: Duration, now: Duration) -> Self {
        Self {
            interval,
            next: now + interval,
        }
    }

    pub fn next_target(&self) -> Duration {
        self.next
    }

    /// How long to sleep before the next tick
    pub fn wait_time(&self, now: Duration) -> Duration {
        self.next.saturating_sub(now)
    }

    pub fn tick(&mut self, now: Duration) -> Tick {
        let previous = self.next.saturating_sub(self.interval);
        let elapsed = now.saturating_sub(previous);
        if elapsed > self.interval * 2 {
            self.next = now + self.interval;
            Tick::Resynced {
                gap: elapsed - self.interval,
            }
        } else {
            self.next += self.interval;
            Tick::OnTime
        }
    }
}

type Registry = Arc<Mutex<Vec<Arc<Job>>>>;

/// Background usage sampler shared by every job of a run
pub struct UsageSampler {
    registry: Registry,
    shutdown: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl UsageSampler {
    pub fn spawn(interval: Duration) -> io::Result<Self> {
        let registry: Registry = Arc::new(Mutex::new(Vec::new()));
        let (shutdown, rx) = mpsc::channel();
        let shared = registry.clone();
        let handle = thread::Builder::new()
            .name("usage-sampler".to_string())
            .spawn(move || sampler_loop(interval, shared, rx))?;
        debug!(?interval, "usage sampler started");
        Ok(Self {
            registry,
            shutdown,
            handle,
        })
    }

    pub fn register(&self, job: Arc<Job>) {
        self.registry.lock().push(job);
    }

    /// Jobs currently tracked
    pub fn tracked(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn stop(self) {
        drop(self.shutdown);
        if self.handle.join().is_err() {
            warn!("usage sampler panicked");
        }
    }
}

fn sampler_loop(interval: Duration, registry: Registry, shutdown: mpsc::Receiver<()>) {
    let mut clock = DriftClock::new(interval, wall_clock());
    let mut system = System::new();
    loop {
        match shutdown.recv_timeout(clock.wait_time(wall_clock())) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = wall_clock();
        let tick = clock.tick(now);
        let jobs: Vec<Arc<Job>> = {
            let mut registry = registry.lock();
            registry.retain(|job| !job.is_finished());
            registry.clone()
        };

        if let Tick::Resynced { gap } = tick {
            debug!(?gap, "sampler woke late, adding gap to bias");
            for job in jobs.iter().filter(|job| job.started_at().is_some()) {
                job.add_bias(gap);
            }
        }

        for job in &jobs {
            sample_job(&mut system, job, now);
        }
    }
    debug!("usage sampler stopped");
}

fn sample_job(system: &mut System, job: &Job, now: Duration) {
    let (Some(pid), Some(started_at)) = (job.pid(), job.started_at()) else {
        return;
    };
    let bias = job.bias();

    let process_id = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[process_id]));
    let (cpu_percent, rss, vms) = system
        .process(process_id)
        .map(|p| (p.cpu_usage(), p.memory(), p.virtual_memory()))
        .unwrap_or_default();

    let sample = UsageSample {
        time: sample_time(now, started_at, bias),
        bias,
        state: job.state(),
        cpu: read_cpu_times(pid),
        cpu_percent,
        rss,
        vms,
    };

    let mut log = job.usage_log().lock();
    if let Some(log) = log.as_mut() {
        match log.append(&sample) {
            Ok(()) => job.count_sample(),
            Err(e) => warn!(job_id = %job.short_id(), path = %log.path().display(), error = %e, "usage log write failed"),
        }
    }
}
