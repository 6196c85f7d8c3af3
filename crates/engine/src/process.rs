//! External process plumbing
//!
//! Every program the engine runs is spawned through this module. The one
//! non-trivial piece is the status side channel: ffmpeg-style encoders report
//! progress through `-progress pipe:<fd>`, which needs a pipe whose write end is
//! inherited by exactly one child.
//!
//! On Unix the pipe is created close-on-exec. Its write end is made inheritable
//! only while the child is being spawned, under a process-wide spawn lock, so
//! concurrently spawned siblings never receive another job's descriptor. The
//! parent keeps its copy of the write end until the [`StopHook`] fires, which is
//! what unblocks a reader whose child died without closing the stream.
//!
//! Elsewhere the status stream rides on the child's stdout (`pipe:1`).

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Discard sink understood by ffmpeg and the VVC tools
pub const NULL_SINK: &str = if cfg!(windows) { "NUL" } else { "/dev/null" };

/// Lines of combined stdout/stderr kept per process for diagnostics
pub const TAIL_LINES: usize = 200;

pub(crate) static SPAWN_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Error type for process operations
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("status pipe setup failed: {0}")]
    Pipe(#[source] io::Error),

    #[error("`{command}` failed with {}\nProgram output:\n{output}", describe_exit(.code))]
    Failed {
        command: String,
        code: Option<i32>,
        output: String,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "termination by signal".to_string(),
    }
}

/// A program and its arguments, kept as strings so it can be logged verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Bounded buffer of the last output lines of a process
#[derive(Debug)]
pub struct OutputTail {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        })
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    pub fn contents(&self) -> String {
        let lines = self.lines.lock();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Releases the parent's copy of a status pipe write end.
///
/// Cloned into both the reader and the process handle; the first `stop`
/// closes the descriptor, later calls do nothing.
#[derive(Debug, Clone, Default)]
pub struct StopHook {
    #[cfg(unix)]
    writer: Arc<Mutex<Option<OwnedFd>>>,
}

impl StopHook {
    #[cfg(unix)]
    fn holding(writer: OwnedFd) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Some(writer))),
        }
    }

    /// Returns true if a descriptor was closed by this call
    #[cfg(unix)]
    pub fn stop(&self) -> bool {
        self.writer.lock().take().is_some()
    }

    #[cfg(not(unix))]
    pub fn stop(&self) -> bool {
        false
    }
}

/// Readable end of a child's status stream
pub struct StatusStream {
    reader: Box<dyn BufRead + Send>,
    stop: StopHook,
}

impl StatusStream {
    pub fn new(reader: impl Read + Send + 'static, stop: StopHook) -> Self {
        Self {
            reader: Box::new(BufReader::new(reader)),
            stop,
        }
    }

    pub fn stop_hook(&self) -> StopHook {
        self.stop.clone()
    }

    pub fn into_parts(self) -> (Box<dyn BufRead + Send>, StopHook) {
        (self.reader, self.stop)
    }
}

/// Exit status plus the tail of everything the process printed
#[derive(Debug)]
pub struct ExitReport {
    pub command: CommandLine,
    pub status: ExitStatus,
    pub output: String,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Turn a nonzero exit into [`ProcessError::Failed`]
    pub fn into_result(self) -> Result<Self, ProcessError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ProcessError::Failed {
                command: self.command.to_string(),
                code: self.status.code(),
                output: self.output,
            })
        }
    }
}

/// A running child whose stdout/stderr are drained in the background
pub struct MonitoredChild {
    child: Child,
    command: CommandLine,
    tail: Arc<OutputTail>,
    drains: Vec<JoinHandle<()>>,
}

impl MonitoredChild {
    fn new(child: Child, command: CommandLine) -> Self {
        Self {
            child,
            command,
            tail: OutputTail::new(TAIL_LINES),
            drains: Vec::new(),
        }
    }

    fn drain_stdout(&mut self) {
        if let Some(stdout) = self.child.stdout.take() {
            self.spawn_drain("stdout", stdout);
        }
    }

    fn drain_stderr(&mut self) {
        if let Some(stderr) = self.child.stderr.take() {
            self.spawn_drain("stderr", stderr);
        }
    }

    fn spawn_drain<R: Read + Send + 'static>(&mut self, stream: &str, reader: R) {
        let tail = self.tail.clone();
        let spawned = thread::Builder::new()
            .name(format!("drain-{}-{}", stream, self.child.id()))
            .spawn(move || {
                for_each_line(BufReader::new(reader), |line| {
                    tail.push(line);
                    true
                });
            });
        match spawned {
            Ok(handle) => self.drains.push(handle),
            Err(e) => warn!(pid = self.child.id(), error = %e, "could not start output drain"),
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    pub fn tail(&self) -> Arc<OutputTail> {
        self.tail.clone()
    }

    /// Wait for exit, then give the drain threads `drain_timeout` to finish
    pub fn wait(mut self, drain_timeout: Duration) -> Result<ExitReport, ProcessError> {
        let status = self.child.wait().map_err(|source| ProcessError::Wait {
            command: self.command.to_string(),
            source,
        })?;
        for handle in self.drains.drain(..) {
            if !join_with_timeout(handle, drain_timeout) {
                warn!(command = %self.command, "output drain still blocked, detaching it");
            }
        }
        debug!(command = %self.command, ?status, "process exited");
        Ok(ExitReport {
            command: self.command,
            status,
            output: self.tail.contents(),
        })
    }
}

/// Read `reader` line by line, lossily decoding, until EOF, a read error, or
/// `f` returns false.
pub(crate) fn for_each_line<R, F>(mut reader: R, mut f: F)
where
    R: BufRead,
    F: FnMut(&str) -> bool,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                if !f(line.trim_end_matches(['\r', '\n'])) {
                    break;
                }
            }
        }
    }
}

/// Join `handle` if it finishes within `timeout`; otherwise detach it.
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        warn!("background reader panicked");
    }
    true
}

fn spawn_error(command: &CommandLine, source: io::Error) -> ProcessError {
    ProcessError::Spawn {
        command: command.to_string(),
        source,
    }
}

fn piped(command: &mut Command) -> &mut Command {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
}

fn spawn_locked(command: &mut Command, line: &CommandLine) -> Result<Child, ProcessError> {
    let _guard = SPAWN_LOCK.lock();
    command.spawn().map_err(|source| spawn_error(line, source))
}

/// Spawn with stdout and stderr drained into the output tail
pub fn spawn_drained(line: CommandLine) -> Result<MonitoredChild, ProcessError> {
    let mut command = line.to_command();
    let child = spawn_locked(piped(&mut command), &line)?;
    let mut monitored = MonitoredChild::new(child, line);
    monitored.drain_stdout();
    monitored.drain_stderr();
    Ok(monitored)
}

/// Spawn with stdout as the status stream and stderr drained
pub fn spawn_with_stdout_status(
    line: CommandLine,
) -> Result<(MonitoredChild, StatusStream), ProcessError> {
    let mut command = line.to_command();
    let mut child = spawn_locked(piped(&mut command), &line)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProcessError::Pipe(io::Error::other("child stdout not captured")))?;
    let mut monitored = MonitoredChild::new(child, line);
    monitored.drain_stderr();
    Ok((monitored, StatusStream::new(stdout, StopHook::default())))
}

/// Spawn `program` with a dedicated status pipe.
///
/// `build_args` receives the progress target to hand to the program
/// (`pipe:<fd>`) and returns the full argument list.
#[cfg(unix)]
pub fn spawn_with_side_channel<F>(
    program: &str,
    build_args: F,
) -> Result<(MonitoredChild, StatusStream), ProcessError>
where
    F: FnOnce(&str) -> Vec<String>,
{
    let guard = SPAWN_LOCK.lock();
    let (reader, writer) = io::pipe().map_err(ProcessError::Pipe)?;
    let writer = OwnedFd::from(writer);
    let fd = writer.as_raw_fd();
    let line = CommandLine::new(program).args(build_args(&format!("pipe:{}", fd)));

    set_close_on_exec(fd, false)?;
    let mut command = line.to_command();
    let spawned = piped(&mut command).spawn();
    let restored = set_close_on_exec(fd, true);
    drop(guard);

    let child = spawned.map_err(|source| spawn_error(&line, source))?;
    if let Err(e) = restored {
        warn!(fd, error = %e, "status pipe left inheritable");
    }

    let mut monitored = MonitoredChild::new(child, line);
    monitored.drain_stdout();
    monitored.drain_stderr();
    Ok((monitored, StatusStream::new(reader, StopHook::holding(writer))))
}

#[cfg(not(unix))]
pub fn spawn_with_side_channel<F>(
    program: &str,
    build_args: F,
) -> Result<(MonitoredChild, StatusStream), ProcessError>
where
    F: FnOnce(&str) -> Vec<String>,
{
    spawn_with_stdout_status(CommandLine::new(program).args(build_args("pipe:1")))
}

#[cfg(unix)]
fn set_close_on_exec(fd: RawFd, enabled: bool) -> Result<(), ProcessError> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let flags = if enabled {
        FdFlag::FD_CLOEXEC
    } else {
        FdFlag::empty()
    };
    fcntl(fd, FcntlArg::F_SETFD(flags))
        .map(|_| ())
        .map_err(|errno| ProcessError::Pipe(errno.into()))
}

/// Spawn `producer | consumer`. The producer's stderr and both consumer
/// streams are drained.
pub fn spawn_pipeline(
    producer: CommandLine,
    consumer: CommandLine,
) -> Result<(MonitoredChild, MonitoredChild), ProcessError> {
    let guard = SPAWN_LOCK.lock();
    let mut upstream = producer.to_command();
    let mut first = piped(&mut upstream)
        .spawn()
        .map_err(|source| spawn_error(&producer, source))?;
    let Some(stdout) = first.stdout.take() else {
        drop(guard);
        abandon(&mut first);
        return Err(ProcessError::Pipe(io::Error::other("producer stdout not captured")));
    };

    let mut downstream = consumer.to_command();
    downstream
        .stdin(Stdio::from(stdout))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let second = match downstream.spawn() {
        Ok(child) => child,
        Err(source) => {
            drop(guard);
            abandon(&mut first);
            return Err(spawn_error(&consumer, source));
        }
    };
    drop(guard);
    drop(downstream);

    let mut producer = MonitoredChild::new(first, producer);
    producer.drain_stderr();
    let mut consumer = MonitoredChild::new(second, consumer);
    consumer.drain_stdout();
    consumer.drain_stderr();
    Ok((producer, consumer))
}

/// Kill and reap a half-started pipeline member
fn abandon(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(pid = child.id(), error = %e, "kill of abandoned process failed");
    }
    let _ = child.wait();
}

/// Run to completion, capturing stdout and stderr
pub fn run_captured(line: &CommandLine) -> Result<Output, ProcessError> {
    let mut command = line.to_command();
    let child = spawn_locked(piped(&mut command), line)?;
    child.wait_with_output().map_err(|source| ProcessError::Wait {
        command: line.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_command_line_display() {
        let line = CommandLine::new("ffmpeg")
            .arg("-i")
            .arg_path(Path::new("/videos/in.mkv"))
            .args(["-c:v", "libx264"]);
        assert_eq!(line.to_string(), "ffmpeg -i /videos/in.mkv -c:v libx264");
        assert_eq!(line.program(), "ffmpeg");
        assert_eq!(line.arguments().len(), 4);
    }

    #[test]
    fn test_output_tail_keeps_last_lines() {
        let tail = OutputTail::new(3);
        for i in 0..5 {
            tail.push(format!("line {}", i));
        }
        assert_eq!(tail.contents(), "line 2\nline 3\nline 4");
    }

    #[test]
    fn test_for_each_line_handles_invalid_utf8_and_crlf() {
        let data: &[u8] = b"frame=1\r\n\xffbad\nlast";
        let mut lines = Vec::new();
        for_each_line(Cursor::new(data), |line| {
            lines.push(line.to_string());
            true
        });
        assert_eq!(lines, vec!["frame=1", "\u{fffd}bad", "last"]);
    }

    #[test]
    fn test_for_each_line_stops_when_asked() {
        let mut seen = 0;
        for_each_line(Cursor::new("a\nb\nc\n"), |_| {
            seen += 1;
            seen < 2
        });
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_join_with_timeout() {
        let quick = thread::spawn(|| {});
        assert!(join_with_timeout(quick, Duration::from_secs(2)));

        let slow = thread::spawn(|| thread::sleep(Duration::from_millis(500)));
        assert!(!join_with_timeout(slow, Duration::from_millis(30)));
    }

    #[test]
    fn test_failed_exit_message() {
        let err = ProcessError::Failed {
            command: "enc -x".to_string(),
            code: Some(3),
            output: "boom".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("`enc -x` failed with exit code 3"));
        assert!(message.ends_with("boom"));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        #[test]
        fn test_side_channel_carries_status_lines() {
            let script = r#"fd="${1#pipe:}"; printf 'frame=1\nprogress=end\n' > "/dev/fd/$fd"; echo done"#;
            let (child, stream) = spawn_with_side_channel("/bin/sh", |target| {
                vec![
                    "-c".to_string(),
                    script.to_string(),
                    "sh".to_string(),
                    target.to_string(),
                ]
            })
            .unwrap();
            assert!(child.command().to_string().contains("pipe:"));

            let report = child.wait(Duration::from_secs(2)).unwrap();
            assert!(report.success());
            assert_eq!(report.output, "done");

            let (reader, stop) = stream.into_parts();
            // the parent still holds the write end until the hook fires
            assert!(stop.stop());
            assert!(!stop.stop());

            let mut lines = Vec::new();
            for_each_line(reader, |line| {
                lines.push(line.to_string());
                true
            });
            assert_eq!(lines, vec!["frame=1", "progress=end"]);
        }

        #[test]
        fn test_nonzero_exit_carries_output() {
            let line = CommandLine::new("/bin/sh").args(["-c", "echo boom >&2; exit 3"]);
            let report = spawn_drained(line).unwrap().wait(Duration::from_secs(2)).unwrap();
            match report.into_result() {
                Err(ProcessError::Failed { code, output, .. }) => {
                    assert_eq!(code, Some(3));
                    assert_eq!(output, "boom");
                }
                other => panic!("expected failure, got {:?}", other),
            }
        }

        #[test]
        fn test_missing_program_is_spawn_error() {
            let err = spawn_drained(CommandLine::new("/nonexistent/encoder")).err();
            assert!(matches!(err, Some(ProcessError::Spawn { .. })));
        }

        #[test]
        fn test_stdout_status_stream() {
            let line = CommandLine::new("/bin/sh").args(["-c", "echo POC 0; echo POC 1"]);
            let (child, stream) = spawn_with_stdout_status(line).unwrap();
            let (reader, _) = stream.into_parts();
            let mut lines = Vec::new();
            for_each_line(reader, |line| {
                lines.push(line.to_string());
                true
            });
            assert!(child.wait(Duration::from_secs(2)).unwrap().success());
            assert_eq!(lines, vec!["POC 0", "POC 1"]);
        }

        #[test]
        fn test_pipeline_connects_producer_to_consumer() {
            let producer = CommandLine::new("/bin/sh").args(["-c", "printf 'abc\\n'"]);
            let consumer = CommandLine::new("cat");
            let (first, second) = spawn_pipeline(producer, consumer).unwrap();
            assert!(first.wait(Duration::from_secs(2)).unwrap().success());
            let report = second.wait(Duration::from_secs(2)).unwrap();
            assert!(report.success());
            assert_eq!(report.output, "abc");
        }

        #[test]
        fn test_abandon_reaps_running_child() {
            let mut child = Command::new("sleep").arg("30").spawn().unwrap();
            abandon(&mut child);
            assert!(child.try_wait().unwrap().is_some());
        }

        #[test]
        fn test_pipeline_consumer_failure_stops_producer() {
            let producer = CommandLine::new("sleep").arg("30");
            let started = Instant::now();
            let err = spawn_pipeline(producer, CommandLine::new("/nonexistent/decoder")).err();
            assert!(matches!(err, Some(ProcessError::Spawn { .. })));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[test]
        fn test_run_captured() {
            let output = run_captured(&CommandLine::new("/bin/sh").args(["-c", "echo hi"])).unwrap();
            assert!(output.status.success());
            assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hi");
        }
    }
}
