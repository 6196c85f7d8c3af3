//! Status event channel
//!
//! Monitors, backends and the pass controller never touch a job's status
//! directly. They send [`StatusEvent`]s through a [`StatusSink`]; one recorder
//! thread per job owns the writes and applies events in arrival order. The
//! recorder stops after the terminal outcome.

use crate::job::{Job, JobOutcome, StatusEvent, WorkflowState};
use crate::process::join_with_timeout;
use crate::report::BatchProgress;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Sending half of a job's status channel
#[derive(Debug, Clone)]
pub struct StatusSink {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl StatusSink {
    /// A sink whose events go nowhere
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn send(&self, event: StatusEvent) {
        if let Err(e) = self.tx.send(event) {
            trace!(event = ?e.0, "status recorder gone, dropping event");
        }
    }

    pub fn record(&self, key: impl Into<String>, value: impl Into<String>) {
        self.send(StatusEvent::Record {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn progress(&self, perc: f64) {
        self.send(StatusEvent::Progress(perc));
    }

    pub fn state(&self, state: WorkflowState) {
        self.send(StatusEvent::State(state));
    }

    pub fn outcome(&self, outcome: JobOutcome) {
        self.send(StatusEvent::Outcome(outcome));
    }
}

/// Handle to a job's recorder thread
#[derive(Debug)]
pub struct StatusRecorder {
    handle: JoinHandle<()>,
}

impl StatusRecorder {
    /// Start the recorder for `job`. State and progress changes are reported
    /// to `observer` when given.
    pub fn spawn(
        job: Arc<Job>,
        observer: Option<Arc<BatchProgress>>,
    ) -> io::Result<(StatusSink, StatusRecorder)> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = thread::Builder::new()
            .name(format!("status-{}", job.short_id()))
            .spawn(move || {
                while let Some(event) = rx.blocking_recv() {
                    let terminal = matches!(event, StatusEvent::Outcome(_));
                    let changed = job.apply(event);
                    if changed {
                        if let Some(observer) = &observer {
                            observer.observe();
                        }
                    }
                    if terminal {
                        break;
                    }
                }
            })?;
        Ok((StatusSink { tx }, StatusRecorder { handle }))
    }

    /// Wait until every event up to the outcome has been applied
    pub fn join(self, timeout: Duration) {
        if !join_with_timeout(self.handle, timeout) {
            warn!("status recorder did not finish, detaching it");
        }
    }
}
