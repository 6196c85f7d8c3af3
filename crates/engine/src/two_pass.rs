//! Two-pass control flow
//!
//! `waiting -> first pass -> second pass` for two-pass encodes and
//! `waiting -> running` otherwise. Each pass is a full process launch; the
//! next pass starts only after the previous one succeeded. The terminal
//! `finished` state belongs to the worker, which records it after the last
//! process exited.

use crate::backend::BackendError;
use crate::job::WorkflowState;
use crate::status::StatusSink;
use tracing::debug;

/// One encoder launch within a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Single,
    First,
    Second,
}

impl Pass {
    pub fn state(self) -> WorkflowState {
        match self {
            Pass::Single => WorkflowState::Running,
            Pass::First => WorkflowState::FirstPass,
            Pass::Second => WorkflowState::SecondPass,
        }
    }

    /// Pass number handed to the encoder, if any
    pub fn number(self) -> Option<u8> {
        match self {
            Pass::Single => None,
            Pass::First => Some(1),
            Pass::Second => Some(2),
        }
    }
}

/// Drives the passes of one job in order
#[derive(Debug)]
pub struct TwoPassController<'a> {
    sink: &'a StatusSink,
    two_pass: bool,
}

impl<'a> TwoPassController<'a> {
    pub fn new(sink: &'a StatusSink, two_pass: bool) -> Self {
        Self { sink, two_pass }
    }

    pub fn passes(&self) -> &'static [Pass] {
        if self.two_pass {
            &[Pass::First, Pass::Second]
        } else {
            &[Pass::Single]
        }
    }

    /// Run `launch` for every pass, publishing the pass state first.
    /// Stops at the first failing pass.
    pub fn run<F>(&self, mut launch: F) -> Result<(), BackendError>
    where
        F: FnMut(Pass) -> Result<(), BackendError>,
    {
        for &pass in self.passes() {
            debug!(?pass, "starting pass");
            self.sink.state(pass.state());
            launch(pass)?;
        }
        Ok(())
    }
}
