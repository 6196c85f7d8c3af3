//! Parameter sweeps
//!
//! A sweep is a declarative description of the values one encoder option takes
//! across an experiment: an arithmetic progression (`add`), evenly spaced values
//! (`lin`), geometrically spaced values (`log`) or an explicit list (`list`).
//! All validation happens at construction so that a malformed sweep never
//! reaches job creation.

use crate::config::{ListValue, SweepSpec};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Decimal places kept for non-integral values unless configured otherwise
pub const DEFAULT_PRECISION: usize = 2;

/// Relative tolerance used when deciding whether `stop` was reached
const STOP_TOLERANCE: f64 = 1e-9;

/// Upper bound on the values a single sweep may produce
pub const MAX_SWEEP_VALUES: usize = 10_000;

/// Error type for sweep construction
#[derive(Debug, Error, PartialEq)]
pub enum SweepError {
    #[error("unknown sweep mode '{0}' (expected add, lin, log or list)")]
    UnknownMode(String),

    #[error("sweep mode '{mode}' requires {field}")]
    MissingField { mode: SweepMode, field: &'static str },

    #[error("step {step} cannot reach {stop} from {start}")]
    UnreachableStop { start: f64, stop: f64, step: f64 },

    #[error("value count must be a positive integer, got {0}")]
    InvalidCount(f64),

    #[error("log sweep bounds must be non-zero and share a sign, got {start} and {stop}")]
    InvalidLogBounds { start: f64, stop: f64 },

    #[error("sweep would produce {0} values, more than the limit of 10000")]
    TooManyValues(f64),

    #[error("list sweep has no values")]
    EmptyList,
}

/// Value generation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    Add,
    Lin,
    Log,
    List,
}

impl SweepMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepMode::Add => "add",
            SweepMode::Lin => "lin",
            SweepMode::Log => "log",
            SweepMode::List => "list",
        }
    }
}

impl fmt::Display for SweepMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SweepMode {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "add" => Ok(SweepMode::Add),
            "lin" => Ok(SweepMode::Lin),
            "log" => Ok(SweepMode::Log),
            "list" => Ok(SweepMode::List),
            _ => Err(SweepError::UnknownMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Source {
    Range { start: f64, stop: f64, step: f64 },
    List(Vec<String>),
}

/// One swept option value
#[derive(Debug, Clone, PartialEq)]
pub struct SweepParameter {
    mode: SweepMode,
    source: Source,
    prefix: String,
    suffix: String,
    separate: bool,
    precision: usize,
}

impl SweepParameter {
    /// Create a numeric sweep.
    ///
    /// For `lin` and `log` the `step` is the number of values to produce.
    pub fn numeric(
        mode: SweepMode,
        start: f64,
        stop: Option<f64>,
        step: Option<f64>,
    ) -> Result<Self, SweepError> {
        if mode == SweepMode::List {
            return Err(SweepError::MissingField {
                mode,
                field: "a value list",
            });
        }
        let stop = stop.ok_or(SweepError::MissingField {
            mode,
            field: "stop",
        })?;
        let step = step.ok_or(SweepError::MissingField {
            mode,
            field: "step",
        })?;

        match mode {
            SweepMode::Add => {
                let span = stop - start;
                if step == 0.0 || (span != 0.0 && span.signum() != step.signum()) {
                    return Err(SweepError::UnreachableStop { start, stop, step });
                }
                let count = (span / step + STOP_TOLERANCE).floor() + 1.0;
                if !count.is_finite() || count > MAX_SWEEP_VALUES as f64 {
                    return Err(SweepError::TooManyValues(count));
                }
            }
            SweepMode::Lin | SweepMode::Log => {
                if step < 1.0 || step.fract() != 0.0 || !step.is_finite() {
                    return Err(SweepError::InvalidCount(step));
                }
                if step > MAX_SWEEP_VALUES as f64 {
                    return Err(SweepError::TooManyValues(step));
                }
                if mode == SweepMode::Log
                    && (start == 0.0 || stop == 0.0 || start.signum() != stop.signum())
                {
                    return Err(SweepError::InvalidLogBounds { start, stop });
                }
            }
            SweepMode::List => {}
        }

        Ok(Self {
            mode,
            source: Source::Range { start, stop, step },
            prefix: String::new(),
            suffix: String::new(),
            separate: false,
            precision: DEFAULT_PRECISION,
        })
    }

    /// Create a sweep over explicit values, taken verbatim
    pub fn list<I, S>(values: I) -> Result<Self, SweepError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return Err(SweepError::EmptyList);
        }
        Ok(Self {
            mode: SweepMode::List,
            source: Source::List(values),
            prefix: String::new(),
            suffix: String::new(),
            separate: false,
            precision: DEFAULT_PRECISION,
        })
    }

    /// Build a sweep from its experiment file table
    pub fn from_spec(spec: &SweepSpec) -> Result<Self, SweepError> {
        let mode: SweepMode = spec.mode.parse()?;
        let sweep = if mode == SweepMode::List {
            let values = spec.values.as_ref().ok_or(SweepError::MissingField {
                mode,
                field: "values",
            })?;
            Self::list(values.iter().map(list_value_to_string))?
        } else {
            let start = spec.start.ok_or(SweepError::MissingField {
                mode,
                field: "start",
            })?;
            Self::numeric(mode, start, spec.stop, spec.step)?
        };

        let mut sweep = sweep
            .with_prefix(spec.prefix.clone())
            .with_suffix(spec.suffix.clone());
        sweep.separate = spec.separate;
        if let Some(precision) = spec.precision {
            sweep.precision = precision;
        }
        Ok(sweep)
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    /// Mark this sweep as an output subfolder discriminator
    pub fn separated(mut self) -> Self {
        self.separate = true;
        self
    }

    pub fn mode(&self) -> SweepMode {
        self.mode
    }

    pub fn is_separate(&self) -> bool {
        self.separate
    }

    /// All values in declaration order, formatted and decorated
    pub fn values(&self) -> Vec<String> {
        match &self.source {
            Source::List(values) => values.iter().map(|v| self.decorate(v)).collect(),
            Source::Range { start, stop, step } => self
                .numbers(*start, *stop, *step)
                .into_iter()
                .map(|n| self.decorate(&format_number(n, self.precision)))
                .collect(),
        }
    }

    /// First and last value of a numeric sweep; the full list for `list`
    pub fn edge_values(&self) -> Vec<String> {
        let mut values = self.values();
        if self.mode != SweepMode::List && values.len() > 2 {
            let last = values.pop();
            values.truncate(1);
            values.extend(last);
        }
        values
    }

    /// First value, used when a sweep is held fixed
    pub fn first_value(&self) -> String {
        self.values().into_iter().next().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn decorate(&self, value: &str) -> String {
        format!("{}{}{}", self.prefix, value, self.suffix)
    }

    fn numbers(&self, start: f64, stop: f64, step: f64) -> Vec<f64> {
        match self.mode {
            SweepMode::Add => {
                let span = stop - start;
                if span == 0.0 {
                    return vec![start];
                }
                let count = (span / step + STOP_TOLERANCE).floor() as usize + 1;
                (0..count).map(|i| start + step * i as f64).collect()
            }
            SweepMode::Lin => {
                let n = step as usize;
                if n == 1 {
                    return vec![start];
                }
                let delta = (stop - start) / (n - 1) as f64;
                let mut values: Vec<f64> = (0..n).map(|i| start + delta * i as f64).collect();
                values[n - 1] = stop;
                values
            }
            SweepMode::Log => {
                let n = step as usize;
                if n == 1 {
                    return vec![start];
                }
                let ratio = stop / start;
                let mut values: Vec<f64> = (0..n)
                    .map(|i| start * ratio.powf(i as f64 / (n - 1) as f64))
                    .collect();
                values[n - 1] = stop;
                values
            }
            SweepMode::List => Vec::new(),
        }
    }
}

fn list_value_to_string(value: &ListValue) -> String {
    match value {
        ListValue::Integer(i) => i.to_string(),
        ListValue::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
            (*f as i64).to_string()
        }
        // shortest representation that parses back to the same value
        ListValue::Float(f) => f.to_string(),
        ListValue::Text(s) => s.clone(),
    }
}

/// Render a number the way it appears on an encoder command line.
///
/// Integral values lose their decimals, anything else is rounded to
/// `precision` places with trailing zeros removed.
pub fn format_number(value: f64, precision: usize) -> String {
    let rounded = value.round();
    if (value - rounded).abs() < STOP_TOLERANCE * value.abs().max(1.0) {
        return format!("{}", rounded as i64);
    }
    let text = format!("{:.*}", precision, value);
    if !text.contains('.') {
        return text;
    }
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
