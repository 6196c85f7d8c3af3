//! Concurrency policy for encoder processes
//!
//! Resolves a setting's configured concurrency into a worker count using the
//! number of available processing units.

use crate::config::ConcurrencySetting;
use thiserror::Error;

/// Error type for concurrency parsing
#[derive(Debug, Error, PartialEq)]
pub enum ConcurrencyError {
    #[error("invalid concurrency {0:?} (expected a non-negative count, -1 or \"all\")")]
    Invalid(String),
}

/// How many jobs of one setting may run at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyPolicy {
    /// One job at a time
    #[default]
    Serial,
    /// A fixed number of parallel jobs
    Parallel(usize),
    /// One job per available processing unit
    AllCores,
}

impl ConcurrencyPolicy {
    /// Interpret the experiment file value
    ///
    /// - `0` -> serial
    /// - `-1` or `"all"` -> one job per processing unit
    /// - `n > 0` -> `n` parallel jobs
    pub fn from_config(setting: &ConcurrencySetting) -> Result<Self, ConcurrencyError> {
        match setting {
            ConcurrencySetting::Count(0) => Ok(ConcurrencyPolicy::Serial),
            ConcurrencySetting::Count(-1) => Ok(ConcurrencyPolicy::AllCores),
            ConcurrencySetting::Count(n) if *n > 0 => Ok(ConcurrencyPolicy::Parallel(*n as usize)),
            ConcurrencySetting::Count(n) => Err(ConcurrencyError::Invalid(n.to_string())),
            ConcurrencySetting::Keyword(word) if word.trim().eq_ignore_ascii_case("all") => {
                Ok(ConcurrencyPolicy::AllCores)
            }
            ConcurrencySetting::Keyword(word) => Err(ConcurrencyError::Invalid(word.clone())),
        }
    }

    /// Number of jobs allowed to run simultaneously (always at least one)
    pub fn resolve(&self) -> usize {
        self.resolve_with_cores(num_cpus::get())
    }

    fn resolve_with_cores(&self, cores: usize) -> usize {
        match self {
            ConcurrencyPolicy::Serial => 1,
            ConcurrencyPolicy::Parallel(n) => (*n).max(1),
            ConcurrencyPolicy::AllCores => cores.max(1),
        }
    }
}

/// Batch-wide ceiling: the largest resolved policy among the given ones
pub fn batch_ceiling<'a, I>(policies: I) -> usize
where
    I: IntoIterator<Item = &'a ConcurrencyPolicy>,
{
    policies
        .into_iter()
        .map(ConcurrencyPolicy::resolve)
        .max()
        .unwrap_or(1)
}
