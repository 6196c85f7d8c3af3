//! Transcode settings and experiments
//!
//! A [`TranscodeSetting`] is one encoder configuration: a backend, its
//! executables, an option spec and a concurrency policy. An [`Experiment`] is
//! the validated form of an experiment file: every setting plus the inputs they
//! are swept over.

use crate::backend::{BackendKind, Binaries, EncoderBackend, UnknownBackend};
use crate::concurrency::{batch_ceiling, ConcurrencyError, ConcurrencyPolicy};
use crate::config::{Config, SettingConfig};
use crate::factory::{FactoryError, JobFactory};
use crate::job::Job;
use crate::matrix::{MatrixError, OptionSpec};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error type for setting construction
#[derive(Debug, Error, PartialEq)]
pub enum SettingError {
    #[error("setting '{setting}': {source}")]
    Matrix {
        setting: String,
        #[source]
        source: MatrixError,
    },

    #[error("setting '{setting}': {source}")]
    Backend {
        setting: String,
        #[source]
        source: UnknownBackend,
    },

    #[error("setting '{setting}': {source}")]
    Concurrency {
        setting: String,
        #[source]
        source: ConcurrencyError,
    },

    #[error("setting name must not be empty")]
    EmptyName,

    #[error("setting name '{0}' is used more than once")]
    DuplicateName(String),
}

/// One encoder configuration
#[derive(Debug, Clone)]
pub struct TranscodeSetting {
    pub name: String,
    pub backend: Arc<dyn EncoderBackend>,
    /// Encoder executable
    pub binary: String,
    /// Decoder executable of two-stage backends
    pub decoder: Option<String>,
    pub options: OptionSpec,
    pub concurrency: ConcurrencyPolicy,
    pub two_pass: bool,
    pub measure_decode: bool,
    pub output_dir: PathBuf,
}

impl TranscodeSetting {
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn EncoderBackend>,
        binary: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            output_dir: PathBuf::from(&name),
            name,
            backend,
            binary: binary.into(),
            decoder: None,
            options: OptionSpec::default(),
            concurrency: ConcurrencyPolicy::default(),
            two_pass: false,
            measure_decode: false,
        }
    }

    pub fn with_decoder(mut self, decoder: impl Into<String>) -> Self {
        self.decoder = Some(decoder.into());
        self
    }

    pub fn with_options(mut self, options: OptionSpec) -> Self {
        self.options = options;
        self
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyPolicy) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_two_pass(mut self, two_pass: bool) -> Self {
        self.two_pass = two_pass;
        self
    }

    pub fn with_measure_decode(mut self, measure_decode: bool) -> Self {
        self.measure_decode = measure_decode;
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Validate one `[[settings]]` entry. Outputs default to `<root>/<name>`.
    pub fn from_config(config: &SettingConfig, root: &Path) -> Result<Self, SettingError> {
        let name = config.name.trim();
        if name.is_empty() {
            return Err(SettingError::EmptyName);
        }
        let kind: BackendKind = config
            .backend
            .parse()
            .map_err(|source| SettingError::Backend {
                setting: name.to_string(),
                source,
            })?;
        let options =
            OptionSpec::from_config(&config.options).map_err(|source| SettingError::Matrix {
                setting: name.to_string(),
                source,
            })?;
        let concurrency = ConcurrencyPolicy::from_config(&config.concurrency).map_err(|source| {
            SettingError::Concurrency {
                setting: name.to_string(),
                source,
            }
        })?;

        let mut setting = Self::new(name, kind.instantiate(), config.binary.clone())
            .with_options(options)
            .with_concurrency(concurrency)
            .with_two_pass(config.two_pass)
            .with_measure_decode(config.measure_decode)
            .with_output_dir(
                config
                    .output_dir
                    .clone()
                    .unwrap_or_else(|| root.join(name)),
            );
        setting.decoder = config.decoder.clone();
        Ok(setting)
    }

    /// The full argument matrix
    pub fn matrix(&self) -> Vec<Vec<String>> {
        self.options.expand()
    }

    /// First and last value of every numeric sweep
    pub fn edge_matrix(&self) -> Vec<Vec<String>> {
        self.options.expand_edges()
    }
}

/// A validated experiment file
#[derive(Debug, Clone)]
pub struct Experiment {
    pub binaries: Binaries,
    pub inputs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    /// `None` disables usage sampling
    pub sample_interval: Option<Duration>,
    pub settings: Vec<Arc<TranscodeSetting>>,
}

impl Experiment {
    /// Reject malformed settings before anything runs
    pub fn from_config(config: &Config) -> Result<Self, SettingError> {
        let mut seen = HashSet::new();
        let mut settings = Vec::with_capacity(config.settings.len());
        for entry in &config.settings {
            let setting = TranscodeSetting::from_config(entry, &config.run.output_dir)?;
            if !seen.insert(setting.name.clone()) {
                return Err(SettingError::DuplicateName(setting.name));
            }
            settings.push(Arc::new(setting));
        }

        let sample_interval = match config.run.sample_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Ok(Self {
            binaries: Binaries::from(&config.binaries),
            inputs: config.run.inputs.clone(),
            output_dir: config.run.output_dir.clone(),
            sample_interval,
            settings,
        })
    }

    pub fn setting(&self, name: &str) -> Option<&Arc<TranscodeSetting>> {
        self.settings.iter().find(|s| s.name == name)
    }

    /// Every job of every setting, collisions rejected across settings
    pub fn build_jobs(&self) -> Result<Vec<Arc<Job>>, FactoryError> {
        let mut factory = JobFactory::new();
        for setting in &self.settings {
            factory.add_setting(&self.inputs, setting)?;
        }
        Ok(factory.finish())
    }

    /// Batch-wide concurrency ceiling
    pub fn ceiling(&self) -> usize {
        batch_ceiling(self.settings.iter().map(|s| &s.concurrency))
    }
}
