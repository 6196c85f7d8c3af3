//! Job construction
//!
//! Turns settings and inputs into jobs: one job per input and argument row,
//! each with a descriptive output path derived from the swept parameters.
//!
//! ```text
//! <setting output_dir>/[<param>_<value>/...]<input stem>_<param1>_<value1>..._<paramN>_<valueN>.mkv
//! ```

use crate::job::Job;
use crate::setting::TranscodeSetting;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Characters stripped from every generated path component
pub const FORBIDDEN_CHARS: [char; 9] = ['\\', '/', '|', '*', '"', '?', ':', '<', '>'];

pub const OUTPUT_EXTENSION: &str = "mkv";

/// Error type for job construction
#[derive(Debug, Error, PartialEq)]
pub enum FactoryError {
    #[error("input {} has no file name", .0.display())]
    InvalidInput(PathBuf),

    #[error("output {} is produced twice (settings '{first}' and '{second}')", .path.display())]
    OutputCollision {
        path: PathBuf,
        first: String,
        second: String,
    },
}

pub fn sanitize_component(component: &str) -> String {
    component
        .chars()
        .filter(|c| !FORBIDDEN_CHARS.contains(c))
        .collect()
}

/// Display name of each sweep: the option right before it without leading
/// dashes, or `param<i>` when there is none.
pub fn parameter_names(setting: &TranscodeSetting) -> Vec<String> {
    setting
        .options
        .locate_sweeps()
        .preceding
        .iter()
        .enumerate()
        .map(|(idx, preceding)| {
            let name = preceding
                .as_deref()
                .map(|token| sanitize_component(token.trim_start_matches('-')))
                .unwrap_or_default();
            if name.is_empty() {
                format!("param{}", idx)
            } else {
                name
            }
        })
        .collect()
}

/// Builds jobs for one or more settings, rejecting output collisions
#[derive(Debug, Default)]
pub struct JobFactory {
    jobs: Vec<Arc<Job>>,
    /// output path -> owning setting
    claimed: HashMap<PathBuf, String>,
}

impl JobFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one job per input and argument row of `setting`. Returns the number
    /// of jobs added.
    pub fn add_setting(
        &mut self,
        inputs: &[PathBuf],
        setting: &Arc<TranscodeSetting>,
    ) -> Result<usize, FactoryError> {
        let rows = setting.matrix();
        let names = parameter_names(setting);
        let locations = setting.options.locate_sweeps();
        let separate: Vec<bool> = setting
            .options
            .sweeps()
            .iter()
            .map(|sweep| sweep.is_separate())
            .collect();
        let capabilities = setting.backend.capabilities();

        let mut added = 0;
        for input in inputs {
            let stem = input
                .file_stem()
                .map(|s| sanitize_component(&s.to_string_lossy()))
                .filter(|s| !s.is_empty())
                .ok_or_else(|| FactoryError::InvalidInput(input.clone()))?;

            let variant = (!capabilities.accepts(input)).then(|| {
                let extension = capabilities.native_inputs.first().copied().unwrap_or("yuv");
                setting
                    .output_dir
                    .join("inputs")
                    .join(format!("{}.{}", stem, extension))
            });

            for row in &rows {
                let mut file_name = stem.clone();
                let mut subfolders = Vec::new();
                for (idx, position) in locations.positions.iter().enumerate() {
                    let value = sanitize_component(row.get(*position).map_or("", String::as_str));
                    file_name.push_str(&format!("_{}_{}", names[idx], value));
                    if separate[idx] {
                        subfolders.push(format!("{}_{}", names[idx], value));
                    }
                }

                let dir = subfolders
                    .iter()
                    .fold(setting.output_dir.clone(), |dir, sub| dir.join(sub));
                let output = dir.join(format!("{}.{}", file_name, OUTPUT_EXTENSION));
                self.claim(&output, &setting.name)?;

                let mut job = Job::new(input.clone(), row.clone(), output, setting.clone())
                    .with_subfolders(subfolders);
                if !capabilities.writes_container {
                    job = job.with_encoded(
                        dir.join(format!("{}.{}", file_name, capabilities.bitstream_extension)),
                    );
                }
                if let Some(variant) = &variant {
                    job = job.with_input_variant(variant);
                }
                debug!(job_id = %job.short_id(), output = %job.output.display(), "job created");
                self.jobs.push(Arc::new(job));
                added += 1;
            }
        }
        Ok(added)
    }

    fn claim(&mut self, output: &Path, setting: &str) -> Result<(), FactoryError> {
        if let Some(first) = self.claimed.get(output) {
            return Err(FactoryError::OutputCollision {
                path: output.to_path_buf(),
                first: first.clone(),
                second: setting.to_string(),
            });
        }
        self.claimed.insert(output.to_path_buf(), setting.to_string());
        Ok(())
    }

    pub fn finish(self) -> Vec<Arc<Job>> {
        self.jobs
    }
}

/// Jobs of a single setting
pub fn build_jobs(
    inputs: &[PathBuf],
    setting: &Arc<TranscodeSetting>,
) -> Result<Vec<Arc<Job>>, FactoryError> {
    let mut factory = JobFactory::new();
    factory.add_setting(inputs, setting)?;
    Ok(factory.finish())
}
