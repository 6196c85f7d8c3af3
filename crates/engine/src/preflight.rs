//! Preflight checks
//!
//! Verifies before a run that every executable the experiment needs can be
//! started:
//! - ffmpeg and ffprobe must answer `-version` successfully
//! - each setting's encoder (and decoder, for two-stage backends) must spawn

use crate::backend::Binaries;
use crate::process::{run_captured, CommandLine, ProcessError};
use crate::setting::Experiment;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info};

/// Error types for preflight checks
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("{tool} not available: {source}")]
    Unavailable {
        tool: String,
        #[source]
        source: ProcessError,
    },

    #[error("`{command}` failed; is {tool} installed and in PATH?")]
    VersionFailed { tool: String, command: String },
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 7.1 ..."
/// - N-prefixed: "ffmpeg version n7.1-... ..."
/// - Tool name in place of ffmpeg: "ffprobe version 7.1 ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains(" version "))?;

    let lower = version_line.to_lowercase();
    let version_part = lower.split(" version ").nth(1)?.split_whitespace().next()?;

    // n-prefixed git builds
    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(['.', '-']).next()?;
    major_str.parse().ok()
}

/// Run `<binary> -version` and return the reported major version, if any
pub fn check_ffmpeg_tool(tool: &str, binary: &str) -> Result<Option<u32>, PreflightError> {
    let line = CommandLine::new(binary).arg("-version");
    let output = run_captured(&line).map_err(|source| PreflightError::Unavailable {
        tool: tool.to_string(),
        source,
    })?;
    if !output.status.success() {
        return Err(PreflightError::VersionFailed {
            tool: tool.to_string(),
            command: line.to_string(),
        });
    }

    let version = parse_ffmpeg_version(&String::from_utf8_lossy(&output.stdout));
    match version {
        Some(major) => info!(tool, binary, major, "found"),
        None => info!(tool, binary, "found, version unknown"),
    }
    Ok(version)
}

/// Check that `binary` can be started. Encoders disagree on how to ask for
/// a version, so the exit code is ignored.
pub fn check_spawnable(binary: &str) -> Result<(), PreflightError> {
    let line = CommandLine::new(binary).arg("--version");
    let output = run_captured(&line).map_err(|source| PreflightError::Unavailable {
        tool: binary.to_string(),
        source,
    })?;
    debug!(binary, code = ?output.status.code(), "encoder starts");
    Ok(())
}

/// Run all preflight checks in order
///
/// Checks are run in the following order:
/// 1. ffmpeg
/// 2. ffprobe
/// 3. every distinct setting executable
pub fn run_preflight(binaries: &Binaries, experiment: &Experiment) -> Result<(), PreflightError> {
    check_ffmpeg_tool("ffmpeg", &binaries.ffmpeg)?;
    check_ffmpeg_tool("ffprobe", &binaries.ffprobe)?;

    let executables: BTreeSet<String> = experiment
        .settings
        .iter()
        .flat_map(|setting| setting.backend.executables(setting))
        .collect();
    for binary in &executables {
        check_spawnable(binary)?;
    }
    Ok(())
}
