//! Video metadata lookups
//!
//! The engine needs five facts about an input: duration, frame rate, frame
//! count, dimensions and pixel format. [`VideoInfo`] is the seam; the shipped
//! implementation asks ffprobe once per path and memoizes the answer.

use crate::process::{run_captured, CommandLine, ProcessError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe could not be run.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// ffprobe ran but reported a failure.
    #[error("ffprobe failed for {}: {message}", .path.display())]
    FfprobeFailed { path: PathBuf, message: String },

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The file has no video stream.
    #[error("{} has no video stream", .0.display())]
    NoVideoStream(PathBuf),
}

/// Rational frame rate as reported by ffprobe (`30000/1001`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framerate {
    pub num: u64,
    pub den: u64,
}

impl Framerate {
    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl fmt::Display for Framerate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for Framerate {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProbeError::ParseError(format!("invalid frame rate '{}'", s));
        let (num, den) = match s.trim().split_once('/') {
            Some((num, den)) => (num, den),
            None => (s.trim(), "1"),
        };
        let num: u64 = num.parse().map_err(|_| invalid())?;
        let den: u64 = den.parse().map_err(|_| invalid())?;
        if num == 0 || den == 0 {
            return Err(invalid());
        }
        Ok(Self { num, den })
    }
}

/// Everything the engine needs to know about one input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub duration_secs: f64,
    pub framerate: Framerate,
    pub width: u32,
    pub height: u32,
    pub pix_fmt: String,
}

impl VideoMetadata {
    /// Frames in the video, derived from duration and frame rate
    pub fn frame_count(&self) -> u64 {
        (self.duration_secs * self.framerate.as_f64()).floor() as u64
    }

    pub fn dimensions(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Metadata provider consumed by backends, the factory and the validator
pub trait VideoInfo: Send + Sync {
    fn metadata(&self, path: &Path) -> Result<VideoMetadata, ProbeError>;

    fn duration(&self, path: &Path) -> Result<f64, ProbeError> {
        Ok(self.metadata(path)?.duration_secs)
    }

    fn framerate(&self, path: &Path) -> Result<Framerate, ProbeError> {
        Ok(self.metadata(path)?.framerate)
    }

    fn frame_count(&self, path: &Path) -> Result<u64, ProbeError> {
        Ok(self.metadata(path)?.frame_count())
    }

    /// `WxH`
    fn dimensions(&self, path: &Path) -> Result<String, ProbeError> {
        Ok(self.metadata(path)?.dimensions())
    }

    fn pixel_format(&self, path: &Path) -> Result<String, ProbeError> {
        Ok(self.metadata(path)?.pix_fmt)
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub pix_fmt: Option<String>,
        pub r_frame_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub duration: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Parses ffprobe JSON output into the metadata of the first video stream.
pub fn parse_ffprobe_output(path: &Path, json_str: &str) -> Result<VideoMetadata, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let stream = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref().unwrap_or("video") == "video")
        .ok_or_else(|| ProbeError::NoVideoStream(path.to_path_buf()))?;

    let framerate = stream
        .r_frame_rate
        .as_deref()
        .and_then(|r| r.parse::<Framerate>().ok())
        .or_else(|| {
            stream
                .avg_frame_rate
                .as_deref()
                .and_then(|r| r.parse::<Framerate>().ok())
        })
        .ok_or_else(|| ProbeError::ParseError("missing frame rate".to_string()))?;

    // container duration first, stream duration for raw inputs
    let duration_secs = ffprobe
        .format
        .and_then(|f| f.duration)
        .or(stream.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| ProbeError::ParseError("missing duration".to_string()))?;

    Ok(VideoMetadata {
        duration_secs,
        framerate,
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        pix_fmt: stream.pix_fmt.unwrap_or_default(),
    })
}

/// ffprobe-backed [`VideoInfo`] with a per-run cache
#[derive(Debug)]
pub struct FfprobeInfo {
    ffprobe: String,
    cache: Mutex<HashMap<PathBuf, VideoMetadata>>,
}

impl FfprobeInfo {
    pub fn new(ffprobe: impl Into<String>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Probes a video file using ffprobe.
    ///
    /// Runs `ffprobe -v error -select_streams v:0 -show_entries ... -of json <path>`
    /// and parses the JSON output.
    fn probe(&self, path: &Path) -> Result<VideoMetadata, ProbeError> {
        let line = CommandLine::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=codec_type,width,height,pix_fmt,r_frame_rate,avg_frame_rate,duration:format=duration",
                "-of",
                "json",
            ])
            .arg_path(path);
        let output = run_captured(&line)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed {
                path: path.to_path_buf(),
                message: format!("exited with status {}: {}", output.status, stderr.trim()),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(path, &stdout)
    }
}

impl VideoInfo for FfprobeInfo {
    fn metadata(&self, path: &Path) -> Result<VideoMetadata, ProbeError> {
        if let Some(hit) = self.cache.lock().get(path) {
            return Ok(hit.clone());
        }
        let metadata = self.probe(path)?;
        debug!(path = %path.display(), ?metadata, "probed input");
        self.cache
            .lock()
            .insert(path.to_path_buf(), metadata.clone());
        Ok(metadata)
    }
}
