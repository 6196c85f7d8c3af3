//! Shared test fixtures

use crate::backend::{
    BackendError, Capabilities, CheckContext, CheckTarget, EncoderBackend, JobContext,
};
use crate::job::Job;
use crate::probe::{ProbeError, VideoInfo, VideoMetadata};
use crate::setting::TranscodeSetting;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Backend that succeeds without running anything
#[derive(Debug, Default)]
pub(crate) struct NoopBackend;

impl EncoderBackend for NoopBackend {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            writes_container: true,
            bitstream_extension: "mkv",
            native_inputs: &[],
        }
    }

    fn start(&self, _job: &Job, _ctx: &JobContext<'_>) -> Result<(), BackendError> {
        Ok(())
    }

    fn check_arguments(
        &self,
        _setting: &TranscodeSetting,
        _args: &[String],
        _target: CheckTarget<'_>,
        _ctx: &CheckContext<'_>,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// Answers every probe with the same metadata
pub(crate) struct StaticInfo(pub VideoMetadata);

impl VideoInfo for StaticInfo {
    fn metadata(&self, _path: &Path) -> Result<VideoMetadata, ProbeError> {
        Ok(self.0.clone())
    }
}

pub(crate) fn test_setting() -> Arc<TranscodeSetting> {
    Arc::new(TranscodeSetting::new("test", Arc::new(NoopBackend), "ffmpeg").with_output_dir("/out"))
}

/// Job reading `/in/clip.mkv`
pub(crate) fn test_job(output: &str) -> Job {
    Job::new("/in/clip.mkv", Vec::new(), output, test_setting())
}

/// Write an executable `/bin/sh` script.
///
/// Held under the spawn lock so no concurrently forked child inherits the
/// write handle, which would make executing the script fail with ETXTBSY.
#[cfg(unix)]
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    let _guard = crate::process::SPAWN_LOCK.lock();
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
