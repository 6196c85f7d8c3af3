//! ffmpeg family backend
//!
//! One process per pass. Progress travels over `-progress pipe:<fd>` on a
//! private side channel; a two-pass encode sends the first pass to the null
//! muxer and shares a pass log keyed by the job id.

use super::{
    describe_failure, remove_quietly, scratch_file, supervise, BackendError, Capabilities,
    CheckContext, CheckTarget, EncoderBackend, JobContext,
};
use crate::job::Job;
use crate::monitor::KeyValueParser;
use crate::process::{run_captured, spawn_with_side_channel, CommandLine, NULL_SINK};
use crate::setting::TranscodeSetting;
use crate::two_pass::{Pass, TwoPassController};
use std::fs;
use tracing::{debug, warn};

/// Synthetic source for quick checks: one 16x16 frame plus silence
const QUICK_VIDEO_SOURCE: &str = "nullsrc=s=16x16:d=0.04:r=25";
const QUICK_AUDIO_SOURCE: &str = "anullsrc";
const QUICK_DURATION: &str = "0.04";

#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    /// Full argument list of one pass, `progress` being the `pipe:<fd>` target
    pub fn encode_args(job: &Job, pass: Pass, progress: &str) -> Vec<String> {
        let mut args = vec![
            "-nostdin".to_string(),
            "-progress".to_string(),
            progress.to_string(),
            "-i".to_string(),
            job.encoder_input().to_string_lossy().into_owned(),
        ];
        args.extend(job.args.iter().cloned());

        let passlog = job.passlog_prefix().to_string_lossy().into_owned();
        let output = job.output.to_string_lossy().into_owned();
        match pass {
            Pass::Single => args.extend(["-y".to_string(), output]),
            Pass::First => args.extend([
                "-pass".to_string(),
                "1".to_string(),
                "-passlogfile".to_string(),
                passlog,
                "-f".to_string(),
                "null".to_string(),
                NULL_SINK.to_string(),
            ]),
            Pass::Second => args.extend([
                "-pass".to_string(),
                "2".to_string(),
                "-passlogfile".to_string(),
                passlog,
                "-y".to_string(),
                output,
            ]),
        }
        args
    }

    /// Remove `<prefix>*` files left by a two-pass encode
    fn remove_passlogs(job: &Job) {
        let prefix = job.passlog_prefix();
        let Some(name) = prefix.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return;
        };
        let Ok(entries) = fs::read_dir(job.output_dir()) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(&name) {
                remove_quietly(&entry.path());
            }
        }
    }

    fn quick_check_line(setting: &TranscodeSetting, args: &[String]) -> CommandLine {
        CommandLine::new(&setting.binary)
            .args(["-nostdin", "-y"])
            .args(["-f", "lavfi", "-i", QUICK_VIDEO_SOURCE])
            .args(["-f", "lavfi", "-i", QUICK_AUDIO_SOURCE])
            .args(["-t", QUICK_DURATION])
            .args(args.iter().cloned())
            .args(["-f", "matroska", NULL_SINK])
    }
}

impl EncoderBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            writes_container: true,
            bitstream_extension: "mkv",
            native_inputs: &[],
        }
    }

    fn start(&self, job: &Job, ctx: &JobContext<'_>) -> Result<(), BackendError> {
        let total_frames = ctx.info.frame_count(&job.input)?;
        let controller = TwoPassController::new(ctx.sink, job.setting.two_pass);

        let result = controller.run(|pass| {
            let (child, stream) = spawn_with_side_channel(&job.setting.binary, |target| {
                Self::encode_args(job, pass, target)
            })?;
            let report = supervise(job, ctx, child, stream, Box::new(KeyValueParser::new(total_frames)))?;
            debug!(job_id = %job.short_id(), ?pass, status = ?report.status, "pass finished");
            Ok(())
        });

        if job.setting.two_pass {
            Self::remove_passlogs(job);
        }
        result
    }

    fn check_arguments(
        &self,
        setting: &TranscodeSetting,
        args: &[String],
        target: CheckTarget<'_>,
        ctx: &CheckContext<'_>,
    ) -> Result<(), String> {
        match target {
            CheckTarget::Synthetic => {
                let line = Self::quick_check_line(setting, args);
                let output = run_captured(&line).map_err(|e| e.to_string())?;
                if output.status.success() {
                    Ok(())
                } else {
                    Err(describe_failure(&line.to_string(), output.status.code(), &output.stderr))
                }
            }
            CheckTarget::Input(input) => {
                let fps = ctx.info.framerate(input).map_err(|e| e.to_string())?;
                // two frames are enough to exercise the arguments
                let seconds = 2.0 / fps.as_f64();
                let scratch = scratch_file(ctx.scratch, "mkv");
                let line = CommandLine::new(&setting.binary)
                    .args(["-nostdin", "-i"])
                    .arg_path(input)
                    .args(["-t".to_string(), format!("{:.6}", seconds)])
                    .args(args.iter().cloned())
                    .arg("-y")
                    .arg_path(&scratch);
                let result = run_captured(&line);
                remove_quietly(&scratch);

                let output = result.map_err(|e| e.to_string())?;
                if output.status.success() {
                    Ok(())
                } else {
                    let message =
                        describe_failure(&line.to_string(), output.status.code(), &output.stderr);
                    warn!(input = %input.display(), "slow check failed");
                    Err(message)
                }
            }
        }
    }
}
