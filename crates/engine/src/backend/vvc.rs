//! VVC two-stage backend
//!
//! The encoder only reads raw YUV and only writes a `.266` bitstream, so a job
//! runs up to three stages:
//!
//! 1. encode (one or two passes), progress counted from `POC` log lines
//! 2. optional decode to the null sink to measure decoder speed
//! 3. decode to Y4M piped into ffmpeg, producing a lossless FFV1 `.mkv`
//!
//! Every encoder log line is also appended to the job's report file.

use super::{
    describe_failure, remove_quietly, run_watched, scratch_file, supervise, BackendError,
    Capabilities, CheckContext, CheckTarget, EncoderBackend, JobContext,
};
use crate::job::{Job, WorkflowState};
use crate::monitor::{progress_percent, LineOutcome, StatusParser};
use crate::probe::VideoMetadata;
use crate::process::{
    run_captured, spawn_drained, spawn_pipeline, spawn_with_stdout_status, CommandLine, NULL_SINK,
};
use crate::setting::TranscodeSetting;
use crate::status::StatusSink;
use crate::two_pass::{Pass, TwoPassController};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_DECODER: &str = "vvdecapp";

/// Synthetic quick check input: one gray 64x64 4:2:0 frame
const SYNTHETIC_SIZE: usize = 64;

/// Encoder input format derived from an ffmpeg pixel format name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFormat {
    pub bit_depth: u8,
    /// 420, 422 or 444
    pub chroma: u16,
}

impl RawFormat {
    /// Accepts planar progressive `yuv4xxp` with an optional `NNle` depth
    pub fn parse(pix_fmt: &str) -> Result<Self, BackendError> {
        let unsupported = || BackendError::UnsupportedPixelFormat(pix_fmt.to_string());

        let rest = pix_fmt.strip_prefix("yuv").ok_or_else(unsupported)?;
        let (chroma, rest) = rest.split_at_checked(3).ok_or_else(unsupported)?;
        if !matches!(chroma, "420" | "422" | "444") {
            return Err(unsupported());
        }
        let depth = rest.strip_prefix('p').ok_or_else(unsupported)?;
        let bit_depth = if depth.is_empty() {
            8
        } else {
            depth
                .strip_suffix("le")
                .and_then(|d| d.parse::<u8>().ok())
                .ok_or_else(unsupported)?
        };

        Ok(Self {
            bit_depth,
            chroma: chroma.parse().map_err(|_| unsupported())?,
        })
    }
}

/// `-s WxH --fps N/D` plus bit depth and chroma flags
pub fn input_format_args(meta: &VideoMetadata, format: RawFormat) -> Vec<String> {
    vec![
        "-s".to_string(),
        meta.dimensions(),
        "--fps".to_string(),
        meta.framerate.to_string(),
        "--InputBitDepth".to_string(),
        format.bit_depth.to_string(),
        "--InputChromaFormat".to_string(),
        format.chroma.to_string(),
        "--InternalBitDepth".to_string(),
        format.bit_depth.to_string(),
    ]
}

/// Counts `POC` lines as frames and mirrors every line into a report file
pub struct PocLogParser {
    total_frames: u64,
    frame: u64,
    report: Option<BufWriter<File>>,
}

impl PocLogParser {
    pub fn new(total_frames: u64) -> Self {
        Self {
            total_frames,
            frame: 0,
            report: None,
        }
    }

    /// Append every line to `report`
    pub fn with_report(mut self, report: &Path) -> Result<Self, BackendError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(report)
            .map_err(|e| BackendError::io(format!("cannot open {}", report.display()), e))?;
        self.report = Some(BufWriter::new(file));
        Ok(self)
    }

    fn append(&mut self, line: &str) {
        if let Some(report) = &mut self.report {
            if let Err(e) = writeln!(report, "{}", line).and_then(|_| report.flush()) {
                warn!(error = %e, "report file write failed, no longer writing it");
                self.report = None;
            }
        }
    }
}

impl StatusParser for PocLogParser {
    fn parse_line(&mut self, line: &str, sink: &StatusSink) -> LineOutcome {
        if line.starts_with("POC") {
            self.frame += 1;
            sink.record("frame", self.frame.to_string());
            if let Some(perc) = progress_percent(self.frame, self.total_frames) {
                sink.progress(perc);
            }
        } else if line.starts_with(" finished") {
            sink.record("frame", self.total_frames.to_string());
            sink.progress(100.0);
        }
        self.append(line);
        // keep draining stdout until EOF so the encoder never blocks on it
        LineOutcome::Continue
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VvcBackend;

impl VvcBackend {
    /// Encoder arguments of one pass
    pub fn encode_args(job: &Job, encoded: &Path, pass: Pass, input_format: &[String]) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            job.encoder_input().to_string_lossy().into_owned(),
        ];
        if pass != Pass::First {
            args.push("-b".to_string());
            args.push(encoded.to_string_lossy().into_owned());
        }
        if let Some(number) = pass.number() {
            args.extend([
                "--Passes".to_string(),
                "2".to_string(),
                "--Pass".to_string(),
                number.to_string(),
                format!("--rcstatsfile={}", Self::stats_file(job).display()),
            ]);
        }
        args.extend(job.args.iter().cloned());
        args.extend(input_format.iter().cloned());
        args
    }

    fn stats_file(job: &Job) -> PathBuf {
        let prefix = job.passlog_prefix();
        prefix.with_file_name(format!(
            "{}_stat.json",
            prefix.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        ))
    }

    fn decoder(setting: &TranscodeSetting) -> &str {
        setting.decoder.as_deref().unwrap_or(DEFAULT_DECODER)
    }

    fn measure_decode(job: &Job, ctx: &JobContext<'_>, encoded: &Path) -> Result<(), BackendError> {
        ctx.sink.state(WorkflowState::MeasuringDecode);
        let line = CommandLine::new(Self::decoder(&job.setting))
            .arg("-b")
            .arg_path(encoded)
            .args(["--y4m", "-o", NULL_SINK]);
        run_watched(job, ctx, spawn_drained(line)?)?;
        Ok(())
    }

    /// `decoder -o - | ffmpeg -c:v ffv1 <output>`
    fn decode_to_container(
        job: &Job,
        ctx: &JobContext<'_>,
        encoded: &Path,
    ) -> Result<(), BackendError> {
        ctx.sink.state(WorkflowState::Decoding);
        let producer = CommandLine::new(Self::decoder(&job.setting))
            .arg("-b")
            .arg_path(encoded)
            .args(["--y4m", "-o", "-"]);
        let consumer = CommandLine::new(&ctx.binaries.ffmpeg)
            .args(["-nostdin", "-y", "-i", "pipe:0", "-c:v", "ffv1"])
            .arg_path(&job.output);

        let (producer, consumer) = spawn_pipeline(producer, consumer)?;
        job.process_started(producer.pid());
        let produced = producer.wait(ctx.timing.join_timeout);
        let consumed = consumer.wait(ctx.timing.join_timeout);
        job.process_exited();
        produced?.into_result()?;
        consumed?.into_result()?;
        Ok(())
    }

    fn run_check(line: &CommandLine) -> Result<(), String> {
        let output = run_captured(line).map_err(|e| e.to_string())?;
        if output.status.success() {
            Ok(())
        } else {
            // vvenc reports argument errors on stdout
            let mut diagnostics = output.stdout;
            diagnostics.extend_from_slice(&output.stderr);
            Err(describe_failure(&line.to_string(), output.status.code(), &diagnostics))
        }
    }

    fn check_line(
        setting: &TranscodeSetting,
        input: &Path,
        bitstream: &Path,
        frames: u32,
        args: &[String],
        input_format: &[String],
    ) -> CommandLine {
        CommandLine::new(&setting.binary)
            .arg("-i")
            .arg_path(input)
            .arg("-b")
            .arg_path(bitstream)
            .args(["-f".to_string(), frames.to_string()])
            .args(args.iter().cloned())
            .args(input_format.iter().cloned())
    }

    fn synthetic_check(
        setting: &TranscodeSetting,
        args: &[String],
        scratch: &Path,
    ) -> Result<(), String> {
        let frame = scratch_file(scratch, "yuv");
        let luma = SYNTHETIC_SIZE * SYNTHETIC_SIZE;
        fs::write(&frame, vec![128u8; luma + luma / 2])
            .map_err(|e| format!("cannot write {}: {}", frame.display(), e))?;
        let bitstream = frame.with_extension("266");

        let size = SYNTHETIC_SIZE.to_string();
        let input_format = [
            "-s".to_string(),
            format!("{}x{}", size, size),
            "--fps".to_string(),
            "25/1".to_string(),
            "--InputBitDepth".to_string(),
            "8".to_string(),
            "--InputChromaFormat".to_string(),
            "420".to_string(),
            "--InternalBitDepth".to_string(),
            "8".to_string(),
        ];
        let line = Self::check_line(setting, &frame, &bitstream, 1, args, &input_format);
        let result = Self::run_check(&line);
        remove_quietly(&frame);
        remove_quietly(&bitstream);
        result
    }

    fn input_check(
        &self,
        setting: &TranscodeSetting,
        args: &[String],
        input: &Path,
        ctx: &CheckContext<'_>,
    ) -> Result<(), String> {
        let meta = ctx.info.metadata(input).map_err(|e| e.to_string())?;
        let format = RawFormat::parse(&meta.pix_fmt).map_err(|e| e.to_string())?;

        let converted = if self.capabilities().accepts(input) {
            None
        } else {
            let variant = scratch_file(ctx.scratch, "yuv");
            if let Err(e) = self.prepare_input(input, &variant, ctx) {
                remove_quietly(&variant);
                return Err(e.to_string());
            }
            Some(variant)
        };

        let raw = converted.as_deref().unwrap_or(input);
        let bitstream = scratch_file(ctx.scratch, "266");
        let line = Self::check_line(
            setting,
            raw,
            &bitstream,
            2,
            args,
            &input_format_args(&meta, format),
        );
        let result = Self::run_check(&line);
        remove_quietly(&bitstream);
        if let Some(variant) = &converted {
            remove_quietly(variant);
        }
        result
    }
}

impl EncoderBackend for VvcBackend {
    fn name(&self) -> &'static str {
        "vvc"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            writes_container: false,
            bitstream_extension: "266",
            native_inputs: &["yuv"],
        }
    }

    fn executables(&self, setting: &TranscodeSetting) -> Vec<String> {
        vec![setting.binary.clone(), Self::decoder(setting).to_string()]
    }

    /// Raw YUV in the source's own pixel format
    fn prepare_input(
        &self,
        input: &Path,
        variant: &Path,
        ctx: &CheckContext<'_>,
    ) -> Result<(), BackendError> {
        let pix_fmt = ctx.info.pixel_format(input)?;
        RawFormat::parse(&pix_fmt)?;
        if let Some(parent) = variant.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BackendError::io(format!("cannot create {}", parent.display()), e))?;
        }

        let line = CommandLine::new(&ctx.binaries.ffmpeg)
            .args(["-nostdin", "-y", "-i"])
            .arg_path(input)
            .args(["-f", "rawvideo", "-pix_fmt", pix_fmt.as_str()])
            .arg_path(variant);
        debug!(command = %line, "converting input");
        let report = spawn_drained(line)?.wait(Duration::from_secs(2))?;
        report.into_result()?;
        Ok(())
    }

    fn start(&self, job: &Job, ctx: &JobContext<'_>) -> Result<(), BackendError> {
        let encoded = job
            .encoded
            .as_deref()
            .ok_or(BackendError::MissingPath("encoded"))?;
        let meta = ctx.info.metadata(&job.input)?;
        let input_format = input_format_args(&meta, RawFormat::parse(&meta.pix_fmt)?);
        let total_frames = meta.frame_count();

        let controller = TwoPassController::new(ctx.sink, job.setting.two_pass);
        let encoded_result = controller.run(|pass| {
            let parser =
                PocLogParser::new(total_frames).with_report(&job.report_path(pass == Pass::First))?;
            let line = CommandLine::new(&job.setting.binary)
                .args(Self::encode_args(job, encoded, pass, &input_format));
            let (child, stream) = spawn_with_stdout_status(line)?;
            supervise(job, ctx, child, stream, Box::new(parser))?;
            Ok(())
        });
        if job.setting.two_pass {
            remove_quietly(&Self::stats_file(job));
        }
        encoded_result?;

        if job.setting.measure_decode {
            Self::measure_decode(job, ctx, encoded)?;
        }
        Self::decode_to_container(job, ctx, encoded)
    }

    fn check_arguments(
        &self,
        setting: &TranscodeSetting,
        args: &[String],
        target: CheckTarget<'_>,
        ctx: &CheckContext<'_>,
    ) -> Result<(), String> {
        match target {
            CheckTarget::Synthetic => Self::synthetic_check(setting, args, ctx.scratch),
            CheckTarget::Input(input) => self.input_check(setting, args, input, ctx),
        }
    }
}
