//! CLI entry point for encsweep
//!
//! Loads an experiment file and runs, validates or previews it.

use clap::{ArgAction, Parser, Subcommand};
use encsweep::config::ConfigError;
use encsweep::{
    run_preflight, CheckMode, Config, ConfigValidator, Experiment, FactoryError, FfprobeInfo,
    JobScheduler, MatrixError, PreflightError, SettingError, TranscodeSetting,
};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// encsweep - run video transcoding experiments
#[derive(Parser, Debug)]
#[command(name = "encsweep")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every job of the experiment
    Run {
        /// Path to the experiment file
        config: PathBuf,

        /// Skip the preflight checks of ffmpeg, ffprobe and the encoders
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },

    /// Dry run the argument matrix of each setting
    Check {
        /// Path to the experiment file
        config: PathBuf,

        /// quick: synthetic input and edge values; slow: every row on every input
        #[arg(long, default_value = "quick")]
        mode: CheckMode,

        /// Only vary the sweep at this position (quick mode)
        #[arg(long)]
        param: Option<usize>,

        /// Only check the named setting
        #[arg(long)]
        setting: Option<String>,
    },

    /// Print the expanded argument rows of each setting
    Matrix {
        /// Path to the experiment file
        config: PathBuf,

        /// Only the first and last value of every numeric sweep
        #[arg(long)]
        edges: bool,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Setting(#[from] SettingError),

    #[error(transparent)]
    Preflight(#[from] PreflightError),

    #[error(transparent)]
    Factory(#[from] FactoryError),

    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error("no setting named '{0}'")]
    UnknownSetting(String),

    #[error("could not write {}: {source}", path.display())]
    Summary {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let result = match args.command {
        Command::Run {
            config,
            skip_checks,
        } => run(&config, skip_checks).await,
        Command::Check {
            config,
            mode,
            param,
            setting,
        } => check(&config, mode, param, setting.as_deref()),
        Command::Matrix { config, edges } => matrix(&config, edges),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load(path: &Path) -> Result<Experiment, CliError> {
    info!(path = %path.display(), "loading experiment");
    let config = Config::load(path)?;
    Ok(Experiment::from_config(&config)?)
}

async fn run(path: &Path, skip_checks: bool) -> Result<ExitCode, CliError> {
    let experiment = load(path)?;
    if skip_checks {
        warn!("skipping preflight checks");
    } else {
        run_preflight(&experiment.binaries, &experiment)?;
    }

    let jobs = experiment.build_jobs()?;
    if jobs.is_empty() {
        warn!("experiment has no jobs (no inputs or no settings)");
        return Ok(ExitCode::SUCCESS);
    }

    let info = Arc::new(FfprobeInfo::new(experiment.binaries.ffprobe.clone()));
    let scheduler = JobScheduler::new(info, experiment.binaries.clone())
        .with_sample_interval(experiment.sample_interval);
    let summary = scheduler.run(jobs, experiment.ceiling()).await;

    let summary_path = experiment.output_dir.join("run_summary.json");
    summary
        .write_json(&summary_path)
        .map_err(|source| CliError::Summary {
            path: summary_path.clone(),
            source,
        })?;
    info!(path = %summary_path.display(), "summary written");

    for (job, message) in summary.failures() {
        error!(output = %job.output, "{}", message);
    }
    Ok(if summary.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn selected<'a>(
    experiment: &'a Experiment,
    name: Option<&str>,
) -> Result<Vec<&'a Arc<TranscodeSetting>>, CliError> {
    match name {
        Some(name) => experiment
            .setting(name)
            .map(|setting| vec![setting])
            .ok_or_else(|| CliError::UnknownSetting(name.to_string())),
        None => Ok(experiment.settings.iter().collect()),
    }
}

fn check(
    path: &Path,
    mode: CheckMode,
    param: Option<usize>,
    setting: Option<&str>,
) -> Result<ExitCode, CliError> {
    let experiment = load(path)?;
    let info = Arc::new(FfprobeInfo::new(experiment.binaries.ffprobe.clone()));
    let validator = ConfigValidator::new(info, experiment.binaries.clone(), std::env::temp_dir());

    let mut all_ok = true;
    for setting in selected(&experiment, setting)? {
        let ok = validator.check(&experiment.inputs, setting, mode, param)?;
        println!("{}: {}", setting.name, if ok { "ok" } else { "FAILED" });
        all_ok &= ok;
    }
    Ok(if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn matrix(path: &Path, edges: bool) -> Result<ExitCode, CliError> {
    let experiment = load(path)?;
    for setting in &experiment.settings {
        let rows = if edges {
            setting.edge_matrix()
        } else {
            setting.matrix()
        };
        println!("[{}] {} rows", setting.name, rows.len());
        for row in rows {
            println!("  {}", row.join(" "));
        }
    }
    Ok(ExitCode::SUCCESS)
}
