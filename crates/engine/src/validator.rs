//! Dry runs of a setting's argument matrix
//!
//! Quick mode pushes the edge rows through the backend's synthetic check,
//! remembering every argument list that passed. Slow mode runs the full
//! matrix against real inputs and is never cached.

use crate::backend::{Binaries, CheckContext, CheckMode, CheckTarget};
use crate::matrix::MatrixError;
use crate::probe::VideoInfo;
use crate::setting::TranscodeSetting;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Validates settings before a run. Owns its cache of passed invocations.
pub struct ConfigValidator {
    info: Arc<dyn VideoInfo>,
    binaries: Binaries,
    scratch: PathBuf,
    passed: Mutex<HashSet<String>>,
}

impl ConfigValidator {
    pub fn new(info: Arc<dyn VideoInfo>, binaries: Binaries, scratch: impl Into<PathBuf>) -> Self {
        Self {
            info,
            binaries,
            scratch: scratch.into(),
            passed: Mutex::new(HashSet::new()),
        }
    }

    /// Dry run `setting`. With `param`, quick mode only varies that sweep.
    ///
    /// Returns `Ok(false)` when any invocation failed; the encoder's
    /// diagnostics are logged.
    pub fn check(
        &self,
        files: &[PathBuf],
        setting: &TranscodeSetting,
        mode: CheckMode,
        param: Option<usize>,
    ) -> Result<bool, MatrixError> {
        let ctx = CheckContext {
            info: self.info.as_ref(),
            binaries: &self.binaries,
            scratch: &self.scratch,
        };

        let ok = match mode {
            CheckMode::Quick => {
                let rows = match param {
                    Some(target) => setting.options.expand_varying(target)?,
                    None => setting.edge_matrix(),
                };
                info!(setting = %setting.name, rows = rows.len(), "quick check");
                let mut ok = true;
                for row in &rows {
                    ok &= self.quick(setting, row, &ctx);
                }
                ok
            }
            CheckMode::Slow => {
                let rows = setting.matrix();
                info!(
                    setting = %setting.name,
                    rows = rows.len(),
                    inputs = files.len(),
                    "slow check"
                );
                let mut ok = true;
                for file in files {
                    for row in &rows {
                        ok &= self.run(setting, row, CheckTarget::Input(file), &ctx);
                    }
                }
                ok
            }
        };

        if ok {
            info!(setting = %setting.name, "arguments accepted");
        } else {
            warn!(setting = %setting.name, "arguments rejected");
        }
        Ok(ok)
    }

    /// Number of cached passing invocations
    pub fn cached(&self) -> usize {
        self.passed.lock().len()
    }

    fn quick(&self, setting: &TranscodeSetting, args: &[String], ctx: &CheckContext<'_>) -> bool {
        let key = signature(setting, args);
        if self.passed.lock().contains(&key) {
            debug!(setting = %setting.name, args = %args.join(" "), "cached pass");
            return true;
        }
        let ok = self.run(setting, args, CheckTarget::Synthetic, ctx);
        if ok {
            self.passed.lock().insert(key);
        }
        ok
    }

    fn run(
        &self,
        setting: &TranscodeSetting,
        args: &[String],
        target: CheckTarget<'_>,
        ctx: &CheckContext<'_>,
    ) -> bool {
        match setting.backend.check_arguments(setting, args, target, ctx) {
            Ok(()) => {
                debug!(setting = %setting.name, args = %args.join(" "), "dry run passed");
                true
            }
            Err(diagnostic) => {
                let input = match target {
                    CheckTarget::Synthetic => "synthetic".to_string(),
                    CheckTarget::Input(path) => path.display().to_string(),
                };
                warn!(
                    setting = %setting.name,
                    args = %args.join(" "),
                    input = %input,
                    "dry run failed:\n{}",
                    diagnostic
                );
                false
            }
        }
    }
}

/// Cache key: the executables and every argument, unambiguously joined
fn signature(setting: &TranscodeSetting, args: &[String]) -> String {
    let mut key = format!("{}\u{1f}{}", setting.backend.name(), setting.binary);
    for arg in args {
        key.push('\u{1f}');
        key.push_str(arg);
    }
    key
}
