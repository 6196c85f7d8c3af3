//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read experiment file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse experiment file: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// External tools used outside of any particular setting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BinariesConfig {
    /// ffmpeg used for input conversion and final decodes
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    /// ffprobe used for metadata lookups
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

impl Default for BinariesConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
        }
    }
}

/// Run-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Root directory for every setting's outputs
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Usage sampling period in milliseconds (0 disables sampling)
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Input videos every setting is applied to
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("encsweep-out")
}

fn default_sample_interval_ms() -> u64 {
    1000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            sample_interval_ms: default_sample_interval_ms(),
            inputs: Vec::new(),
        }
    }
}

/// Concurrency as written in the experiment file: a count or the keyword `"all"`.
///
/// `0` means serial execution, `-1` is accepted as an alias for `"all"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConcurrencySetting {
    Count(i64),
    Keyword(String),
}

impl Default for ConcurrencySetting {
    fn default() -> Self {
        ConcurrencySetting::Count(0)
    }
}

/// A literal entry inside a `list` sweep
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ListValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Declarative parameter sweep table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepSpec {
    /// One of `add`, `lin`, `log`, `list`
    pub mode: String,
    #[serde(default)]
    pub start: Option<f64>,
    #[serde(default)]
    pub stop: Option<f64>,
    /// Increment for `add`, value count for `lin` / `log`
    #[serde(default, alias = "n")]
    pub step: Option<f64>,
    /// Explicit values for `list`
    #[serde(default)]
    pub values: Option<Vec<ListValue>>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    /// Emit this parameter as an output subfolder
    #[serde(default)]
    pub separate: bool,
    /// Decimal places kept for non-integral values
    #[serde(default)]
    pub precision: Option<usize>,
}

/// One token inside an option group.
///
/// Anything that is neither a string nor a sweep table is kept as `Invalid`
/// so the engine can report where it sits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OptionToken {
    Literal(String),
    Sweep(SweepSpec),
    Invalid(toml::Value),
}

/// One encoder configuration swept over every input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettingConfig {
    pub name: String,
    /// Backend identifier (`ffmpeg`, `vvc`)
    pub backend: String,
    /// Encoder executable
    pub binary: String,
    /// Decoder executable for two-stage backends
    #[serde(default)]
    pub decoder: Option<String>,
    #[serde(default)]
    pub concurrency: ConcurrencySetting,
    #[serde(default)]
    pub two_pass: bool,
    #[serde(default)]
    pub measure_decode: bool,
    /// Overrides `<run.output_dir>/<name>`
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub options: Vec<Vec<OptionToken>>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub binaries: BinariesConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub settings: Vec<SettingConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the experiment file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - ENCSWEEP_OUTPUT_DIR -> run.output_dir
    /// - ENCSWEEP_SAMPLE_INTERVAL_MS -> run.sample_interval_ms
    /// - ENCSWEEP_FFMPEG -> binaries.ffmpeg
    /// - ENCSWEEP_FFPROBE -> binaries.ffprobe
    /// - ENCSWEEP_CONCURRENCY -> concurrency of every setting
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("ENCSWEEP_OUTPUT_DIR") {
            if !val.is_empty() {
                self.run.output_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("ENCSWEEP_SAMPLE_INTERVAL_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.run.sample_interval_ms = ms;
            }
        }

        if let Ok(val) = env::var("ENCSWEEP_FFMPEG") {
            if !val.is_empty() {
                self.binaries.ffmpeg = val;
            }
        }

        if let Ok(val) = env::var("ENCSWEEP_FFPROBE") {
            if !val.is_empty() {
                self.binaries.ffprobe = val;
            }
        }

        if let Ok(val) = env::var("ENCSWEEP_CONCURRENCY") {
            let concurrency = match val.trim().parse::<i64>() {
                Ok(count) => Some(ConcurrencySetting::Count(count)),
                Err(_) if val.trim().eq_ignore_ascii_case("all") => {
                    Some(ConcurrencySetting::Keyword("all".to_string()))
                }
                Err(_) => None, // Invalid value, keep existing
            };
            if let Some(concurrency) = concurrency {
                for setting in &mut self.settings {
                    setting.concurrency = concurrency.clone();
                }
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("ENCSWEEP_OUTPUT_DIR");
        env::remove_var("ENCSWEEP_SAMPLE_INTERVAL_MS");
        env::remove_var("ENCSWEEP_FFMPEG");
        env::remove_var("ENCSWEEP_FFPROBE");
        env::remove_var("ENCSWEEP_CONCURRENCY");
    }

    const EXPERIMENT: &str = r#"
[binaries]
ffmpeg = "/opt/ffmpeg/bin/ffmpeg"

[run]
output_dir = "results"
inputs = ["a.mkv", "b.y4m"]

[[settings]]
name = "x264"
backend = "ffmpeg"
binary = "ffmpeg"
concurrency = 2
two_pass = true
options = [
    ["-c:v", "libx264"],
    ["-crf", { mode = "add", start = 20, stop = 30, step = 5 }],
    ["-preset", { mode = "list", values = ["fast", "slow"], separate = true }],
]

[[settings]]
name = "vvenc"
backend = "vvc"
binary = "vvencFFapp"
decoder = "vvdecapp"
concurrency = "all"
measure_decode = true
options = [["--QP", { mode = "lin", start = 22, stop = 37, n = 4 }]]
"#;

    #[test]
    fn test_parses_full_experiment() {
        let config = Config::parse_toml(EXPERIMENT).expect("experiment should parse");

        assert_eq!(config.binaries.ffmpeg, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.binaries.ffprobe, "ffprobe"); // default
        assert_eq!(config.run.output_dir, PathBuf::from("results"));
        assert_eq!(config.run.sample_interval_ms, 1000); // default
        assert_eq!(config.run.inputs.len(), 2);
        assert_eq!(config.settings.len(), 2);

        let x264 = &config.settings[0];
        assert_eq!(x264.concurrency, ConcurrencySetting::Count(2));
        assert!(x264.two_pass);
        assert!(!x264.measure_decode);
        assert_eq!(
            x264.options[0],
            vec![
                OptionToken::Literal("-c:v".to_string()),
                OptionToken::Literal("libx264".to_string())
            ]
        );
        match &x264.options[1][1] {
            OptionToken::Sweep(sweep) => {
                assert_eq!(sweep.mode, "add");
                assert_eq!(sweep.start, Some(20.0));
                assert_eq!(sweep.stop, Some(30.0));
                assert_eq!(sweep.step, Some(5.0));
                assert!(!sweep.separate);
            }
            other => panic!("expected sweep, got {:?}", other),
        }
        match &x264.options[2][1] {
            OptionToken::Sweep(sweep) => {
                assert!(sweep.separate);
                assert_eq!(
                    sweep.values,
                    Some(vec![
                        ListValue::Text("fast".to_string()),
                        ListValue::Text("slow".to_string())
                    ])
                );
            }
            other => panic!("expected sweep, got {:?}", other),
        }

        let vvenc = &config.settings[1];
        assert_eq!(vvenc.backend, "vvc");
        assert_eq!(vvenc.decoder.as_deref(), Some("vvdecapp"));
        assert_eq!(vvenc.concurrency, ConcurrencySetting::Keyword("all".to_string()));
        match &vvenc.options[0][1] {
            // `n` is accepted as an alias of `step`
            OptionToken::Sweep(sweep) => assert_eq!(sweep.step, Some(4.0)),
            other => panic!("expected sweep, got {:?}", other),
        }
    }

    #[test]
    fn test_non_string_tokens_are_kept_as_invalid() {
        let toml_str = r#"
[[settings]]
name = "bad"
backend = "ffmpeg"
binary = "ffmpeg"
options = [["-crf", 23], ["-g", { start = 1 }]]
"#;
        let config = Config::parse_toml(toml_str).expect("shape is still valid TOML");
        let options = &config.settings[0].options;
        assert!(matches!(options[0][1], OptionToken::Invalid(_)));
        // a table without `mode` is not a sweep
        assert!(matches!(options[1][1], OptionToken::Invalid(_)));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.binaries, BinariesConfig::default());
        assert_eq!(config.run.output_dir, PathBuf::from("encsweep-out"));
        assert_eq!(config.run.sample_interval_ms, 1000);
        assert!(config.run.inputs.is_empty());
        assert!(config.settings.is_empty());
    }

    #[test]
    fn test_setting_defaults() {
        let toml_str = r#"
[[settings]]
name = "plain"
backend = "ffmpeg"
binary = "ffmpeg"
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");
        let setting = &config.settings[0];
        assert_eq!(setting.concurrency, ConcurrencySetting::Count(0));
        assert!(!setting.two_pass);
        assert!(setting.output_dir.is_none());
        assert!(setting.options.is_empty());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = Config::load_from_file("/nonexistent/encsweep.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let err = Config::parse_toml("[[settings]]\nname = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_concurrency_applies_to_every_setting() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::parse_toml(EXPERIMENT).expect("Valid TOML");
        env::set_var("ENCSWEEP_CONCURRENCY", "all");
        config.apply_env_overrides();
        clear_env_vars();

        for setting in &config.settings {
            assert_eq!(setting.concurrency, ConcurrencySetting::Keyword("all".to_string()));
        }
    }

    #[test]
    fn test_env_invalid_concurrency_keeps_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::parse_toml(EXPERIMENT).expect("Valid TOML");
        env::set_var("ENCSWEEP_CONCURRENCY", "lots");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.settings[0].concurrency, ConcurrencySetting::Count(2));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_run_section_parses(
            interval in 0u64..100_000,
            dir in "[a-z][a-z0-9_]{0,12}",
            inputs in proptest::collection::vec("[a-z]{1,8}\\.mkv", 0..5),
        ) {
            let list = inputs
                .iter()
                .map(|i| format!("\"{}\"", i))
                .collect::<Vec<_>>()
                .join(", ");
            let toml_str = format!(
                "[run]\noutput_dir = \"{}\"\nsample_interval_ms = {}\ninputs = [{}]\n",
                dir, interval, list
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.run.output_dir, PathBuf::from(&dir));
            prop_assert_eq!(config.run.sample_interval_ms, interval);
            prop_assert_eq!(
                config.run.inputs,
                inputs.iter().map(PathBuf::from).collect::<Vec<_>>()
            );
        }

        #[test]
        fn prop_env_overrides_sample_interval(
            initial in 0u64..10_000,
            override_ms in 0u64..10_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[run]\nsample_interval_ms = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("ENCSWEEP_SAMPLE_INTERVAL_MS", override_ms.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.run.sample_interval_ms, override_ms);
        }

        #[test]
        fn prop_env_overrides_binaries_and_output(
            ffmpeg in "/[a-z]{1,10}/ffmpeg",
            ffprobe in "/[a-z]{1,10}/ffprobe",
            out in "/[a-z]{1,10}",
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::parse_toml("").expect("Valid TOML");

            env::set_var("ENCSWEEP_FFMPEG", &ffmpeg);
            env::set_var("ENCSWEEP_FFPROBE", &ffprobe);
            env::set_var("ENCSWEEP_OUTPUT_DIR", &out);
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.binaries.ffmpeg, ffmpeg);
            prop_assert_eq!(config.binaries.ffprobe, ffprobe);
            prop_assert_eq!(config.run.output_dir, PathBuf::from(out));
        }

        #[test]
        fn prop_env_overrides_numeric_concurrency(count in 0i64..64) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::parse_toml(EXPERIMENT).expect("Valid TOML");
            env::set_var("ENCSWEEP_CONCURRENCY", count.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            for setting in &config.settings {
                prop_assert_eq!(&setting.concurrency, &ConcurrencySetting::Count(count));
            }
        }
    }
}
