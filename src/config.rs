//! Runtime configuration loading from environment variables or TOML.
//!
//! Values come from `ONDEVICE_*` environment variables with sensible
//! defaults. Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `ONDEVICE_ECHO_CHAR_DELAY_MS` | 20 | Echo backend delay per character |
//! | `ONDEVICE_ECHO_TRAILING_PAUSE_MS` | 100 | Echo backend pause before the final chunk |
//! | `ONDEVICE_CLEANUP_GRACE_MS` | 2000 | Wait for a cancelled generation during cleanup |
//! | `ONDEVICE_MAX_TOKENS` | 1024 | Default model max tokens |
//! | `ONDEVICE_TOP_K` | 64 | Default model top-k |
//! | `ONDEVICE_TOP_P` | 0.95 | Default model top-p |
//! | `ONDEVICE_TEMPERATURE` | 1.0 | Default model temperature |
//! | `ONDEVICE_ACCELERATOR` | cpu | Default accelerator (`cpu`, `gpu`, `npu`) |

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::model::{
    Accelerator, ModelConfig, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, DEFAULT_TOP_K,
    DEFAULT_TOP_P,
};
use crate::runtime::{RuntimeError, DEFAULT_CLEANUP_GRACE};

pub use crate::runtime::EchoConfig;

/// Settings shared by every runtime a dispatcher owns.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub echo: EchoConfig,
    /// How long cleanup waits for a cancelled generation before aborting it.
    pub cleanup_grace: Duration,
    /// Configuration handed to models created without their own.
    pub default_model: ModelConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            echo: EchoConfig::default(),
            cleanup_grace: DEFAULT_CLEANUP_GRACE,
            default_model: ModelConfig::default(),
        }
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse an `f32` env var, returning `default` on missing, invalid or non-finite.
fn parse_f32(key: &str, default: f32) -> f32 {
    match std::env::var(key) {
        Ok(val) => val.parse::<f32>().ok().filter(|v| v.is_finite()).unwrap_or(default),
        Err(_) => default,
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Load echo pacing from environment.
fn load_echo_config() -> EchoConfig {
    let defaults = EchoConfig::default();
    let char_delay = parse_u64("ONDEVICE_ECHO_CHAR_DELAY_MS", millis(defaults.char_delay));
    let trailing = parse_u64("ONDEVICE_ECHO_TRAILING_PAUSE_MS", millis(defaults.trailing_pause));
    EchoConfig {
        char_delay: Duration::from_millis(char_delay),
        trailing_pause: Duration::from_millis(trailing),
    }
}

/// Load the default model configuration from environment.
///
/// Each value is checked on its own so one bad variable does not discard
/// the others.
fn load_model_config() -> ModelConfig {
    let max_tokens = parse_u32("ONDEVICE_MAX_TOKENS", DEFAULT_MAX_TOKENS).max(1);
    let top_k = parse_u32("ONDEVICE_TOP_K", DEFAULT_TOP_K).max(1);
    let top_p = parse_f32("ONDEVICE_TOP_P", DEFAULT_TOP_P);
    let top_p = if top_p > 0.0 && top_p <= 1.0 { top_p } else { DEFAULT_TOP_P };
    let temperature = parse_f32("ONDEVICE_TEMPERATURE", DEFAULT_TEMPERATURE);
    let temperature = if temperature >= 0.0 { temperature } else { DEFAULT_TEMPERATURE };
    let accelerator = match std::env::var("ONDEVICE_ACCELERATOR") {
        Ok(val) => val.parse::<Accelerator>().unwrap_or_default(),
        Err(_) => Accelerator::default(),
    };
    ModelConfig {
        max_tokens,
        top_k,
        top_p,
        temperature,
        accelerator,
        ..ModelConfig::default()
    }
}

/// On-disk layout of a runtime config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    cleanup_grace_ms: Option<u64>,
    echo: EchoSection,
    default_model: Option<ModelConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct EchoSection {
    char_delay_ms: Option<u64>,
    trailing_pause_ms: Option<u64>,
}

impl RuntimeConfig {
    /// Load all configuration from environment variables.
    pub fn from_env() -> Self {
        let grace_ms = parse_u64("ONDEVICE_CLEANUP_GRACE_MS", millis(DEFAULT_CLEANUP_GRACE));
        Self {
            echo: load_echo_config(),
            cleanup_grace: Duration::from_millis(grace_ms),
            default_model: load_model_config(),
        }
    }

    /// Parse a TOML document. Missing keys take their defaults; unknown keys
    /// and an invalid `default_model` are errors.
    pub fn from_toml_str(text: &str) -> Result<Self, RuntimeError> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| RuntimeError::InvalidConfig(e.message().to_string()))?;

        let defaults = Self::default();
        let echo = EchoConfig {
            char_delay: file
                .echo
                .char_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.echo.char_delay),
            trailing_pause: file
                .echo
                .trailing_pause_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.echo.trailing_pause),
        };
        let default_model = file.default_model.unwrap_or(defaults.default_model);
        default_model.validate()?;

        Ok(Self {
            echo,
            cleanup_grace: file
                .cleanup_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.cleanup_grace),
            default_model,
        })
    }

    /// Read a TOML config file.
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "ONDEVICE_ECHO_CHAR_DELAY_MS",
        "ONDEVICE_ECHO_TRAILING_PAUSE_MS",
        "ONDEVICE_CLEANUP_GRACE_MS",
        "ONDEVICE_MAX_TOKENS",
        "ONDEVICE_TOP_K",
        "ONDEVICE_TOP_P",
        "ONDEVICE_TEMPERATURE",
        "ONDEVICE_ACCELERATOR",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = RuntimeConfig::from_env();
        assert_eq!(cfg, RuntimeConfig::default());
        assert_eq!(cfg.echo.char_delay, Duration::from_millis(20));
        assert_eq!(cfg.echo.trailing_pause, Duration::from_millis(100));
        assert_eq!(cfg.cleanup_grace, Duration::from_secs(2));
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("ONDEVICE_ECHO_CHAR_DELAY_MS", "1");
        std::env::set_var("ONDEVICE_CLEANUP_GRACE_MS", "250");
        std::env::set_var("ONDEVICE_TOP_K", "40");
        std::env::set_var("ONDEVICE_TOP_P", "0.5");
        std::env::set_var("ONDEVICE_ACCELERATOR", "GPU");
        let cfg = RuntimeConfig::from_env();
        assert_eq!(cfg.echo.char_delay, Duration::from_millis(1));
        assert_eq!(cfg.cleanup_grace, Duration::from_millis(250));
        assert_eq!(cfg.default_model.top_k, 40);
        assert_eq!(cfg.default_model.top_p, 0.5);
        assert_eq!(cfg.default_model.accelerator, Accelerator::Gpu);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("ONDEVICE_MAX_TOKENS", "lots");
        std::env::set_var("ONDEVICE_TOP_P", "1.5");
        std::env::set_var("ONDEVICE_TEMPERATURE", "-2");
        std::env::set_var("ONDEVICE_ACCELERATOR", "tpu");
        let cfg = RuntimeConfig::from_env();
        assert_eq!(cfg.default_model.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(cfg.default_model.top_p, DEFAULT_TOP_P);
        assert_eq!(cfg.default_model.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(cfg.default_model.accelerator, Accelerator::Cpu);
        assert!(cfg.default_model.validate().is_ok());
        clear_env_vars();
    }

    #[test]
    fn toml_partial_file_keeps_defaults() {
        let cfg = RuntimeConfig::from_toml_str(
            r#"
            cleanup_grace_ms = 500

            [echo]
            char_delay_ms = 5

            [default_model]
            max_tokens = 256
            supports_image = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.cleanup_grace, Duration::from_millis(500));
        assert_eq!(cfg.echo.char_delay, Duration::from_millis(5));
        assert_eq!(cfg.echo.trailing_pause, Duration::from_millis(100));
        assert_eq!(cfg.default_model.max_tokens, 256);
        assert_eq!(cfg.default_model.top_k, DEFAULT_TOP_K);
        assert!(cfg.default_model.supports_image);
    }

    #[test]
    fn toml_rejects_invalid_model() {
        let err = RuntimeConfig::from_toml_str("[default_model]\ntop_k = 0\n").unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig(_)));
    }

    #[test]
    fn toml_rejects_unknown_keys() {
        assert!(RuntimeConfig::from_toml_str("grace = 1\n").is_err());
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[echo]\ntrailing_pause_ms = 7").unwrap();
        let cfg = RuntimeConfig::load(file.path()).unwrap();
        assert_eq!(cfg.echo.trailing_pause, Duration::from_millis(7));
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = RuntimeConfig::load(Path::new("/nonexistent/ondevice.toml")).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig(_)));
    }
}
