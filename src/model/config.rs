//! Per-model configuration values.
//!
//! All fields have safe defaults. Configuration is validated before an
//! engine or session is built from it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::runtime::RuntimeError;

pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_TOP_K: u32 = 64;
pub const DEFAULT_TOP_P: f32 = 0.95;
pub const DEFAULT_TEMPERATURE: f32 = 1.0;
pub const DEFAULT_MAX_IMAGE_COUNT: u32 = 1;

/// Backend that owns a model's instance slot.
///
/// Closed set: a new backend means a new variant here and a new arm in the
/// dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Engine-backed runtime driven through an `EngineFactory`.
    Native,
    /// Echo test backend.
    Echo,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Echo => "echo",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Preferred compute unit for the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    #[default]
    Cpu,
    Gpu,
    Npu,
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Npu => "npu",
        };
        f.write_str(name)
    }
}

impl FromStr for Accelerator {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            "npu" => Ok(Self::Npu),
            other => Err(RuntimeError::InvalidConfig(format!(
                "unknown accelerator '{other}'"
            ))),
        }
    }
}

/// Typed configuration bag attached to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Context budget handed to the engine (prompt plus response).
    pub max_tokens: u32,
    pub top_k: u32,
    pub top_p: f32,
    pub temperature: f32,
    pub accelerator: Accelerator,
    /// Whether the model accepts image units.
    pub supports_image: bool,
    /// Maximum images attached to a single generation.
    pub max_image_count: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            top_k: DEFAULT_TOP_K,
            top_p: DEFAULT_TOP_P,
            temperature: DEFAULT_TEMPERATURE,
            accelerator: Accelerator::Cpu,
            supports_image: false,
            max_image_count: DEFAULT_MAX_IMAGE_COUNT,
        }
    }
}

impl ModelConfig {
    /// Validate configuration values. Returns error on invalid values.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_tokens == 0 {
            return Err(RuntimeError::InvalidConfig("max_tokens must be > 0".into()));
        }
        if self.top_k == 0 {
            return Err(RuntimeError::InvalidConfig("top_k must be > 0".into()));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(RuntimeError::InvalidConfig(
                "top_p must be in range (0.0, 1.0]".into(),
            ));
        }
        if !(self.temperature >= 0.0) {
            return Err(RuntimeError::InvalidConfig(
                "temperature must be >= 0.0".into(),
            ));
        }
        Ok(())
    }

    /// Number of image units the engine must be prepared to accept.
    pub fn effective_max_images(&self) -> u32 {
        if self.supports_image {
            self.max_image_count
        } else {
            0
        }
    }
}
