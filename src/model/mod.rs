//! Model data model.
//!
//! A `Model` is owned by the caller and shared with the runtime by `Arc`.
//! The runtime only ever touches its instance slot, which stays empty until
//! `initialize` succeeds and is emptied again by `clean_up`.

mod config;

use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard, RwLock};

pub use config::{Accelerator, BackendKind, ModelConfig};
pub use config::{
    DEFAULT_MAX_IMAGE_COUNT, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, DEFAULT_TOP_K,
    DEFAULT_TOP_P,
};

use crate::runtime::registry::{InstanceKind, ModelInstance};

/// An image attached to a generation request, already encoded (PNG/JPEG).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    bytes: Vec<u8>,
}

impl ImageInput {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self { bytes: bytes.into() }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A model known to the application.
pub struct Model {
    name: String,
    backend: BackendKind,
    path: PathBuf,
    config: RwLock<ModelConfig>,
    instance: Mutex<Option<ModelInstance>>,
}

impl Model {
    pub fn new(name: impl Into<String>, backend: BackendKind, config: ModelConfig) -> Self {
        Self {
            name: name.into(),
            backend,
            path: PathBuf::new(),
            config: RwLock::new(config),
            instance: Mutex::new(None),
        }
    }

    /// Set the on-disk location of the model weights.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> ModelConfig {
        self.config.read().clone()
    }

    /// Replace the configuration. Takes effect on the next `initialize` or
    /// `reset_session`.
    pub fn update_config(&self, config: ModelConfig) {
        *self.config.write() = config;
    }

    /// True once `initialize` has populated the instance slot.
    pub fn is_initialized(&self) -> bool {
        self.instance.lock().is_some()
    }

    /// Which backend shape currently occupies the instance slot, if any.
    pub fn instance_kind(&self) -> Option<InstanceKind> {
        self.instance.lock().as_ref().map(ModelInstance::kind)
    }

    /// Lock the instance slot. Never held across an await point.
    pub(crate) fn instance(&self) -> MutexGuard<'_, Option<ModelInstance>> {
        self.instance.lock()
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("backend", &self.backend)
            .field("path", &self.path)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
