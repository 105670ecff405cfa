//! Per-model live state held in a model's instance slot.
//!
//! The slot holds a `ModelInstance`, a closed union over the backend
//! shapes. Each shape owns a `GenerationSlot`: the pending cleanup callback
//! and the cancellation handle of the one generation allowed to run for
//! that model.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::controller::{GenerationController, GenerationOutcome, GenerationState};
use super::engine::{InferenceEngine, InferenceSession};
use super::RuntimeError;

/// Shared handle to a model's session. `None` once the session is closed.
pub type SessionCell = Arc<tokio::sync::Mutex<Option<Box<dyn InferenceSession>>>>;

/// Cleanup sink supplied with a generation request.
pub type CleanupFn = Box<dyn FnOnce() + Send + 'static>;

/// Which backend shape occupies an instance slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    Native,
    Echo,
}

impl InstanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Echo => "echo",
        }
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live state for an initialized model.
pub enum ModelInstance {
    Native(NativeInstance),
    Echo(EchoInstance),
}

impl ModelInstance {
    pub fn kind(&self) -> InstanceKind {
        match self {
            Self::Native(_) => InstanceKind::Native,
            Self::Echo(_) => InstanceKind::Echo,
        }
    }

    pub(crate) fn generation(&self) -> &GenerationSlot {
        match self {
            Self::Native(native) => &native.generation,
            Self::Echo(echo) => &echo.generation,
        }
    }

    pub(crate) fn generation_mut(&mut self) -> &mut GenerationSlot {
        match self {
            Self::Native(native) => &mut native.generation,
            Self::Echo(echo) => &mut echo.generation,
        }
    }

    /// Tear down an instance already taken out of its slot: stop the
    /// generation (firing its cleanup), then close session and engine.
    /// Each release is attempted even if an earlier one failed.
    pub(crate) async fn release(self, model: &str, controller: &GenerationController) {
        match self {
            Self::Echo(echo) => controller.stop_detached(echo.generation.active).await,
            Self::Native(native) => {
                let NativeInstance { engine, session, generation } = native;
                controller.stop_detached(generation.active).await;

                let open_session = session.lock().await.take();
                if let Some(mut open_session) = open_session {
                    if let Err(err) = open_session.close() {
                        log_release_failure(model, "session", &err);
                    }
                }
                if let Err(err) = engine.close() {
                    log_release_failure(model, "engine", &err);
                }
            }
        }
    }
}

fn log_release_failure(model: &str, resource: &'static str, err: &RuntimeError) {
    let err = RuntimeError::ResourceRelease { resource, message: err.user_message() };
    tracing::warn!(model, error = %err, "release failed, continuing cleanup");
}

/// Engine plus its current session.
pub struct NativeInstance {
    pub(crate) engine: Arc<dyn InferenceEngine>,
    pub(crate) session: SessionCell,
    pub(crate) generation: GenerationSlot,
}

impl NativeInstance {
    pub(crate) fn new(engine: Arc<dyn InferenceEngine>, session: Box<dyn InferenceSession>) -> Self {
        Self {
            engine,
            session: Arc::new(tokio::sync::Mutex::new(Some(session))),
            generation: GenerationSlot::default(),
        }
    }
}

/// Echo backend readiness marker.
pub struct EchoInstance {
    pub(crate) marker: String,
    pub(crate) generation: GenerationSlot,
}

impl EchoInstance {
    pub(crate) fn new(marker: String) -> Self {
        Self { marker, generation: GenerationSlot::default() }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }
}

/// Runs a cleanup sink at most once, whichever path gets there first.
#[derive(Clone)]
pub struct CleanupOnce {
    inner: Arc<Mutex<Option<CleanupFn>>>,
}

impl CleanupOnce {
    pub fn new(cleanup: CleanupFn) -> Self {
        Self { inner: Arc::new(Mutex::new(Some(cleanup))) }
    }

    /// Invoke the callback if it has not run yet. Returns true if it ran now.
    pub fn fire(&self) -> bool {
        let callback = self.inner.lock().take();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.inner.lock().is_some()
    }
}

/// The in-flight generation of a model.
pub(crate) struct ActiveGeneration {
    pub(crate) id: u64,
    pub(crate) cancel: CancellationToken,
    pub(crate) cleanup: CleanupOnce,
    pub(crate) state: Arc<Mutex<GenerationState>>,
    pub(crate) task: JoinHandle<()>,
}

/// Generation ids are unique across every instance in the process.
static NEXT_GENERATION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SLOT_ID: AtomicU64 = AtomicU64::new(1);

/// At most one generation per model.
pub struct GenerationSlot {
    owner: u64,
    pub(crate) active: Option<ActiveGeneration>,
    pub(crate) last_outcome: Option<GenerationOutcome>,
}

impl Default for GenerationSlot {
    fn default() -> Self {
        Self {
            owner: NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed),
            active: None,
            last_outcome: None,
        }
    }
}

impl GenerationSlot {
    /// Identifies this slot, and so the instance holding it.
    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    pub(crate) fn allocate_id(&mut self) -> u64 {
        NEXT_GENERATION_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// Current state; `Idle` when nothing is in flight.
    pub fn state(&self) -> GenerationState {
        self.active
            .as_ref()
            .map(|active| *active.state.lock())
            .unwrap_or(GenerationState::Idle)
    }

    pub fn last_outcome(&self) -> Option<GenerationOutcome> {
        self.last_outcome
    }

    /// Record how generation `id`, started on slot `owner`, ended and
    /// detach it. A newer generation that already took the slot, or a slot
    /// belonging to a replacement instance, is left alone.
    pub(crate) fn release(&mut self, owner: u64, id: u64, outcome: GenerationOutcome) -> bool {
        if owner != self.owner {
            return false;
        }
        match &self.active {
            Some(active) if active.id != id => false,
            _ => {
                self.active = None;
                self.last_outcome = Some(outcome);
                true
            }
        }
    }
}
