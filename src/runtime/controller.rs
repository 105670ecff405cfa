//! Streaming generation state machine.
//!
//! One generation per model: `Idle → Preparing → Streaming →
//! {Completed | Cancelled | Failed}`, back to `Idle` once the cleanup sink
//! has run. Each generation is a single tokio task that owns the chunk
//! sink, so chunks are delivered in order from one place. Cancellation is a
//! `CancellationToken` observed between chunks; on every terminus the task
//! delivers exactly one `done = true` chunk and fires the cleanup sink.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::model::Model;
use crate::telemetry;

use super::registry::{ActiveGeneration, CleanupFn, CleanupOnce, GenerationSlot, ModelInstance};
use super::RuntimeError;

/// Default time external cleanup waits for a cancelled generation to wind down.
pub const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_secs(2);

/// Where a model's generation currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationState {
    Idle,
    Preparing,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationOutcome {
    Completed,
    Cancelled,
    Failed,
}

impl GenerationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    fn state(self) -> GenerationState {
        match self {
            Self::Completed => GenerationState::Completed,
            Self::Cancelled => GenerationState::Cancelled,
            Self::Failed => GenerationState::Failed,
        }
    }
}

impl fmt::Display for GenerationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of streamed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseChunk {
    pub text: String,
    pub done: bool,
    /// Sanitized failure message; set only on a final error chunk.
    pub error: Option<String>,
}

impl ResponseChunk {
    pub fn partial(text: impl Into<String>) -> Self {
        Self { text: text.into(), done: false, error: None }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self { text: text.into(), done: true, error: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self { text: message.clone(), done: true, error: Some(message) }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Caller-supplied chunk sink, invoked from the generation task.
pub type ChunkSink = Box<dyn FnMut(ResponseChunk) + Send + 'static>;

/// Backend side of a generation: feeds input, then yields chunks.
#[async_trait]
pub(crate) trait ChunkProducer: Send + 'static {
    /// Feed the request into the session before generation starts.
    async fn prepare(&mut self) -> Result<(), RuntimeError>;

    /// Next chunk in emission order. `None` means the backend stopped
    /// without flagging a final chunk.
    async fn next_chunk(&mut self) -> Option<Result<ResponseChunk, RuntimeError>>;

    /// Stop the backend and build the final chunk delivered on cancellation.
    async fn cancel(&mut self) -> ResponseChunk;
}

/// Drives generations and owns the "one producer per model" rule.
#[derive(Debug, Clone)]
pub struct GenerationController {
    cleanup_grace: Duration,
}

impl Default for GenerationController {
    fn default() -> Self {
        Self::new(DEFAULT_CLEANUP_GRACE)
    }
}

impl GenerationController {
    pub fn new(cleanup_grace: Duration) -> Self {
        Self { cleanup_grace }
    }

    pub fn cleanup_grace(&self) -> Duration {
        self.cleanup_grace
    }

    /// Start a generation for `model`, superseding any generation in flight.
    ///
    /// `build` turns the live instance into a producer while the slot is
    /// locked. When the model is uninitialized or `build` fails, the sink
    /// receives one error chunk, the cleanup sink runs, and the error is
    /// returned. Outside a tokio runtime the request is rejected the same way.
    pub(crate) fn start<P, F>(
        &self,
        model: &Arc<Model>,
        sink: ChunkSink,
        cleanup: CleanupFn,
        build: F,
    ) -> Result<(), RuntimeError>
    where
        P: ChunkProducer,
        F: FnOnce(&ModelInstance) -> Result<P, RuntimeError>,
    {
        let cleanup = CleanupOnce::new(cleanup);
        let Ok(handle) = Handle::try_current() else {
            let err = RuntimeError::GenerationFailure("no async runtime is running".into());
            return Err(reject(model.name(), sink, &cleanup, err));
        };
        let started = {
            let mut slot = model.instance();
            match slot.as_mut() {
                None => Err((RuntimeError::UninitializedModel(model.name().to_string()), sink)),
                Some(instance) => match build(&*instance) {
                    Err(err) => Err((err, sink)),
                    Ok(producer) => {
                        let generation = instance.generation_mut();
                        self.spawn(&handle, model, generation, producer, sink, cleanup.clone());
                        Ok(())
                    }
                },
            }
        };

        started.map_err(|(err, sink)| reject(model.name(), sink, &cleanup, err))
    }

    fn spawn<P: ChunkProducer>(
        &self,
        handle: &Handle,
        model: &Arc<Model>,
        slot: &mut GenerationSlot,
        producer: P,
        sink: ChunkSink,
        cleanup: CleanupOnce,
    ) {
        let id = slot.allocate_id();
        let previous = slot.active.take();
        if let Some(previous) = &previous {
            tracing::debug!(
                model = model.name(),
                superseded = previous.id,
                generation = id,
                "superseding in-flight generation"
            );
            previous.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(GenerationState::Preparing));
        let span = telemetry::GenerationSpan::new(model.name(), id);
        let task = handle.spawn(
            run_generation(GenerationTask {
                model: model.clone(),
                owner: slot.owner(),
                id,
                producer,
                sink,
                cleanup: cleanup.clone(),
                cancel: cancel.clone(),
                state: state.clone(),
                previous,
                grace: self.cleanup_grace,
            })
            .instrument(span),
        );

        telemetry::record_generation_started(model.name());
        slot.active = Some(ActiveGeneration { id, cancel, cleanup, state, task });
    }

    /// Request cancellation of the in-flight generation.
    ///
    /// Returns whether a generation was in flight.
    pub fn cancel(&self, model: &Model) -> Result<bool, RuntimeError> {
        let slot = model.instance();
        let instance = slot
            .as_ref()
            .ok_or_else(|| RuntimeError::UninitializedModel(model.name().to_string()))?;
        match &instance.generation().active {
            Some(active) => {
                tracing::debug!(model = model.name(), generation = active.id, "cancel requested");
                active.cancel.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel the in-flight generation, if any, and wait for it to finish.
    pub(crate) async fn stop_active(&self, model: &Model) {
        let active = model
            .instance()
            .as_mut()
            .and_then(|instance| instance.generation_mut().active.take());
        if let Some(active) = active {
            stop_generation(active, self.cleanup_grace).await;
        }
    }

    /// Stop a generation detached from an instance that is being torn down.
    pub(crate) async fn stop_detached(&self, active: Option<ActiveGeneration>) {
        if let Some(active) = active {
            stop_generation(active, self.cleanup_grace).await;
        }
    }

    pub fn state(&self, model: &Model) -> GenerationState {
        model
            .instance()
            .as_ref()
            .map(|instance| instance.generation().state())
            .unwrap_or(GenerationState::Idle)
    }

    pub fn last_outcome(&self, model: &Model) -> Option<GenerationOutcome> {
        model
            .instance()
            .as_ref()
            .and_then(|instance| instance.generation().last_outcome())
    }
}

/// Report a generation that never started.
pub(crate) fn reject(model: &str, mut sink: ChunkSink, cleanup: &CleanupOnce, err: RuntimeError) -> RuntimeError {
    if err.is_warning() {
        tracing::warn!(model, error = %err, "generation rejected");
    } else {
        tracing::error!(model, error = %err, "generation rejected");
    }
    sink(ResponseChunk::error(err.user_message()));
    cleanup.fire();
    err
}

/// Cancel a generation and wait (bounded) for its task to deliver its final
/// chunk. Fires the cleanup sink if the task did not get to it.
async fn stop_generation(active: ActiveGeneration, grace: Duration) {
    let ActiveGeneration { id, cancel, cleanup, mut task, .. } = active;
    cancel.cancel();
    if tokio::time::timeout(grace, &mut task).await.is_err() {
        tracing::warn!(generation = id, ?grace, "generation did not stop in time, aborting");
        task.abort();
    }
    if cleanup.fire() {
        tracing::debug!(generation = id, "cleanup fired by stop");
    }
}

struct GenerationTask<P> {
    model: Arc<Model>,
    /// Slot the generation was started on; a replacement instance is not touched.
    owner: u64,
    id: u64,
    producer: P,
    sink: ChunkSink,
    cleanup: CleanupOnce,
    cancel: CancellationToken,
    state: Arc<Mutex<GenerationState>>,
    previous: Option<ActiveGeneration>,
    grace: Duration,
}

async fn run_generation<P: ChunkProducer>(task: GenerationTask<P>) {
    let GenerationTask {
        model,
        owner,
        id,
        mut producer,
        mut sink,
        cleanup,
        cancel,
        state,
        previous,
        grace,
    } = task;

    if let Some(previous) = previous {
        stop_generation(previous, grace).await;
    }

    let mut delivered: u64 = 0;
    let start = Instant::now();
    let mut counted = |chunk: ResponseChunk| {
        delivered += 1;
        sink(chunk)
    };
    let outcome = drive(&mut producer, &mut counted, &cancel, &state).await;
    *state.lock() = outcome.state();
    let span = tracing::Span::current();
    span.record("outcome", outcome.as_str());
    span.record("chunks", delivered);
    tracing::debug!("generation finished");
    telemetry::record_generation_finished(model.name(), outcome, start.elapsed());

    cleanup.fire();
    let mut slot = model.instance();
    if let Some(instance) = slot.as_mut() {
        instance.generation_mut().release(owner, id, outcome);
    }
}

async fn drive<P: ChunkProducer>(
    producer: &mut P,
    sink: &mut (dyn FnMut(ResponseChunk) + Send),
    cancel: &CancellationToken,
    state: &Mutex<GenerationState>,
) -> GenerationOutcome {
    let prepared = tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        result = producer.prepare() => Some(result),
    };
    match prepared {
        None => {
            sink(producer.cancel().await);
            return GenerationOutcome::Cancelled;
        }
        Some(Err(err)) => {
            tracing::error!(error = %err, "failed to feed generation input");
            sink(ResponseChunk::error(err.user_message()));
            return GenerationOutcome::Failed;
        }
        Some(Ok(())) => {}
    }

    *state.lock() = GenerationState::Streaming;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            item = producer.next_chunk() => Some(item),
        };
        match next {
            None => {
                sink(producer.cancel().await);
                return GenerationOutcome::Cancelled;
            }
            Some(Some(Ok(chunk))) => {
                let done = chunk.done;
                sink(chunk);
                if done {
                    return GenerationOutcome::Completed;
                }
            }
            Some(Some(Err(err))) => {
                tracing::error!(error = %err, "generation failed mid-stream");
                sink(ResponseChunk::error(err.user_message()));
                return GenerationOutcome::Failed;
            }
            Some(None) => {
                sink(ResponseChunk::final_text(String::new()));
                return GenerationOutcome::Completed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackendKind, ModelConfig};
    use crate::runtime::registry::EchoInstance;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a fixed script, pausing between items.
    struct Scripted {
        items: VecDeque<Result<ResponseChunk, RuntimeError>>,
        delay: Duration,
        fail_prepare: bool,
    }

    #[async_trait]
    impl ChunkProducer for Scripted {
        async fn prepare(&mut self) -> Result<(), RuntimeError> {
            if self.fail_prepare {
                return Err(RuntimeError::GenerationFailure("x.y.ImageException: too big".into()));
            }
            Ok(())
        }

        async fn next_chunk(&mut self) -> Option<Result<ResponseChunk, RuntimeError>> {
            tokio::time::sleep(self.delay).await;
            self.items.pop_front()
        }

        async fn cancel(&mut self) -> ResponseChunk {
            ResponseChunk::final_text("stopped")
        }
    }

    fn scripted(items: Vec<Result<ResponseChunk, RuntimeError>>) -> Scripted {
        Scripted { items: items.into(), delay: Duration::from_millis(5), fail_prepare: false }
    }

    fn ready_model() -> Arc<Model> {
        let model = Arc::new(Model::new("m", BackendKind::Echo, ModelConfig::default()));
        *model.instance() = Some(ModelInstance::Echo(EchoInstance::new("ready".into())));
        model
    }

    type Collected = Arc<Mutex<Vec<ResponseChunk>>>;

    fn sinks() -> (ChunkSink, CleanupFn, Collected, Arc<AtomicUsize>) {
        let chunks: Collected = Arc::default();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let c = chunks.clone();
        let n = cleanups.clone();
        (
            Box::new(move |chunk| c.lock().push(chunk)),
            Box::new(move || {
                n.fetch_add(1, Ordering::SeqCst);
            }),
            chunks,
            cleanups,
        )
    }

    async fn wait_idle(controller: &GenerationController, model: &Model) {
        for _ in 0..200 {
            if controller.state(model) == GenerationState::Idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("generation did not return to idle");
    }

    #[tokio::test]
    async fn completes_and_returns_to_idle() {
        let controller = GenerationController::default();
        let model = ready_model();
        let (sink, cleanup, chunks, cleanups) = sinks();
        let producer = scripted(vec![
            Ok(ResponseChunk::partial("a")),
            Ok(ResponseChunk::final_text("ab")),
            Ok(ResponseChunk::partial("never")),
        ]);

        controller.start(&model, sink, cleanup, |_| Ok(producer)).unwrap();
        wait_idle(&controller, &model).await;

        let chunks = chunks.lock();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].done);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(controller.last_outcome(&model), Some(GenerationOutcome::Completed));
    }

    #[tokio::test]
    async fn uninitialized_model_is_rejected() {
        let controller = GenerationController::default();
        let model = Arc::new(Model::new("cold", BackendKind::Echo, ModelConfig::default()));
        let (sink, cleanup, chunks, cleanups) = sinks();

        let err = controller
            .start(&model, sink, cleanup, |_| Ok(scripted(vec![])))
            .unwrap_err();

        assert_eq!(err, RuntimeError::UninitializedModel("cold".into()));
        let chunks = chunks.lock();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].done && chunks[0].is_error());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn prepare_failure_is_sanitized() {
        let controller = GenerationController::default();
        let model = ready_model();
        let (sink, cleanup, chunks, cleanups) = sinks();
        let mut producer = scripted(vec![]);
        producer.fail_prepare = true;

        controller.start(&model, sink, cleanup, |_| Ok(producer)).unwrap();
        wait_idle(&controller, &model).await;

        assert_eq!(chunks.lock().as_slice(), [ResponseChunk::error("too big")]);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(controller.last_outcome(&model), Some(GenerationOutcome::Failed));
    }

    #[tokio::test]
    async fn stream_ending_without_final_chunk_still_completes() {
        let controller = GenerationController::default();
        let model = ready_model();
        let (sink, cleanup, chunks, cleanups) = sinks();

        controller
            .start(&model, sink, cleanup, |_| Ok(scripted(vec![Ok(ResponseChunk::partial("x"))])))
            .unwrap();
        wait_idle(&controller, &model).await;

        let chunks = chunks.lock();
        assert_eq!(chunks.last().map(|c| c.done), Some(true));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_outside_runtime_is_rejected() {
        let controller = GenerationController::default();
        let model = ready_model();
        let (sink, cleanup, chunks, cleanups) = sinks();

        let err = controller
            .start(&model, sink, cleanup, |_| Ok(scripted(vec![])))
            .unwrap_err();

        assert!(matches!(err, RuntimeError::GenerationFailure(_)));
        let chunks = chunks.lock();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].done && chunks[0].is_error());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state(&model), GenerationState::Idle);
    }

    #[tokio::test]
    async fn outcome_is_not_recorded_on_replacement_instance() {
        let controller = GenerationController::default();
        let model = ready_model();
        let (sink, cleanup, _chunks, cleanups) = sinks();
        let mut producer = scripted(vec![Ok(ResponseChunk::final_text("late"))]);
        producer.delay = Duration::from_millis(50);

        controller.start(&model, sink, cleanup, |_| Ok(producer)).unwrap();
        *model.instance() = Some(ModelInstance::Echo(EchoInstance::new("fresh".into())));
        for _ in 0..200 {
            if cleanups.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(controller.last_outcome(&model), None);
    }

    #[tokio::test]
    async fn cancel_without_generation_reports_false() {
        let controller = GenerationController::default();
        let model = ready_model();
        assert_eq!(controller.cancel(&model), Ok(false));
    }
}
