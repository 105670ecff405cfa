//! Shared fixtures for runtime integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use ondevice_runtime::runtime::{
    EchoConfig, EngineFactory, EngineOptions, InferenceEngine, InferenceSession, SessionParams,
    SessionStream,
};
use ondevice_runtime::{
    BackendKind, ChunkSink, CleanupFn, ImageInput, Model, ModelConfig, ResponseChunk,
    RuntimeConfig, RuntimeDispatcher, RuntimeError,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Echo pacing short enough for tests, long enough to cancel mid-stream.
pub fn fast_config() -> RuntimeConfig {
    RuntimeConfig {
        echo: EchoConfig {
            char_delay: Duration::from_millis(2),
            trailing_pause: Duration::from_millis(10),
        },
        cleanup_grace: Duration::from_millis(500),
        ..RuntimeConfig::default()
    }
}

pub fn echo_model(name: &str) -> Arc<Model> {
    Arc::new(Model::new(name, BackendKind::Echo, ModelConfig::default()))
}

pub async fn ready_echo(dispatcher: &RuntimeDispatcher, name: &str) -> Arc<Model> {
    let model = echo_model(name);
    dispatcher.initialize(&model).await.unwrap();
    model
}

/// Collects chunks and counts cleanup calls for one generation.
#[derive(Clone, Default)]
pub struct Recorder {
    chunks: Arc<Mutex<Vec<ResponseChunk>>>,
    cleanups: Arc<AtomicUsize>,
    cleaned: Arc<Notify>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> ChunkSink {
        let chunks = self.chunks.clone();
        Box::new(move |chunk| chunks.lock().push(chunk))
    }

    /// Sink that runs `hook` after recording each chunk.
    pub fn sink_with<F>(&self, mut hook: F) -> ChunkSink
    where
        F: FnMut(&ResponseChunk, usize) + Send + 'static,
    {
        let chunks = self.chunks.clone();
        Box::new(move |chunk| {
            let count = {
                let mut chunks = chunks.lock();
                chunks.push(chunk.clone());
                chunks.len()
            };
            hook(&chunk, count);
        })
    }

    pub fn cleanup(&self) -> CleanupFn {
        let cleanups = self.cleanups.clone();
        let cleaned = self.cleaned.clone();
        Box::new(move || {
            cleanups.fetch_add(1, Ordering::SeqCst);
            cleaned.notify_one();
        })
    }

    pub async fn wait_cleanup(&self) {
        tokio::time::timeout(WAIT, self.cleaned.notified())
            .await
            .expect("cleanup callback did not fire");
    }

    pub async fn wait_chunks(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.chunks.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("chunks did not arrive");
    }

    pub fn chunks(&self) -> Vec<ResponseChunk> {
        self.chunks.lock().clone()
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

/// What a scripted session does when asked to generate.
#[derive(Clone, Debug)]
pub enum Step {
    Emit(&'static str, bool),
    Fail(&'static str),
    Pause(Duration),
}

/// Records every call the runtime makes into the scripted engine.
#[derive(Default)]
pub struct EngineLog {
    pub calls: Mutex<Vec<String>>,
}

impl EngineLog {
    pub fn push(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == call).count()
    }
}

/// Knobs for the scripted engine's failure paths.
#[derive(Clone, Default)]
pub struct Script {
    pub steps: Vec<Step>,
    pub fail_engine: Option<&'static str>,
    /// Sessions built after this many succeed fail instead.
    pub fail_session_after: Option<usize>,
    pub fail_session_close: bool,
    pub fail_engine_close: bool,
    /// Time each query chunk takes to feed, spent blocking the caller.
    pub feed_delay: Option<Duration>,
}

pub struct ScriptedFactory {
    pub script: Script,
    pub log: Arc<EngineLog>,
    pub options: Mutex<Option<EngineOptions>>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self { script, log: Arc::default(), options: Mutex::new(None) })
    }
}

impl EngineFactory for ScriptedFactory {
    fn create_engine(
        &self,
        options: &EngineOptions,
    ) -> Result<Arc<dyn InferenceEngine>, RuntimeError> {
        self.log.push("create_engine");
        *self.options.lock() = Some(options.clone());
        if let Some(msg) = self.script.fail_engine {
            return Err(RuntimeError::ConstructionFailure(msg.to_string()));
        }
        Ok(Arc::new(ScriptedEngine {
            script: self.script.clone(),
            log: self.log.clone(),
            sessions: AtomicUsize::new(0),
        }))
    }
}

struct ScriptedEngine {
    script: Script,
    log: Arc<EngineLog>,
    sessions: AtomicUsize,
}

impl InferenceEngine for ScriptedEngine {
    fn create_session(
        &self,
        params: &SessionParams,
    ) -> Result<Box<dyn InferenceSession>, RuntimeError> {
        let built = self.sessions.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("create_session top_k={}", params.top_k));
        if matches!(self.script.fail_session_after, Some(limit) if built >= limit) {
            return Err(RuntimeError::ConstructionFailure(
                "com.example.llm.SessionException: out of memory".into(),
            ));
        }
        Ok(Box::new(ScriptedSession {
            steps: self.script.steps.clone(),
            fail_close: self.script.fail_session_close,
            feed_delay: self.script.feed_delay,
            log: self.log.clone(),
        }))
    }

    fn close(&self) -> Result<(), RuntimeError> {
        self.log.push("engine.close");
        if self.script.fail_engine_close {
            return Err(RuntimeError::GenerationFailure("engine busy".into()));
        }
        Ok(())
    }
}

struct ScriptedSession {
    steps: Vec<Step>,
    fail_close: bool,
    feed_delay: Option<Duration>,
    log: Arc<EngineLog>,
}

impl InferenceSession for ScriptedSession {
    fn add_query_chunk(&mut self, text: &str) -> Result<(), RuntimeError> {
        if let Some(delay) = self.feed_delay {
            std::thread::sleep(delay);
        }
        self.log.push(format!("text:{text}"));
        Ok(())
    }

    fn add_image(&mut self, image: &ImageInput) -> Result<(), RuntimeError> {
        self.log.push(format!("image:{}", image.bytes().len()));
        Ok(())
    }

    fn generate_async(&mut self) -> Result<SessionStream, RuntimeError> {
        self.log.push("generate");
        let (sender, stream) = SessionStream::channel(4);
        let mut steps: VecDeque<Step> = self.steps.clone().into();
        tokio::spawn(async move {
            while let Some(step) = steps.pop_front() {
                let sent = match step {
                    Step::Emit(text, done) => sender.send(text, done).await,
                    Step::Fail(msg) => {
                        sender.fail(RuntimeError::GenerationFailure(msg.to_string())).await
                    }
                    Step::Pause(duration) => {
                        tokio::time::sleep(duration).await;
                        Ok(())
                    }
                };
                if sent.is_err() {
                    break;
                }
            }
        });
        Ok(stream)
    }

    fn cancel_async(&mut self) -> Result<(), RuntimeError> {
        self.log.push("cancel");
        Ok(())
    }

    fn size_in_tokens(&self, text: &str) -> Result<usize, RuntimeError> {
        if text == "boom" {
            return Err(RuntimeError::GenerationFailure("tokenizer failed".into()));
        }
        Ok(text.len())
    }

    fn close(&mut self) -> Result<(), RuntimeError> {
        self.log.push("session.close");
        if self.fail_close {
            return Err(RuntimeError::GenerationFailure("session busy".into()));
        }
        Ok(())
    }
}

pub fn native_model(name: &str, config: ModelConfig) -> Arc<Model> {
    Arc::new(Model::new(name, BackendKind::Native, config).with_path(format!("/models/{name}.bin")))
}

pub fn native_dispatcher(script: Script) -> (RuntimeDispatcher, Arc<ScriptedFactory>) {
    let factory = ScriptedFactory::new(script);
    let dispatcher = RuntimeDispatcher::with_engine_factory(&fast_config(), factory.clone());
    (dispatcher, factory)
}
