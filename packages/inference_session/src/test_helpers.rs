use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::controller::SessionController;
use crate::engine::{EventSink, GenerateRequest, InferenceEngine, LoadConfig, SessionHandle};
use crate::error::SessionError;
use crate::resolver::{ModelReference, ModelResolver, ModelSource};
use crate::state::GenerationState;

/// Install a test-writer subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("inference_session=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// What the engine saw for one load call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadRecord {
    pub reference: ModelReference,
    pub context_length: u32,
    pub use_mmap: bool,
    pub use_mlock: bool,
}

#[derive(Default)]
struct ScriptState {
    next_handle: u64,
    fail_load: Option<String>,
    fail_generate: Option<String>,
    hold_loads: bool,
    held: Vec<oneshot::Sender<()>>,
    loads: Vec<LoadRecord>,
    requests: Vec<GenerateRequest>,
    sinks: Vec<EventSink>,
    aborted: Vec<SessionHandle>,
    released: Vec<SessionHandle>,
}

/// Engine whose generations are driven by the test through the recorded sinks.
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    script: Arc<Mutex<ScriptState>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_loads(&self, message: &str) {
        self.script.lock().unwrap().fail_load = Some(message.to_string());
    }

    pub fn succeed_loads(&self) {
        self.script.lock().unwrap().fail_load = None;
    }

    pub fn fail_generates(&self, message: &str) {
        self.script.lock().unwrap().fail_generate = Some(message.to_string());
    }

    /// Park every following load until [`ScriptedEngine::finish_held_load`]
    pub fn hold_loads(&self) {
        self.script.lock().unwrap().hold_loads = true;
    }

    pub fn finish_held_load(&self) {
        let mut script = self.script.lock().unwrap();
        script.hold_loads = false;
        if !script.held.is_empty() {
            let _ = script.held.remove(0).send(());
        }
    }

    /// Sink of the most recent generation
    pub fn sink(&self) -> EventSink {
        self.script
            .lock()
            .unwrap()
            .sinks
            .last()
            .cloned()
            .expect("no generation started")
    }

    pub fn loads(&self) -> Vec<LoadRecord> {
        self.script.lock().unwrap().loads.clone()
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.script.lock().unwrap().requests.clone()
    }

    pub fn aborted(&self) -> Vec<SessionHandle> {
        self.script.lock().unwrap().aborted.clone()
    }

    pub fn released(&self) -> Vec<SessionHandle> {
        self.script.lock().unwrap().released.clone()
    }
}

impl InferenceEngine for ScriptedEngine {
    async fn load(&self, config: LoadConfig) -> anyhow::Result<SessionHandle> {
        let gate = {
            let mut script = self.script.lock().unwrap();
            script.loads.push(LoadRecord {
                reference: config.reference.clone(),
                context_length: config.context_length,
                use_mmap: config.use_mmap,
                use_mlock: config.use_mlock,
            });
            if script.hold_loads {
                let (tx, rx) = oneshot::channel();
                script.held.push(tx);
                Some(rx)
            } else {
                None
            }
        };

        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let mut script = self.script.lock().unwrap();
        if let Some(message) = &script.fail_load {
            anyhow::bail!("{}", message);
        }
        script.next_handle += 1;
        Ok(SessionHandle(script.next_handle))
    }

    fn generate(
        &self,
        _handle: SessionHandle,
        request: GenerateRequest,
        sink: EventSink,
    ) -> anyhow::Result<()> {
        let mut script = self.script.lock().unwrap();
        if let Some(message) = &script.fail_generate {
            anyhow::bail!("{}", message);
        }
        script.requests.push(request);
        script.sinks.push(sink);
        Ok(())
    }

    fn abort(&self, handle: SessionHandle) {
        self.script.lock().unwrap().aborted.push(handle);
    }

    fn release(&self, handle: SessionHandle) {
        self.script.lock().unwrap().released.push(handle);
    }
}

/// Resolves every reference to an empty reader, except `missing.bin`.
#[derive(Clone, Debug, Default)]
pub struct StubResolver;

impl ModelResolver for StubResolver {
    fn resolve(&self, reference: &ModelReference) -> Result<ModelSource, SessionError> {
        if reference.to_string().ends_with("missing.bin") {
            return Err(SessionError::Resolve {
                reference: reference.to_string(),
                message: "not found".to_string(),
                source: Some(io::Error::from(io::ErrorKind::NotFound)),
            });
        }
        Ok(ModelSource::Reader(Box::new(io::empty())))
    }
}

/// Wait (bounded) until the controller's state satisfies `predicate`.
pub async fn settle(
    controller: &SessionController,
    predicate: impl FnMut(&GenerationState) -> bool,
) -> GenerationState {
    tokio::time::timeout(Duration::from_secs(5), controller.wait_for(predicate))
        .await
        .expect("timed out waiting for state")
        .expect("controller gone")
}
