//! Contract between the session controller and an inference backend.
//!
//! The engine does its work on its own workers. Progress comes back through
//! an [`EventSink`], which never blocks the caller and may be used from any
//! thread.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::controller::Inbound;
use crate::event::{Envelope, Epoch, GenerationEvent};
use crate::resolver::{ModelReference, ModelSource};

/// Engine-issued identifier for one loaded model instance
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Everything the engine needs to load a model
#[derive(Debug)]
pub struct LoadConfig {
    pub reference: ModelReference,
    pub source: ModelSource,
    pub context_length: u32,
    pub use_mmap: bool,
    pub use_mlock: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerateRequest {
    pub prompt: String,
    /// Emit intermediate fragments as they are produced
    pub partial_emission: bool,
}

/// An inference backend driven by the session controller
pub trait InferenceEngine: Send + Sync + 'static {
    /// Load a model and return a handle to it
    fn load(
        &self,
        config: LoadConfig,
    ) -> impl Future<Output = anyhow::Result<SessionHandle>> + Send;

    /// Start generating for `request`, reporting through `sink`.
    ///
    /// Must return promptly; the work itself runs in the background.
    fn generate(
        &self,
        handle: SessionHandle,
        request: GenerateRequest,
        sink: EventSink,
    ) -> anyhow::Result<()>;

    /// Best-effort request to stop an in-flight generation
    fn abort(&self, handle: SessionHandle);

    /// Free engine resources held for `handle`. Must be idempotent.
    fn release(&self, handle: SessionHandle);
}

/// The generation behind a sink has been stopped by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("generation request was stopped")]
pub struct SinkClosed;

/// Engine-facing emitter for one generation request.
///
/// Events go onto the controller's unbounded inbox: `emit` never blocks and
/// the controller applies no backpressure. An engine that can outrun the
/// controller should pace itself or stop once [`EventSink::is_stopped`].
#[derive(Clone)]
pub struct EventSink {
    epoch: Epoch,
    tx: mpsc::UnboundedSender<Inbound>,
    stopped: Arc<AtomicBool>,
}

impl EventSink {
    pub(crate) fn new(epoch: Epoch, tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self {
            epoch,
            tx,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Forward an event to the controller.
    ///
    /// Fails once the request has been stopped (finished, aborted or
    /// released); the engine should then stop producing for it.
    pub fn emit(&self, event: GenerationEvent) -> Result<(), SinkClosed> {
        if self.is_stopped() {
            return Err(SinkClosed);
        }
        self.forward(event)
    }

    pub fn started(&self, prompt: impl Into<String>) -> Result<(), SinkClosed> {
        self.emit(GenerationEvent::Started {
            prompt: prompt.into(),
        })
    }

    pub fn token(
        &self,
        fragment: impl Into<String>,
        token_count: u64,
    ) -> Result<(), SinkClosed> {
        self.emit(GenerationEvent::Ongoing {
            fragment: fragment.into(),
            token_count,
        })
    }

    pub fn done(
        &self,
        text: impl Into<String>,
        token_count: u64,
        duration_ms: u64,
    ) -> Result<(), SinkClosed> {
        self.emit(GenerationEvent::Done {
            text: text.into(),
            token_count,
            duration_ms,
        })
    }

    pub fn error(&self, message: impl Into<String>) -> Result<(), SinkClosed> {
        self.emit(GenerationEvent::Error {
            message: message.into(),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.tx.is_closed()
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn forward(&self, event: GenerationEvent) -> Result<(), SinkClosed> {
        self.tx
            .send(Inbound::Event(Envelope {
                epoch: self.epoch,
                event,
            }))
            .map_err(|_| SinkClosed)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("epoch", &self.epoch)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
