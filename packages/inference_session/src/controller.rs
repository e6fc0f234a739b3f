//! Session Controller
//!
//! An actor task owns the lifecycle state, the accumulated text and the
//! engine session handle. Callers talk to it through a cloneable
//! [`SessionController`] handle; the engine talks to it through
//! [`EventSink`]s feeding an unbounded inbox. Because only the actor writes,
//! state and text never need a lock.
//!
//! ## Epochs
//!
//! Every load, generate, abort and release bumps the epoch. Engine messages
//! carry the epoch they were issued under and anything older than the current
//! epoch is dropped, so a generation that was aborted can never leak tokens
//! into the one that replaced it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::accumulator::ResultAccumulator;
use crate::channel::{EventFanout, EventReceiver};
use crate::config::SessionConfig;
use crate::engine::{EventSink, GenerateRequest, InferenceEngine, LoadConfig, SessionHandle};
use crate::error::SessionError;
use crate::event::{Envelope, Epoch, GenerationEvent};
use crate::resolver::{ModelReference, ModelResolver};
use crate::state::GenerationState;

/// Messages from engine-side activity to the actor
#[derive(Debug)]
pub(crate) enum Inbound {
    Event(Envelope),
    LoadFinished {
        epoch: Epoch,
        model: String,
        result: Result<SessionHandle, SessionError>,
    },
}

/// Commands that can be sent to the session actor
enum SessionCommand {
    Load {
        reference: String,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Generate {
        prompt: String,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Abort {
        respond_to: oneshot::Sender<()>,
    },
    Release {
        respond_to: oneshot::Sender<()>,
    },
    SubscribeEvents {
        respond_to: oneshot::Sender<EventReceiver<GenerationEvent>>,
    },
    GetDroppedEvents {
        respond_to: oneshot::Sender<u64>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to communicate with a session actor
#[derive(Clone)]
pub struct SessionController {
    sender: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<GenerationState>,
    text_rx: watch::Receiver<String>,
}

impl SessionController {
    /// Spawn the session actor on the current tokio runtime.
    ///
    /// The engine lives as long as the actor; it is released by
    /// [`SessionController::shutdown`] or when the last handle is dropped.
    pub fn spawn<E, R>(engine: E, resolver: R, config: SessionConfig) -> Result<Self, SessionError>
    where
        E: InferenceEngine,
        R: ModelResolver,
    {
        config.validate()?;

        let (sender, receiver) = mpsc::channel(config.command_capacity);
        let actor = SessionActor::new(Arc::new(engine), Arc::new(resolver), config, receiver);
        let state_rx = actor.state_tx.subscribe();
        let text_rx = actor.text_tx.subscribe();

        tokio::spawn(async move {
            actor.run().await;
        });

        Ok(Self {
            sender,
            state_rx,
            text_rx,
        })
    }

    /// Start loading `reference`. Returns once the load is issued.
    pub async fn load(&self, reference: &str) -> Result<(), SessionError> {
        let reference = reference.to_string();
        self.request(|respond_to| SessionCommand::Load {
            reference,
            respond_to,
        })
        .await?
    }

    /// Start generating for `prompt`. Returns once the request is issued.
    pub async fn generate(&self, prompt: &str) -> Result<(), SessionError> {
        let prompt = prompt.to_string();
        self.request(|respond_to| SessionCommand::Generate { prompt, respond_to })
            .await?
    }

    /// Stop the in-flight load or generation, if any.
    ///
    /// When this returns the state is no longer active.
    pub async fn abort(&self) -> Result<(), SessionError> {
        self.request(|respond_to| SessionCommand::Abort { respond_to })
            .await
    }

    /// Drop the loaded model and return to idle
    pub async fn release(&self) -> Result<(), SessionError> {
        self.request(|respond_to| SessionCommand::Release { respond_to })
            .await
    }

    /// Release everything and stop the actor. Idempotent.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        match self
            .request(|respond_to| SessionCommand::Shutdown { respond_to })
            .await
        {
            Err(SessionError::ControllerGone) => Ok(()),
            other => other,
        }
    }

    /// Subscribe to live progress events.
    ///
    /// The subscription is lossy under overflow: intermediate `Ongoing`
    /// events may be dropped, boundary events never are. Use [`Self::text`]
    /// for the complete result.
    pub async fn subscribe_events(&self) -> Result<EventReceiver<GenerationEvent>, SessionError> {
        self.request(|respond_to| SessionCommand::SubscribeEvents { respond_to })
            .await
    }

    /// Live events evicted so far across all subscribers
    pub async fn dropped_events(&self) -> Result<u64, SessionError> {
        self.request(|respond_to| SessionCommand::GetDroppedEvents { respond_to })
            .await
    }

    pub fn state(&self) -> GenerationState {
        self.state_rx.borrow().clone()
    }

    pub fn text(&self) -> String {
        self.text_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<GenerationState> {
        self.state_rx.clone()
    }

    pub fn subscribe_text(&self) -> watch::Receiver<String> {
        self.text_rx.clone()
    }

    /// Wait until the state satisfies `predicate` and return it
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&GenerationState) -> bool,
    ) -> Result<GenerationState, SessionError> {
        let mut rx = self.state_rx.clone();
        let state = rx
            .wait_for(|state| predicate(state))
            .await
            .map_err(|_| SessionError::ControllerGone)?;
        Ok(state.clone())
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| SessionError::ControllerGone)?;
        rx.await.map_err(|_| SessionError::ControllerGone)
    }
}

/// The actor that owns one inference session
struct SessionActor<E, R> {
    engine: Arc<E>,
    resolver: Arc<R>,
    config: SessionConfig,
    receiver: mpsc::Receiver<SessionCommand>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    state_tx: watch::Sender<GenerationState>,
    text_tx: watch::Sender<String>,
    events: EventFanout<GenerationEvent>,
    accumulator: ResultAccumulator,
    epoch: Epoch,
    handle: Option<SessionHandle>,
    load_task: Option<JoinHandle<()>>,
    /// Sink of the generation in flight
    sink: Option<EventSink>,
}

impl<E: InferenceEngine, R: ModelResolver> SessionActor<E, R> {
    fn new(
        engine: Arc<E>,
        resolver: Arc<R>,
        config: SessionConfig,
        receiver: mpsc::Receiver<SessionCommand>,
    ) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(GenerationState::Idle);
        let (text_tx, _) = watch::channel(String::new());
        let events = EventFanout::new(config.event_capacity);

        Self {
            engine,
            resolver,
            config,
            receiver,
            inbox,
            inbox_tx,
            state_tx,
            text_tx,
            events,
            accumulator: ResultAccumulator::new(),
            epoch: 0,
            handle: None,
            load_task: None,
            sink: None,
        }
    }

    async fn run(mut self) {
        debug!("Session actor started");

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd) {
                            break;
                        }
                    }
                    None => {
                        // Every handle is gone
                        self.teardown();
                        break;
                    }
                },
                Some(msg) = self.inbox.recv() => self.handle_inbound(msg),
            }
        }

        debug!("Session actor stopped");
    }

    /// Apply one caller command. Returns false once the actor should stop.
    fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Load {
                reference,
                respond_to,
            } => {
                let _ = respond_to.send(self.load(reference));
            }
            SessionCommand::Generate { prompt, respond_to } => {
                let _ = respond_to.send(self.generate(prompt));
            }
            SessionCommand::Abort { respond_to } => {
                self.abort();
                let _ = respond_to.send(());
            }
            SessionCommand::Release { respond_to } => {
                self.release();
                let _ = respond_to.send(());
            }
            SessionCommand::SubscribeEvents { respond_to } => {
                let _ = respond_to.send(self.events.subscribe());
            }
            SessionCommand::GetDroppedEvents { respond_to } => {
                let _ = respond_to.send(self.events.dropped());
            }
            SessionCommand::Shutdown { respond_to } => {
                info!("Session shutting down");
                self.teardown();
                let _ = respond_to.send(());
                return false;
            }
        }
        true
    }

    fn handle_inbound(&mut self, msg: Inbound) {
        match msg {
            Inbound::Event(envelope) => self.handle_event(envelope),
            Inbound::LoadFinished {
                epoch,
                model,
                result,
            } => self.handle_load_finished(epoch, model, result),
        }
    }

    fn load(&mut self, reference: String) -> Result<(), SessionError> {
        if self.state().is_active() {
            return Err(self.reject("load"));
        }

        if let Some(handle) = self.handle.take() {
            info!("Releasing {} before loading {}", handle, reference);
            self.engine.release(handle);
        }

        let epoch = self.next_epoch();
        let reference = ModelReference::parse(&reference);
        let model = reference.to_string();
        info!("Loading model {} (epoch {})", model, epoch);
        self.set_state(GenerationState::LoadingModel);

        let engine = self.engine.clone();
        let resolver = self.resolver.clone();
        let config = self.config.clone();
        let inbox = self.inbox_tx.clone();
        self.load_task = Some(tokio::spawn(async move {
            let result = load_model(engine, resolver, reference, &config).await;
            let _ = inbox.send(Inbound::LoadFinished {
                epoch,
                model,
                result,
            });
        }));

        Ok(())
    }

    fn handle_load_finished(
        &mut self,
        epoch: Epoch,
        model: String,
        result: Result<SessionHandle, SessionError>,
    ) {
        if epoch != self.epoch || self.state() != GenerationState::LoadingModel {
            debug!(
                "Discarding load completion from epoch {} (current {})",
                epoch, self.epoch
            );
            if let Ok(handle) = result {
                info!("Releasing {} from a superseded load", handle);
                self.engine.release(handle);
            }
            return;
        }

        self.load_task = None;
        match result {
            Ok(handle) => {
                info!("Model {} loaded as {}", model, handle);
                self.handle = Some(handle);
                self.events.publish(&GenerationEvent::Loaded {
                    model: model.clone(),
                });
                self.set_state(GenerationState::ModelLoaded { model });
            }
            Err(err) => {
                error!("Model load failed: {}", err);
                self.fail(&err);
            }
        }
    }

    fn generate(&mut self, prompt: String) -> Result<(), SessionError> {
        let handle = match (self.state().can_generate(), self.handle) {
            (true, Some(handle)) => handle,
            _ => return Err(self.reject("generate")),
        };

        let epoch = self.next_epoch();
        self.accumulator.reset();
        self.publish_text();

        let sink = EventSink::new(epoch, self.inbox_tx.clone());
        info!(
            "Generation started on {} (epoch {}, {} prompt bytes)",
            handle,
            epoch,
            prompt.len()
        );
        self.set_state(GenerationState::Generating {
            prompt: prompt.clone(),
            started_at: Utc::now(),
            tokens_generated: 0,
        });

        let request = GenerateRequest {
            prompt,
            partial_emission: true,
        };
        match self.engine.generate(handle, request, sink.clone()) {
            Ok(()) => self.sink = Some(sink),
            Err(source) => {
                sink.stop();
                let err = SessionError::Generation {
                    message: source.to_string(),
                    source: Some(source),
                };
                error!("Engine refused generation: {}", err);
                self.fail(&err);
            }
        }

        Ok(())
    }

    fn handle_event(&mut self, envelope: Envelope) {
        if envelope.epoch != self.epoch {
            debug!(
                "Discarding stale {:?} from epoch {} (current {})",
                envelope.event, envelope.epoch, self.epoch
            );
            return;
        }

        let GenerationState::Generating {
            prompt, started_at, ..
        } = self.state()
        else {
            debug!(
                "Ignoring {:?} while {}",
                envelope.event,
                self.state().label()
            );
            return;
        };

        let next = match &envelope.event {
            GenerationEvent::Started { .. } => {
                debug!("Engine started generating (epoch {})", envelope.epoch);
                None
            }
            GenerationEvent::Ongoing {
                fragment,
                token_count,
            } => {
                self.accumulator.append(fragment);
                self.publish_text();
                Some(GenerationState::Generating {
                    prompt,
                    started_at,
                    tokens_generated: *token_count,
                })
            }
            GenerationEvent::Done {
                token_count,
                duration_ms,
                ..
            } => {
                self.stop_request();
                if *token_count != self.accumulator.token_count() {
                    warn!(
                        "Engine reported {} tokens but {} fragments were delivered",
                        token_count,
                        self.accumulator.token_count()
                    );
                }
                info!(
                    "Generation completed: {} tokens in {}ms",
                    token_count, duration_ms
                );
                Some(GenerationState::Completed {
                    prompt,
                    token_count: *token_count,
                    duration_ms: *duration_ms,
                })
            }
            GenerationEvent::Error { message } => {
                self.stop_request();
                error!("Generation failed: {}", message);
                Some(GenerationState::Error {
                    message: SessionError::Generation {
                        message: message.clone(),
                        source: None,
                    }
                    .to_string(),
                    cause: None,
                })
            }
            GenerationEvent::Loaded { .. } => {
                debug!("Ignoring load event from a generation sink");
                return;
            }
        };

        self.events.publish(&envelope.event);
        if let Some(state) = next {
            self.set_state(state);
        }
    }

    fn abort(&mut self) {
        match self.state() {
            GenerationState::Generating {
                prompt,
                started_at,
                tokens_generated,
            } => {
                self.next_epoch();
                self.stop_request();
                if let Some(handle) = self.handle {
                    self.engine.abort(handle);
                }
                let duration_ms = elapsed_ms(started_at);
                info!(
                    "Generation aborted after {} tokens in {}ms",
                    tokens_generated, duration_ms
                );
                self.set_state(GenerationState::Completed {
                    prompt,
                    token_count: tokens_generated,
                    duration_ms,
                });
            }
            GenerationState::LoadingModel => {
                self.next_epoch();
                self.cancel_load();
                info!("Model load aborted");
                self.set_state(GenerationState::Idle);
            }
            state => debug!("Nothing to abort while {}", state.label()),
        }
    }

    fn release(&mut self) {
        let state = self.state();
        if state.is_generating() {
            self.stop_request();
            if let Some(handle) = self.handle {
                self.engine.abort(handle);
            }
        }
        self.cancel_load();
        self.next_epoch();

        if let Some(handle) = self.handle.take() {
            info!("Releasing {}", handle);
            self.engine.release(handle);
        }
        if state != GenerationState::Idle {
            self.set_state(GenerationState::Idle);
        }
    }

    fn teardown(&mut self) {
        self.release();
        self.events.close();
    }

    fn fail(&mut self, err: &SessionError) {
        self.set_state(GenerationState::Error {
            message: err.to_string(),
            cause: describe_cause(err),
        });
    }

    /// Mirror the accumulated text to text subscribers
    fn publish_text(&self) {
        let text = self.accumulator.text();
        self.text_tx.send_modify(|published| {
            published.clear();
            published.push_str(text);
        });
    }

    fn reject(&self, operation: &'static str) -> SessionError {
        let state = self.state_tx.borrow().label();
        warn!("Cannot {} while {}", operation, state);
        SessionError::InvalidOperation { operation, state }
    }

    /// Tell the engine-side request to stop emitting
    fn stop_request(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
    }

    fn cancel_load(&mut self) {
        if let Some(task) = self.load_task.take() {
            task.abort();
        }
    }

    fn next_epoch(&mut self) -> Epoch {
        self.epoch += 1;
        self.epoch
    }

    fn state(&self) -> GenerationState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&mut self, state: GenerationState) {
        let old = self.state_tx.send_replace(state);
        debug!(
            "State changed: {} -> {}",
            old.label(),
            self.state_tx.borrow().label()
        );
    }
}

async fn load_model<E, R>(
    engine: Arc<E>,
    resolver: Arc<R>,
    reference: ModelReference,
    config: &SessionConfig,
) -> Result<SessionHandle, SessionError>
where
    E: InferenceEngine,
    R: ModelResolver,
{
    let to_resolve = reference.clone();
    let source = tokio::task::spawn_blocking(move || resolver.resolve(&to_resolve))
        .await
        .map_err(|e| SessionError::Resolve {
            reference: reference.to_string(),
            message: format!("resolver task failed: {}", e),
            source: None,
        })??;

    let load_config = LoadConfig {
        use_mmap: config.use_mmap && reference.supports_mmap(),
        use_mlock: config.use_mlock,
        context_length: config.context_length,
        source,
        reference: reference.clone(),
    };

    engine
        .load(load_config)
        .await
        .map_err(|source| SessionError::Load {
            reference: reference.to_string(),
            source,
        })
}

fn elapsed_ms(started_at: DateTime<Utc>) -> u64 {
    (Utc::now() - started_at).num_milliseconds().max(0) as u64
}

/// Render the source chain of `err`, outermost first
fn describe_cause(err: &SessionError) -> Option<String> {
    let mut causes = Vec::new();
    let mut current = std::error::Error::source(err);
    while let Some(cause) = current {
        causes.push(cause.to_string());
        current = std::error::Error::source(cause);
    }
    if causes.is_empty() {
        None
    } else {
        Some(causes.join(": "))
    }
}
