//! Inference Session - lifecycle control for one on-device language model
//!
//! This crate drives a single inference session: load a model, run one
//! generation at a time, stream progress, abort, release. The backend is
//! anything implementing [`InferenceEngine`]; it knows nothing about tokio
//! and reports back through an [`EventSink`].
//!
//! Observers get three views:
//! - [`SessionController::subscribe_state`] for the lifecycle state,
//! - [`SessionController::subscribe_text`] for the complete accumulated text,
//! - [`SessionController::subscribe_events`] for live events, lossy under overflow.
//!
//! # Example
//!
//! ```no_run
//! use inference_session::{FsResolver, GenerationState, SessionConfig, SessionController};
//! # use inference_session::{EventSink, GenerateRequest, InferenceEngine, LoadConfig, SessionHandle};
//! # struct MyEngine;
//! # impl InferenceEngine for MyEngine {
//! #     async fn load(&self, _: LoadConfig) -> anyhow::Result<SessionHandle> { Ok(SessionHandle(1)) }
//! #     fn generate(&self, _: SessionHandle, _: GenerateRequest, _: EventSink) -> anyhow::Result<()> { Ok(()) }
//! #     fn abort(&self, _: SessionHandle) {}
//! #     fn release(&self, _: SessionHandle) {}
//! # }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SessionConfig::load(None).unwrap();
//!     let session = SessionController::spawn(MyEngine, FsResolver, config).unwrap();
//!
//!     session.load("/models/tiny.gguf").await.unwrap();
//!     session
//!         .wait_for(|state| !state.is_active())
//!         .await
//!         .unwrap();
//!
//!     session.generate("Why is the sky blue?").await.unwrap();
//!     let mut text = session.subscribe_text();
//!     while text.changed().await.is_ok() {
//!         println!("{}", *text.borrow());
//!         if !session.state().is_generating() {
//!             break;
//!         }
//!     }
//!
//!     if let GenerationState::Completed { token_count, duration_ms, .. } = session.state() {
//!         println!("{} tokens in {}ms", token_count, duration_ms);
//!     }
//!     session.shutdown().await.unwrap();
//! }
//! ```

mod accumulator;
pub mod channel;
mod config;
mod controller;
pub mod engine;
mod error;
pub mod event;
pub mod resolver;
mod state;

#[cfg(test)]
mod test_helpers;

pub use accumulator::ResultAccumulator;
pub use channel::{EventFanout, EventReceiver, EventSender, Evictable, channel};
pub use config::{ENV_PREFIX, SessionConfig};
pub use controller::SessionController;
pub use engine::{EventSink, GenerateRequest, InferenceEngine, LoadConfig, SessionHandle, SinkClosed};
pub use error::SessionError;
pub use event::{Envelope, Epoch, GenerationEvent};
pub use resolver::{FsResolver, ModelReference, ModelResolver, ModelSource};
pub use state::GenerationState;
