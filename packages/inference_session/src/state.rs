//! Session Lifecycle State
//!
//! Defines the externally observable state machine of an inference session.
//! The controller replaces the whole value on every transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The current lifecycle state of the inference session
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum GenerationState {
    /// No model loaded, no session handle held
    #[default]
    Idle,

    /// A model load is in flight
    LoadingModel,

    /// A session handle is ready and no request is in flight
    ModelLoaded { model: String },

    /// A generation request is in flight
    Generating {
        prompt: String,
        started_at: DateTime<Utc>,
        tokens_generated: u64,
    },

    /// The last request finished, normally or by abort
    Completed {
        prompt: String,
        token_count: u64,
        duration_ms: u64,
    },

    /// The last operation failed terminally
    Error {
        message: String,
        cause: Option<String>,
    },
}

impl GenerationState {
    /// Returns true if a new generation may be issued
    pub fn can_generate(&self) -> bool {
        matches!(
            self,
            GenerationState::ModelLoaded { .. } | GenerationState::Completed { .. }
        )
    }

    /// Returns true while the engine is doing work on our behalf
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            GenerationState::LoadingModel | GenerationState::Generating { .. }
        )
    }

    pub fn is_generating(&self) -> bool {
        matches!(self, GenerationState::Generating { .. })
    }

    /// Short human-readable name, used in logs and rejection messages
    pub fn label(&self) -> &'static str {
        match self {
            GenerationState::Idle => "idle",
            GenerationState::LoadingModel => "loading model",
            GenerationState::ModelLoaded { .. } => "model loaded",
            GenerationState::Generating { .. } => "generating",
            GenerationState::Completed { .. } => "completed",
            GenerationState::Error { .. } => "in error",
        }
    }

    /// Token count of the current or last generation, if any
    pub fn token_count(&self) -> Option<u64> {
        match self {
            GenerationState::Generating {
                tokens_generated, ..
            } => Some(*tokens_generated),
            GenerationState::Completed { token_count, .. } => Some(*token_count),
            _ => None,
        }
    }
}
