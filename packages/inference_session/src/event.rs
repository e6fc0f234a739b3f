use serde::{Deserialize, Serialize};

use crate::channel::Evictable;

/// Generation epoch. Bumped by the controller on every load, generate, abort
/// and release; events carrying any other epoch are stale.
pub type Epoch = u64;

/// Events describing the progress of a load or a generation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum GenerationEvent {
    /// A model finished loading
    Loaded { model: String },

    /// The engine began processing a prompt
    Started { prompt: String },

    /// A partial fragment; `token_count` is the engine's cumulative count
    Ongoing { fragment: String, token_count: u64 },

    /// Generation finished normally
    Done {
        text: String,
        token_count: u64,
        duration_ms: u64,
    },

    /// Generation failed
    Error { message: String },
}

impl GenerationEvent {
    /// Boundary events start or terminate a phase and must never be lost.
    pub fn is_boundary(&self) -> bool {
        !matches!(self, GenerationEvent::Ongoing { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationEvent::Done { .. } | GenerationEvent::Error { .. }
        )
    }
}

impl Evictable for GenerationEvent {
    fn is_evictable(&self) -> bool {
        !self.is_boundary()
    }
}

/// An engine event tagged with the epoch of the request that produced it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub epoch: Epoch,
    pub event: GenerationEvent,
}
