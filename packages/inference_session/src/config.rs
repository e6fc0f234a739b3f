use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SessionError;

// =============================================================================
// Session config (figment-deserialized from defaults / TOML file / env vars)
// =============================================================================
//
//   session.toml:    context_length = 4096
//
//   env var:         INFERENCE_SESSION_CONTEXT_LENGTH=4096

/// Env var prefix for overrides.
pub const ENV_PREFIX: &str = "INFERENCE_SESSION_";

/// Tunables for a session controller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Context length requested from the engine on load
    #[serde(default = "default_context_length")]
    pub context_length: u32,
    /// Ask the engine to memory-map model files (ignored for content references)
    #[serde(default = "default_use_mmap")]
    pub use_mmap: bool,
    #[serde(default)]
    pub use_mlock: bool,
    /// Pending live events per subscriber before drop-oldest kicks in
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Pending caller commands before callers wait
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            context_length: default_context_length(),
            use_mmap: default_use_mmap(),
            use_mlock: false,
            event_capacity: default_event_capacity(),
            command_capacity: default_command_capacity(),
        }
    }
}

fn default_context_length() -> u32 {
    2048
}
fn default_use_mmap() -> bool {
    true
}
fn default_event_capacity() -> usize {
    crate::channel::DEFAULT_CAPACITY
}
fn default_command_capacity() -> usize {
    32
}

impl SessionConfig {
    /// Layer defaults → optional TOML file → `INFERENCE_SESSION_*` env vars.
    pub fn load(config_file: Option<&Path>) -> Result<Self, SessionError> {
        let config: SessionConfig = Self::figment(config_file).extract()?;
        config.validate()?;
        debug!("Loaded session config: {:?}", config);
        Ok(config)
    }

    /// The figment behind [`SessionConfig::load`], for callers that merge
    /// their own providers on top.
    pub fn figment(config_file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(SessionConfig::default()));
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.context_length == 0 {
            return Err(SessionError::Config(
                "context_length must be greater than zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SessionError::Config(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        if self.command_capacity == 0 {
            return Err(SessionError::Config(
                "command_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
