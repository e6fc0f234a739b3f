//! Error types and stable error codes.

/// Errors produced by the session controller and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The model reference could not be turned into a readable source
    #[error("failed to resolve model `{reference}`: {message}")]
    Resolve {
        reference: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The engine refused or failed to load the model
    #[error("failed to load model `{reference}`")]
    Load {
        reference: String,
        #[source]
        source: anyhow::Error,
    },

    /// The engine reported a failure while generating
    #[error("generation failed: {message}")]
    Generation {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Operation not allowed in the current lifecycle state
    #[error("cannot {operation} while {state}")]
    InvalidOperation {
        operation: &'static str,
        state: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The controller task has shut down
    #[error("session controller is gone")]
    ControllerGone,
}

impl SessionError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Resolve { .. } | Self::Load { .. } => "load_failure",
            Self::Generation { .. } => "generation_failure",
            Self::InvalidOperation { .. } => "invalid_operation",
            Self::Config(_) => "config",
            Self::ControllerGone => "controller_gone",
        }
    }

    /// Whether this error is a rejected no-op rather than a failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::InvalidOperation { .. })
    }
}

impl From<figment::Error> for SessionError {
    fn from(err: figment::Error) -> Self {
        SessionError::Config(err.to_string())
    }
}
