use std::io;

use thiserror::Error;

use crate::platform::{CoreId, Direction};

/// Result type alias for governor operations.
pub type Result<T> = std::result::Result<T, GovernorError>;

/// Errors raised by the hotplug engine and its collaborators.
#[derive(Debug, Error)]
pub enum GovernorError {
    /// No load reading could be computed for this core this round.
    #[error("load sample unavailable for cpu{core}")]
    SampleUnavailable { core: CoreId },

    /// A rejected attribute or config write. State is left untouched.
    #[error("invalid value for {attribute}: {reason}")]
    InvalidConfig { attribute: String, reason: String },

    #[error("unknown attribute: {0}")]
    UnknownAttribute(String),

    /// The platform refused or failed a core power transition.
    #[error("cpu{core} {direction} transition failed: {source}")]
    TransitionFailed {
        core: CoreId,
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// Platform data the engine can run without (e.g. frequency limits).
    #[error("configuration unavailable: {0}")]
    ConfigurationUnavailable(String),

    #[error("{context}: {source}")]
    Platform {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("config parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("status serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl GovernorError {
    pub fn invalid(attribute: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            attribute: attribute.into(),
            reason: reason.into(),
        }
    }

    pub fn platform(context: impl Into<String>, source: io::Error) -> Self {
        Self::Platform {
            context: context.into(),
            source,
        }
    }
}
