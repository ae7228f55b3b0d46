//! Facade-level errors.

use cosim_network::ConnectionError;
use thiserror::Error;

/// Errors surfaced synchronously by the participant facade.
#[derive(Debug, Error)]
pub enum ParticipantError {
    /// Malformed or contradictory configuration; never recoverable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A controller was created with an empty canonical name.
    #[error("controller name must not be empty")]
    InvalidName,

    /// A service with this (network, name) already exists with a different
    /// kind.
    #[error("duplicate service: {0}")]
    DuplicateService(String),

    /// A facade call with an invalid argument (e.g. `Pause` without a
    /// reason).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A facade call that is not legal right now (e.g. completing an async
    /// hook that is not pending).
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl From<cosim_config::ConfigError> for ParticipantError {
    fn from(e: cosim_config::ConfigError) -> Self {
        ParticipantError::Configuration(e.to_string())
    }
}
