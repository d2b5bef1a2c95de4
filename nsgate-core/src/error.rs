//! Error types for nsgate

use thiserror::Error;

use crate::types::IdKind;

/// nsgate error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Malformed caller input (arguments, ranges, command)
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },

    /// Namespace or process creation failed
    #[error("Resource error: {message}")]
    Resource {
        /// Error message
        message: String,
    },

    /// The peer closed its end of the sync channel before the expected handshake
    #[error("Sync channel closed by peer")]
    ChannelClosed,

    /// The parent/child handshake did not complete
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message
        message: String,
    },

    /// External ID mapping tool failed
    #[error("{kind} mapping failed: {message}")]
    Mapping {
        /// Which ID space was being mapped
        kind: IdKind,
        /// Error message
        message: String,
    },

    /// The namespace child could not be reaped
    #[error("Wait error: {message}")]
    Wait {
        /// Error message
        message: String,
    },

    /// The container runtime could not start the container
    #[error("Runtime error: {message}")]
    Runtime {
        /// Error message
        message: String,
    },

    /// Unexpected system call failure
    #[error("System error: {0}")]
    System(#[from] nix::Error),
}

impl Error {
    /// Shorthand for [`Error::InvalidConfig`]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::Protocol`]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Whether the error stems from caller input rather than a runtime failure
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::InvalidConfig { .. })
    }
}

/// Result type alias for nsgate operations
pub type Result<T> = std::result::Result<T, Error>;
