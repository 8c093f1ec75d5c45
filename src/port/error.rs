//! Port-specific error types.
//!
//! Every transport reports failures through [`PortError`]. Errors carry the
//! resource string where one is known so the caller can decide what to do
//! with the port (retry, close, abort the measurement).

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during port operations.
#[derive(Debug, Error)]
pub enum PortError {
    /// The resource string matches no transport kind, or the transport
    /// constructor failed.
    #[error("Cannot create port for '{resource}': {reason}")]
    Construction { resource: String, reason: String },

    /// The specified device was not found on the system.
    #[error("Port not found: {0}")]
    NotFound(String),

    /// No data or no terminator arrived within the configured timeout.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The instrument did not answer at all.
    #[error("Port '{kind}' with ID '{resource}' does not respond. Check port properties, e.g. timeout, EOL")]
    NoResponse { kind: String, resource: String },

    /// Received bytes could not be decoded with the configured encoding.
    #[error("Unable to decode the reading from '{resource}' as {encoding}")]
    Decode { resource: String, encoding: String },

    /// Attempted to use a port that's not open.
    #[error("Port is not open")]
    NotOpen,

    /// The VISA resource manager could not be instantiated.
    #[error("VISA backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A VISA call failed.
    #[error("VISA error on '{resource}': {message}")]
    Visa { resource: String, message: String },

    /// Port configuration failed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A Prologix controller is missing or misbehaved.
    #[error("Prologix controller error: {0}")]
    Prologix(String),

    /// An I/O error occurred during port operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialport-specific error occurred.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl PortError {
    /// Create a NotFound error from a port name.
    pub fn not_found(port_name: impl Into<String>) -> Self {
        Self::NotFound(port_name.into())
    }

    /// Create a Config error from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a Timeout error from a duration.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout(duration)
    }

    /// Create a Construction error.
    pub fn construction(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Construction {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Create a Visa error.
    pub fn visa(resource: impl Into<String>, message: impl ToString) -> Self {
        Self::Visa {
            resource: resource.into(),
            message: message.to_string(),
        }
    }

    /// Whether the caller should close the port before trying again.
    ///
    /// A port that did not answer, or whose bytes could not be decoded, is
    /// most likely misconfigured (baud rate, terminator); reopening it with
    /// fresh settings is the usual recovery.
    pub fn requires_close(&self) -> bool {
        matches!(self, Self::NoResponse { .. } | Self::Decode { .. })
    }

    /// Whether this error is a timeout of any flavour.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::NoResponse { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}
