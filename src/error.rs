//! Error types and handling for Bankwarden
//!
//! This module defines the error types used throughout the supervisor.
//! Acquisition and bus failures are structured so callers can degrade a
//! cycle instead of aborting it; only self-test failures gate operation.

use thiserror::Error;

/// Result type alias for Bankwarden operations
pub type Result<T> = std::result::Result<T, BmsError>;

/// Main error type for Bankwarden
#[derive(Debug, Error)]
pub enum BmsError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Network-related errors (connect, send, receive)
    #[error("Network error: {message}")]
    Network { message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Response frame shorter than the minimum header + CRC
    #[error("Short frame: {len} bytes")]
    ShortFrame { len: usize },

    /// Response frame length disagrees with its byte count
    #[error("Length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Response CRC disagrees with the recomputed one
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Response header does not match the request
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Device answered with a Modbus exception response
    #[error("Modbus exception code {code}")]
    ModbusException { code: u8 },

    /// Temperature acquisition failed after all retries
    #[error("Acquisition error: {endpoint} failed after {attempts} attempts: {source}")]
    Acquisition {
        endpoint: String,
        attempts: u32,
        #[source]
        source: Box<BmsError>,
    },

    /// Shared hardware bus lock not acquired in time
    #[error("Bus timeout: {operation}")]
    BusTimeout { operation: String },

    /// Hardware bus access failure
    #[error("Bus I/O error: {message}")]
    BusIo { message: String },

    /// Balancing refused or aborted by an interlock
    #[error("Safety interlock: {reason}")]
    SafetyInterlock { reason: String },

    /// HTTP/Web server errors
    #[error("Web server error: {message}")]
    Web { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl BmsError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>, M: Into<String>>(field: S, message: M) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a new protocol (header mismatch) error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Wrap the last failure of an exhausted acquisition
    pub fn acquisition<S: Into<String>>(endpoint: S, attempts: u32, source: BmsError) -> Self {
        Self::Acquisition {
            endpoint: endpoint.into(),
            attempts,
            source: Box::new(source),
        }
    }

    /// Create a new bus lock timeout error
    pub fn bus_timeout<S: Into<String>>(operation: S) -> Self {
        Self::BusTimeout {
            operation: operation.into(),
        }
    }

    /// Create a new bus I/O error
    pub fn bus_io<S: Into<String>>(message: S) -> Self {
        Self::BusIo {
            message: message.into(),
        }
    }

    /// Create a new safety interlock error
    pub fn interlock<S: Into<String>>(reason: S) -> Self {
        Self::SafetyInterlock {
            reason: reason.into(),
        }
    }

    /// Create a new web error
    pub fn web<S: Into<String>>(message: S) -> Self {
        Self::Web {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Whether this error describes a malformed response frame
    pub const fn is_frame_error(&self) -> bool {
        matches!(
            self,
            Self::ShortFrame { .. }
                | Self::LengthMismatch { .. }
                | Self::CrcMismatch { .. }
                | Self::Protocol { .. }
                | Self::ModbusException { .. }
        )
    }

    /// Whether this error comes from the shared hardware bus
    pub const fn is_bus_error(&self) -> bool {
        matches!(self, Self::BusTimeout { .. } | Self::BusIo { .. })
    }
}

impl From<std::io::Error> for BmsError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for BmsError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BmsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "hardware")]
impl From<rppal::i2c::Error> for BmsError {
    fn from(err: rppal::i2c::Error) -> Self {
        Self::bus_io(err.to_string())
    }
}

#[cfg(feature = "hardware")]
impl From<rppal::gpio::Error> for BmsError {
    fn from(err: rppal::gpio::Error) -> Self {
        Self::bus_io(format!("GPIO: {err}"))
    }
}
