//! Error taxonomy shared by the backend API and the core
//!
//! Every GPU-facing failure is checked at the call site and mapped into
//! [`GraphicsError`]. The only variants callers are expected to recover from
//! are the device-loss pair, see [`GraphicsError::is_device_lost`].

use thiserror::Error;

use crate::config::ConfigError;
use crate::render::raytracing::pipeline::PipelineBuildError;

/// Graphics error types
#[derive(Error, Debug)]
pub enum GraphicsError {
    /// Unexpected failure code returned by a backend call
    #[error("{call} failed: {code}")]
    Api {
        /// Name of the failing API entry point
        call: &'static str,
        /// Backend specific result code, already formatted
        code: String,
    },

    /// The GPU was removed (driver update, hang, TDR, invalid GPU work)
    #[error("Device removed: {reason}")]
    DeviceRemoved {
        /// Removal reason reported by the device
        reason: String,
    },

    /// The device was reset by the driver
    #[error("Device reset")]
    DeviceReset,

    /// Optional capability is not available
    #[error("Unsupported feature: {feature}")]
    Unsupported {
        /// Name of the missing capability
        feature: String,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Malformed construction parameters
    #[error("Out of range: {reason}")]
    OutOfRange {
        /// Which parameter was rejected and why
        reason: String,
    },

    /// Window-size dependent resources requested before a surface was bound
    #[error("No output surface bound; call set_window first")]
    NoOutputSurface,

    /// No adapter satisfies the minimum feature level
    #[error("No suitable graphics adapter found")]
    NoAdapter,

    /// The 32-bit descriptor slot counter is exhausted
    #[error("Descriptor slot range exhausted")]
    SlotsExhausted,

    /// Memory allocation failed
    #[error("Out of memory: {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// Resource with specified ID could not be found
    #[error("Resource not found: {id}")]
    ResourceNotFound {
        /// The unique identifier of the resource
        id: u64,
    },

    /// Ray tracing pipeline description failed validation
    #[error(transparent)]
    Pipeline(#[from] PipelineBuildError),

    /// Configuration could not be loaded or saved
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GraphicsError {
    /// Whether this error is the recoverable device-removed/device-reset pair
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceRemoved { .. } | Self::DeviceReset)
    }

    /// Shorthand for [`GraphicsError::InvalidOperation`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperation { reason: reason.into() }
    }
}

/// Result type for graphics operations
pub type GraphicsResult<T> = Result<T, GraphicsError>;

#[cfg(test)]
mod tests {
    use super::*;

    /// Only removal and reset count as device loss
    #[test]
    fn test_device_lost_classification() {
        assert!(GraphicsError::DeviceRemoved { reason: "hung".into() }.is_device_lost());
        assert!(GraphicsError::DeviceReset.is_device_lost());
        assert!(!GraphicsError::NoAdapter.is_device_lost());
        assert!(!GraphicsError::invalid("open list").is_device_lost());
    }

    #[test]
    fn test_error_messages() {
        let err = GraphicsError::Api { call: "CreateFence", code: "E_OUTOFMEMORY".into() };
        assert_eq!(err.to_string(), "CreateFence failed: E_OUTOFMEMORY");
        assert_eq!(GraphicsError::SlotsExhausted.to_string(), "Descriptor slot range exhausted");
    }
}
