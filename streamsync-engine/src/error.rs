//! Error types for streamsync-engine
//!
//! "Still buffering" is not an error; it is reported through
//! [`crate::ProcessOutcome::NeedMoreData`].

use streamsync_common::{MetadataError, PortError};
use thiserror::Error;

/// Main error type for the engines
#[derive(Error, Debug)]
pub enum EngineError {
    /// Caller broke the port or marker contract
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Buffer or marker allocation failed
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Media format the engine cannot process
    #[error("Unsupported media format: {0}")]
    UnsupportedFormat(String),

    /// Configuration file loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Port lifecycle violation
    #[error("Port error: {0}")]
    Port(#[from] PortError),

    /// Marker list operation failed
    #[error("Metadata error: {0}")]
    Metadata(MetadataError),

    /// Shared library error
    #[error(transparent)]
    Common(#[from] streamsync_common::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<MetadataError> for EngineError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::PoolExhausted { .. } => EngineError::ResourceExhausted(err.to_string()),
            other => EngineError::Metadata(other),
        }
    }
}

/// Convenience Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_maps_to_resource_error() {
        let err: EngineError = MetadataError::PoolExhausted { limit: 4 }.into();
        assert!(matches!(err, EngineError::ResourceExhausted(_)));
    }

    #[test]
    fn test_port_error_wraps() {
        let err: EngineError = PortError::NotOpen {
            direction: streamsync_common::PortDirection::Input,
            index: 1,
        }
        .into();
        assert_eq!(err.to_string(), "Port error: input port 1 is closed");
    }
}
