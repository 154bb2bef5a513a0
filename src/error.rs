//! Unified error handling for the judgeworks crate
//!
//! Every subsystem keeps its own error type; [`Error`] wraps them so they
//! can cross module boundaries, and [`CoordinatorErrorTrait`] classifies
//! them for handling:
//!
//! - `is_fatal()` errors stop the coordinator. A store write failure is the
//!   main one: the coordinator must not keep dispatching with state it
//!   cannot persist.
//! - `is_recoverable()` errors may be retried by the caller.
//!
//! # Usage
//!
//! ```rust,ignore
//! use judgeworks::error::{CoordinatorErrorTrait, Error};
//!
//! fn handle_error(err: Error) {
//!     if err.is_fatal() {
//!         tracing::error!(category = ?err.category(), error = %err, "Shutting down");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::catalog::ValidationError;
pub use crate::coordinator::client::ClientError;
pub use crate::coordinator::config::ConfigError;
pub use crate::coordinator::registry::RegistryError;
pub use crate::protocol::ProtocolError;
pub use crate::scheduler::error::SchedulerError;
pub use crate::storage::StorageError;

/// Common classification interface for judgeworks errors
pub trait CoordinatorErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Check if this error must stop the coordinator
    fn is_fatal(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed job specs rejected at submission
    Validation,
    /// Worker protocol violations and rejected handshakes
    Protocol,
    /// Durable store failures
    Storage,
    /// Configuration errors
    Config,
    /// HTTP and socket errors
    Network,
    /// Scheduling policy errors
    Scheduler,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Protocol => "protocol",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Network => "network",
            Self::Scheduler => "scheduler",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the judgeworks crate
#[derive(Error, Debug)]
pub enum Error {
    /// Job spec validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Worker registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Worker protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Durable store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Scheduling policy errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Producer client errors
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The coordinator event loop has stopped
    #[error("Coordinator is shutting down")]
    ShuttingDown,

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CoordinatorErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Client(e) => e.is_transient(),
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Io(_) => true,
            Self::Protocol(e) => !e.is_violation(),
            Self::Validation(_)
            | Self::Registry(_)
            | Self::Storage(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::ShuttingDown
            | Self::Other { .. } => false,
        }
    }

    fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Config(_))
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Registry(_) | Self::Protocol(_) | Self::Json(_) => ErrorCategory::Protocol,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Client(_) | Self::Io(_) => ErrorCategory::Network,
            Self::Config(_) => ErrorCategory::Config,
            Self::ShuttingDown | Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Sqlite(err))
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_are_fatal() {
        let err = Error::from(StorageError::Unavailable("disk full".to_string()));
        assert!(err.is_fatal());
        assert!(!err.is_recoverable());
        assert_eq!(err.category(), ErrorCategory::Storage);
    }

    #[test]
    fn test_validation_error_category() {
        let err: Error = ValidationError::EmptyBatch.into();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_protocol_errors() {
        let violation = Error::from(ProtocolError::DuplicateHandshake);
        assert_eq!(violation.category(), ErrorCategory::Protocol);
        assert!(!violation.is_recoverable());

        let closed = Error::from(ProtocolError::Closed);
        assert!(closed.is_recoverable());
    }

    #[test]
    fn test_registry_error_conversion() {
        let err: Error = RegistryError::DuplicateName("w1".to_string()).into();
        assert!(matches!(err, Error::Registry(_)));
        assert!(err.to_string().contains("w1"));
    }

    #[test]
    fn test_other_error() {
        let err = Error::other("Something went wrong");
        assert_eq!(err.category(), ErrorCategory::Other);
        assert_eq!(err.category().as_str(), "other");
    }
}
