//! Error types for the scheduler module

use std::fmt;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// No policy registered under the configured name
    UnknownPolicy {
        name: String,
        available: Vec<String>,
    },

    /// A policy returned a pairing that breaks capacity or capability rules
    InvalidAssignment {
        policy: String,
        reason: String,
    },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPolicy { name, available } => {
                write!(
                    f,
                    "Unknown scheduling policy '{}'. Available: {}",
                    name,
                    available.join(", ")
                )
            }
            Self::InvalidAssignment { policy, reason } => {
                write!(f, "Policy '{}' produced an invalid assignment: {}", policy, reason)
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl SchedulerError {
    /// Create an unknown policy error
    pub fn unknown_policy(name: impl Into<String>, available: Vec<String>) -> Self {
        Self::UnknownPolicy {
            name: name.into(),
            available,
        }
    }

    /// Create an invalid assignment error
    pub fn invalid_assignment(policy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAssignment {
            policy: policy.into(),
            reason: reason.into(),
        }
    }

    /// Invalid assignments are dropped and the job stays queued
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidAssignment { .. })
    }
}
