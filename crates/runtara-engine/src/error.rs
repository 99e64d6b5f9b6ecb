// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runtara-engine.
//!
//! [`EngineError`] covers failures of the engine actor and its storage, with a
//! stable error code per variant. [`WorkflowError`] is what the step layer
//! returns from a run; the engine classifies it as fatal or generic when it
//! records the outcome.

use std::fmt;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the engine and its persistence layer.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EngineError {
    /// An operation needed instance metadata but none was ever persisted
    /// and none was supplied.
    StartupError {
        /// The instance ID, if the caller knew it.
        instance_id: Option<String>,
        /// Why the engine could not start or resume.
        reason: String,
    },

    /// A timer with the same (entry type, hash) is already armed.
    ConstraintViolation {
        /// The timer entry type.
        entry_type: String,
        /// The timer content hash.
        hash: String,
    },

    /// The requested status change would leave a terminal status or move
    /// backwards.
    InvalidTransition {
        /// The current status.
        from: String,
        /// The requested status.
        to: String,
    },

    /// A waiter was dropped before an event reached it.
    EventChannelClosed {
        /// The event type that was awaited.
        event_type: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A persisted document could not be encoded or decoded.
    SerializationError {
        /// Error details.
        details: String,
    },
}

impl EngineError {
    /// Shorthand for a [`EngineError::StartupError`] caused by missing metadata.
    pub fn never_started(instance_id: Option<&str>) -> Self {
        Self::StartupError {
            instance_id: instance_id.map(str::to_string),
            reason: "Engine was never started".to_string(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::StartupError { .. } => "STARTUP_ERROR",
            Self::ConstraintViolation { .. } => "CONSTRAINT_VIOLATION",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::EventChannelClosed { .. } => "EVENT_CHANNEL_CLOSED",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::SerializationError { .. } => "SERIALIZATION_ERROR",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartupError {
                instance_id,
                reason,
            } => {
                if let Some(id) = instance_id {
                    write!(f, "Startup error for instance '{}': {}", id, reason)
                } else {
                    write!(f, "Startup error: {}", reason)
                }
            }
            Self::ConstraintViolation { entry_type, hash } => {
                write!(
                    f,
                    "Timer '{}' with hash '{}' is already armed",
                    entry_type, hash
                )
            }
            Self::InvalidTransition { from, to } => {
                write!(f, "Invalid status transition from '{}' to '{}'", from, to)
            }
            Self::EventChannelClosed { event_type } => {
                write!(f, "Waiter for event type '{}' was dropped", event_type)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::SerializationError { details } => {
                write!(f, "Serialization error: {}", details)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationError {
            details: err.to_string(),
        }
    }
}

/// Name given to step errors that must not be retried.
pub const NON_RETRYABLE_ERROR_NAME: &str = "NonRetryableError";

/// Failure returned by a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    /// A step gave up for good. The instance is errored immediately.
    #[error("NonRetryableError: {0}")]
    NonRetryable(String),

    /// Any other failure surfacing from the run.
    #[error("{name}: {message}")]
    Failed {
        /// Error name, kept in the failure log.
        name: String,
        /// Error message, kept in the failure log.
        message: String,
    },
}

impl WorkflowError {
    /// Build a generic failure with an explicit name.
    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Build a non-retryable failure.
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::NonRetryable(message.into())
    }

    /// Whether this failure carries the non-retryable marker, either as the
    /// variant itself or as a generic failure named or prefixed after it.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::NonRetryable(_) => true,
            Self::Failed { name, message } => {
                name == NON_RETRYABLE_ERROR_NAME || message.starts_with(NON_RETRYABLE_ERROR_NAME)
            }
        }
    }

    /// The error name.
    pub fn name(&self) -> &str {
        match self {
            Self::NonRetryable(_) => NON_RETRYABLE_ERROR_NAME,
            Self::Failed { name, .. } => name,
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        match self {
            Self::NonRetryable(message) => message,
            Self::Failed { message, .. } => message,
        }
    }
}

impl From<EngineError> for WorkflowError {
    fn from(err: EngineError) -> Self {
        WorkflowError::Failed {
            name: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}
