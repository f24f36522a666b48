//! # Engine Errors
//!
//! Error taxonomy for the batch coordination engine. Every blocking operation in the
//! engine has a bounded wait, and exceeding it yields one of the typed variants here
//! rather than hanging.

use std::time::Duration;
use thiserror::Error;

use crate::models::JobKind;
use crate::state_machine::{JobEvent, JobState};

/// Engine-wide error type
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// No rate-limiter token became available for the resource in time
    #[error("Rate limit timeout for resource '{resource}' after {waited:?}")]
    RateLimitTimeout { resource: String, waited: Duration },

    /// No pooled connection became available in time
    #[error("Connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    /// The resource's circuit breaker is open
    #[error("Circuit breaker is open for resource '{resource}'")]
    CircuitOpen { resource: String },

    /// The job handler reported a failure
    #[error("Handler failure: {message}")]
    HandlerFailure { message: String, permanent: bool },

    /// The job or its batch was cancelled
    #[error("Cancelled")]
    Cancelled,

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("No handler registered for job kind '{0}'")]
    NoHandlerRegistered(JobKind),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid state transition from {from} on {event}")]
    InvalidStateTransition { from: JobState, event: JobEvent },

    #[error("Job queue is closed")]
    QueueClosed,

    #[error("Timed out waiting for a job after {0:?}")]
    DequeueTimeout(Duration),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Engine has been shut down")]
    EngineShutdown,

    #[error("No tokio runtime available to run workers on")]
    RuntimeUnavailable,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl EngineError {
    /// Whether the worker may retry the job after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimitTimeout { .. }
            | Self::PoolExhausted { .. }
            | Self::CircuitOpen { .. }
            | Self::ConnectionFailed(_) => true,
            Self::HandlerFailure { permanent, .. } => !permanent,
            _ => false,
        }
    }

    /// Short stable code used in results and logs
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimitTimeout { .. } => "RATE_LIMIT_TIMEOUT",
            Self::PoolExhausted { .. } => "POOL_EXHAUSTED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::HandlerFailure { .. } => "HANDLER_FAILURE",
            Self::Cancelled => "CANCELLED",
            Self::BatchNotFound(_) => "BATCH_NOT_FOUND",
            Self::NoHandlerRegistered(_) => "NO_HANDLER",
            Self::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::QueueClosed => "QUEUE_CLOSED",
            Self::DequeueTimeout(_) => "DEQUEUE_TIMEOUT",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::EngineShutdown => "ENGINE_SHUTDOWN",
            Self::RuntimeUnavailable => "RUNTIME_UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Classified failure returned by a job handler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// May succeed on retry (network blip, upstream 5xx)
    #[error("{0}")]
    Transient(String),

    /// Will never succeed (identifier not found, malformed input)
    #[error("{0}")]
    Permanent(String),

    /// Upstream asked us to slow down (HTTP 429 or equivalent)
    #[error("{0}")]
    Backpressure(String),
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn backpressure(message: impl Into<String>) -> Self {
        Self::Backpressure(message.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::Backpressure(_))
    }
}

impl From<HandlerError> for EngineError {
    fn from(error: HandlerError) -> Self {
        let permanent = error.is_permanent();
        EngineError::HandlerFailure {
            message: error.to_string(),
            permanent,
        }
    }
}
