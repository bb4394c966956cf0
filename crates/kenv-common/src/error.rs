//! Error types shared by every kenv crate
//!
//! Errors carry the environment or tenant they relate to so a single log
//! line is enough to find the affected object. Synchronous callers see
//! `Validation`, `NotFound` and `Conflict`; workflows turn everything else
//! into a recorded ERROR state rather than returning it.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for kenv operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Malformed or out-of-range input, rejected before anything is persisted
    #[error("validation error for {subject}: {message}")]
    Validation {
        /// Environment or tenant name the input belongs to
        subject: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "resourceLimits.maxNodeCount")
        field: Option<String>,
    },

    /// Unknown or soft-deleted object
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind of object looked up (environment, workspace, ...)
        kind: String,
        /// Identifier that was looked up
        id: String,
    },

    /// Stale version on a conditional write, or another workflow holds the object
    #[error("conflict on {id}: {message}")]
    Conflict {
        /// Identifier of the contended object
        id: String,
        /// Description of the conflict
        message: String,
    },

    /// External tool or cluster call failed
    #[error("execution error [{context}]: {message}{}", stderr_suffix(.stderr))]
    Execution {
        /// Step that failed (e.g., "terraform apply", "create namespace")
        context: String,
        /// Description of what failed
        message: String,
        /// Captured diagnostic output of the failed step
        stderr: Option<String>,
    },

    /// Record store unavailable or rejected the write
    #[error("persistence error: {message}")]
    Persistence {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The kind of document being processed (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "workflow", "reconciler")
        context: String,
    },
}

fn stderr_suffix(stderr: &Option<String>) -> String {
    match stderr.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => format!(", stderr: {s}"),
        _ => String::new(),
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            subject: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named environment or tenant
    pub fn validation_for(subject: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            subject: subject.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with subject and field path
    pub fn validation_for_field(
        subject: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            subject: subject.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            id: id.into(),
            message: msg.into(),
        }
    }

    /// Create an execution error without captured output
    pub fn execution(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Execution {
            context: context.into(),
            message: msg.into(),
            stderr: None,
        }
    }

    /// Create an execution error carrying the failed step's stderr
    pub fn execution_with_stderr(
        context: impl Into<String>,
        msg: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::Execution {
            context: context.into(),
            message: msg.into(),
            stderr: Some(stderr.into()),
        }
    }

    /// Create an execution error for a step that exceeded its deadline
    pub fn timeout(context: impl Into<String>, after: Duration) -> Self {
        Self::Execution {
            context: context.into(),
            message: format!("timed out after {after:?}"),
            stderr: None,
        }
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, not-found, conflict and serialization errors need a
    /// different input before another attempt can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 4xx responses will fail the same way again
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::NotFound { .. } => false,
            Error::Conflict { .. } => false,
            Error::Execution { .. } => true,
            Error::Persistence { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True for `NotFound`, including a 404 from the Kubernetes API
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// True for `Conflict`, including a 409 from the Kubernetes API
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Get the environment or tenant name if this error names one
    pub fn subject(&self) -> Option<&str> {
        match self {
            Error::Validation { subject, .. } => Some(subject),
            Error::NotFound { id, .. } => Some(id),
            Error::Conflict { id, .. } => Some(id),
            _ => None,
        }
    }
}
