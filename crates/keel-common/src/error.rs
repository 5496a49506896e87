//! Error types for keel
//!
//! Errors carry the attempt they concern where one is known, so that log
//! lines from the error policy point at a specific ClusterProvision.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for keel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid object or configuration
    #[error("validation error for {attempt}: {message}")]
    Validation {
        /// Attempt (namespace/name) with the invalid configuration
        attempt: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// The install pod is missing or duplicated; surfaced to force a prompt retry
    #[error("install pod stuck for {attempt}: found {pods} pods for job {job}")]
    InstallPodStuck {
        /// Attempt (namespace/name)
        attempt: String,
        /// Backing job name
        job: String,
        /// Number of pods observed
        pods: usize,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "runner")
        context: String,
    },
}

impl Error {
    /// Create a validation error for an attempt
    pub fn validation_for(attempt: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            attempt: attempt.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
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

    /// HTTP status code of the underlying API error, if any
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Self::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }

    /// True for optimistic-concurrency conflicts (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// True when the API server reported the object missing (HTTP 404)
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
