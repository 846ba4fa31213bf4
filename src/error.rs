//! Error types for the oneshot operator
//!
//! Errors carry enough context to be written verbatim into an operation's
//! `status.reason`, and are classified so the engine can decide between
//! failing the operation and handing it back to the dispatcher for retry.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for oneshot operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid operation spec (bad quantity, missing reference, ...)
    #[error("configuration error for {operation}: {message}")]
    Configuration {
        /// Name of the operation resource with invalid configuration
        operation: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.volume.storage")
        field: Option<String>,
    },

    /// Network failure talking to the in-pod agent
    #[error("transport error calling {endpoint}: {message}")]
    Transport {
        /// URL or logical endpoint of the call
        endpoint: String,
        /// Description of what failed
        message: String,
    },

    /// A remote call did not finish within its deadline
    #[error("{call} timed out after {limit:?}")]
    Timeout {
        /// Name of the call that timed out
        call: String,
        /// The deadline that was exceeded
        limit: Duration,
    },

    /// The in-pod agent answered, but rejected the request
    #[error("agent rejected {call} with status {status}: {message}")]
    Remote {
        /// Name of the call
        call: String,
        /// HTTP status code returned by the agent
        status: u16,
        /// Response body or summary
        message: String,
    },

    /// The agent finished the operation and reported failure
    #[error("agent reported operation {operation} as FAILED")]
    RemoteFailure {
        /// Name of the operation
        operation: String,
    },

    /// A transiently failing call ran out of retries
    #[error("{call} failed after {attempts} attempts: {message}")]
    Exhausted {
        /// Name of the call
        call: String,
        /// Attempts made
        attempts: u32,
        /// Last error seen
        message: String,
    },

    /// The worker unit terminated before the operation could complete
    #[error("worker {pod} terminated: {message}")]
    Worker {
        /// Name of the worker pod
        pod: String,
        /// Description of the termination
        message: String,
    },

    /// A prerequisite exists but is not ready yet
    #[error("waiting for {resource}: {message}")]
    Waiting {
        /// The prerequisite being waited on
        resource: String,
        /// What it is waiting for
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal/operational error (a bug or a broken invariant)
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a configuration error without operation context
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            operation: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error with operation context and field path
    pub fn configuration_for_field(
        operation: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            operation: operation.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a transport error for the given endpoint
    pub fn transport(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error for the named call
    pub fn timeout(call: impl Into<String>, limit: Duration) -> Self {
        Self::Timeout {
            call: call.into(),
            limit,
        }
    }

    /// Create a worker termination error
    pub fn worker(pod: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Worker {
            pod: pod.into(),
            message: msg.into(),
        }
    }

    /// Create an error for an operation the agent reported as failed
    pub fn remote_failure(operation: impl Into<String>) -> Self {
        Self::RemoteFailure {
            operation: operation.into(),
        }
    }

    /// Create an error for a call that ran out of retries
    pub fn exhausted(call: impl Into<String>, attempts: u32, msg: impl Into<String>) -> Self {
        Self::Exhausted {
            call: call.into(),
            attempts,
            message: msg.into(),
        }
    }

    /// Create a waiting error for a prerequisite that is not ready
    pub fn waiting(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Waiting {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is transient
    ///
    /// Transient errors leave the operation's phase untouched and are
    /// handed back to the dispatcher for a retry with backoff. Everything
    /// else moves the operation to Failed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                // 409 conflicts and 429 throttling resolve on the next pass
                kube::Error::Api(ae) => ae.code == 409 || ae.code == 429 || ae.code >= 500,
                _ => true,
            },
            Error::Transport { .. } => true,
            Error::Timeout { .. } => true,
            Error::Remote { status, .. } => *status >= 500 || *status == 429,
            Error::Configuration { .. } => false,
            Error::RemoteFailure { .. } => false,
            Error::Exhausted { .. } => false,
            Error::Worker { .. } => false,
            Error::Waiting { .. } => true,
            Error::Serialization(_) => false,
            Error::Internal { .. } => false,
        }
    }

    /// Check if this error stems from the operation's own spec
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration { .. })
    }

    /// Check if this is a kube 409 AlreadyExists
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 409 && ae.reason == "AlreadyExists"
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let endpoint = e
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| UNKNOWN_CONTEXT.to_string());
        if e.is_decode() {
            return Error::internal_with_context("agent-response", e.to_string());
        }
        Error::transport(endpoint, e.to_string())
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} ({code})"),
            reason: reason.to_string(),
            code,
        }),
    }
}
