//! Error types for cluster-set RBAC synchronization
//!
//! Errors carry enough context (operation, object) to be useful in logs
//! without a backtrace.

use thiserror::Error;

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid configuration or input
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The offending field or flag (e.g., "--sync-period-secs")
        field: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "create_client", "access_cache")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// HTTP status code of the API error, if this is one
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }

    /// True when the API server answered 404
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// True when an optimistic-concurrency update lost the race (409)
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Check if this error is retryable
    ///
    /// Transient transport failures and conflicts are retryable; other 4xx
    /// responses and validation errors need a change of input first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => match self.api_code() {
                Some(409) => true,
                Some(code) => !(400..500).contains(&code),
                None => true,
            },
            Error::Validation { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Validation { field, .. } => field.as_deref(),
            Error::Kube { .. } => None,
        }
    }
}
