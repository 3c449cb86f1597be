//! Error types for the summon operator
//!
//! Errors are structured so the reconcile engine can decide, without string
//! matching, whether a failure is transient, whether it should be surfaced on
//! the top object's status, and whether it should fan out to notification
//! sinks.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Message the API server returns on an optimistic-concurrency conflict.
///
/// Never forwarded to notification sinks.
pub const OBJECT_MODIFIED_MESSAGE: &str =
    "the object has been modified; please apply your changes to the latest version and try again";

/// Main error type for summon operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid configuration on a custom resource
    #[error("{message}")]
    Validation {
        /// Name of the instance with invalid configuration
        instance: String,
        /// Description of what's invalid
        message: String,
    },

    /// A child custom resource reported an `Error` status
    #[error("{component}: {message}")]
    ChildFailed {
        /// Role of the child (postgres, rabbitmq, migrations, ...)
        component: String,
        /// Message copied from the child status
        message: String,
    },

    /// A referenced input object does not exist (yet)
    #[error("missing input {kind} {name}")]
    MissingInput {
        /// Kind of the missing object
        kind: String,
        /// Name of the missing object
        name: String,
        /// Whether this failure should be forwarded to notification sinks
        notify: bool,
    },

    /// Template render failure
    #[error("template {id}: {message}")]
    Template {
        /// Template identifier
        id: String,
        /// Render or decode error
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// External notification sink failure (chat, deploy tracker, webhook)
    #[error("{sink} sink: {message}")]
    Sink {
        /// Name of the sink
        sink: String,
        /// Description of what failed
        message: String,
    },

    /// Decryption, key generation or hashing failure
    #[error("crypto error: {message}")]
    Crypto {
        /// Description of what failed
        message: String,
    },

    /// Status write-back gave up after repeated conflicts
    #[error("unable to update status after {attempts} attempts, too many failures: {message}")]
    StatusUpdate {
        /// Number of slow-path attempts made
        attempts: u32,
        /// Last error seen
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "engine", "tag-cache")
        context: String,
    },
}

impl Error {
    /// Create a validation error for a named instance
    pub fn validation_for(instance: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            instance: instance.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error without instance context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::validation_for(UNKNOWN_CONTEXT, msg)
    }

    /// A child CR reported `Error`
    pub fn child_failed(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ChildFailed {
            component: component.into(),
            message: msg.into(),
        }
    }

    /// A referenced input is absent; `notify` selects whether sinks hear about it
    pub fn missing_input(kind: impl Into<String>, name: impl Into<String>, notify: bool) -> Self {
        Self::MissingInput {
            kind: kind.into(),
            name: name.into(),
            notify,
        }
    }

    /// Create a template error
    pub fn template(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Template {
            id: id.into(),
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

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a sink error
    pub fn sink(sink: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Sink {
            sink: sink.into(),
            message: msg.into(),
        }
    }

    /// Create a crypto error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::internal_with_context(UNKNOWN_CONTEXT, msg)
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }

    /// Optimistic-concurrency conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Object or subresource not found (HTTP 404)
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec or code change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Template { .. } => false,
            Error::ChildFailed { .. } => true,
            Error::MissingInput { .. } => true,
            Error::Sink { .. } => true,
            Error::Crypto { .. } => false,
            Error::StatusUpdate { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this error should be forwarded to notification sinks
    pub fn should_notify(&self) -> bool {
        match self {
            Error::MissingInput { notify, .. } => *notify,
            Error::Sink { .. } => false,
            Error::Kube { .. } if self.is_conflict() => false,
            _ => !self.to_string().contains(OBJECT_MODIFIED_MESSAGE),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
