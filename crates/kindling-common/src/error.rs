//! Error types shared by every kindling component
//!
//! Errors carry the registry host, cluster name or operation they relate to.
//! Wrapping variants (`Context`, `Parallel`) keep the original error as their
//! source so callers can match on the underlying kind via [`Error::root`].

use std::time::Duration;

use thiserror::Error;

/// Main error type for kindling operations
#[derive(Debug, Error)]
pub enum Error {
    /// A resource the operation depends on does not exist
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Resource kind (container, network, volume)
        kind: &'static str,
        /// Name or identifier that was looked up
        name: String,
    },

    /// A resource that must be unique already exists
    #[error("{kind} already exists: {name}")]
    AlreadyExists {
        /// Resource kind (container, network, volume)
        kind: &'static str,
        /// Name of the conflicting resource
        name: String,
    },

    /// The registry container has no published host port
    #[error("no host port published for registry {host} (container {container})")]
    PortNotFound {
        /// Registry host the container serves
        host: String,
        /// Container name
        container: String,
    },

    /// The registry did not answer with a success-class status in time
    #[error("registry {host} not ready within {timeout:?}: {reason}")]
    NotReady {
        /// Registry host
        host: String,
        /// The timeout that was in effect
        timeout: Duration,
        /// Last observed failure
        reason: String,
    },

    /// The registry answered with a status that is neither success nor auth
    #[error("registry {host} returned unexpected status {status}")]
    UnexpectedStatus {
        /// Registry host
        host: String,
        /// HTTP status code
        status: u16,
    },

    /// The caller cancelled the readiness wait
    #[error("health check for registry {host} cancelled")]
    HealthCheckCancelled {
        /// Registry host
        host: String,
    },

    /// Exactly one of username/password was supplied
    #[error("registry {host} has partial credentials: both username and password are required")]
    PartialCredentials {
        /// Registry host
        host: String,
    },

    /// Cluster name cannot be used as a state directory
    #[error("invalid cluster name: {name:?}")]
    InvalidClusterName {
        /// The rejected name
        name: String,
    },

    /// No saved snapshot exists for the cluster
    #[error("no saved state for cluster {cluster}")]
    StateNotFound {
        /// Cluster name
        cluster: String,
    },

    /// The container engine rejected a command
    #[error("container engine error [{operation}]: {message}")]
    Engine {
        /// Engine operation (e.g. "network create")
        operation: String,
        /// Engine output describing the failure
        message: String,
    },

    /// The HTTP client could not be built or used
    #[error("http error: {message}")]
    Http {
        /// Client error description
        message: String,
    },

    /// Input failed validation
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A task panicked or was aborted inside the parallel executor
    #[error("task aborted: {message}")]
    TaskAborted {
        /// Panic or join failure description
        message: String,
    },

    /// An error annotated with the operation that was being attempted
    #[error("failed to {operation}: {source}")]
    Context {
        /// Operation being attempted (e.g. "create network")
        operation: String,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// The first failure observed by the parallel executor
    #[error("parallel execution failed: {source}")]
    Parallel {
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an engine error for the given operation
    pub fn engine(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Engine {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Wrap this error with the operation that was being attempted
    pub fn context(self, operation: impl Into<String>) -> Self {
        Self::Context {
            operation: operation.into(),
            source: Box::new(self),
        }
    }

    /// Wrap this error as the failure of a parallel execution
    pub fn parallel(self) -> Self {
        Self::Parallel {
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping `Context` and `Parallel` wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Self::Context { source, .. } | Self::Parallel { source } => source.root(),
            other => other,
        }
    }

    /// Whether the underlying error is a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Self::NotFound { .. } | Self::StateNotFound { .. }
        )
    }
}

/// Extension trait attaching operation context to results.
///
/// `engine.create_network(..).await.context("create network")?` yields
/// `failed to create network: <cause>`.
pub trait ResultExt<T> {
    /// Wrap the error (if any) with the operation being attempted.
    fn context(self, operation: impl Into<String>) -> Result<T, Error>;
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    fn context(self, operation: impl Into<String>) -> Result<T, Error> {
        self.map_err(|e| e.into().context(operation))
    }
}
