//! Error types for network control plane operations.
//!
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use thiserror::Error;

/// Result type alias for network operations.
pub type NetResult<T> = Result<T, NetError>;

/// Errors that can occur during network operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// Bad or unknown configuration key.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The key (or port-spec index) that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// A parent interface, listen port or name is already claimed.
    #[error("{message}")]
    ResourceConflict {
        /// Error message.
        message: String,
    },

    /// No free instance of a scarce resource (virtual functions).
    #[error("{message}")]
    ResourceExhausted {
        /// Error message.
        message: String,
    },

    /// The driver does not support the requested capability.
    #[error("Not implemented")]
    NotImplemented,

    /// A cluster member could not be reached while broadcasting.
    #[error("Failed to notify cluster member '{member}': {message}")]
    TransportFailure {
        /// Name of the unreachable member.
        member: String,
        /// Error message.
        message: String,
    },

    /// Cluster store transaction failed.
    #[error("Cluster store operation failed: {operation}: {message}")]
    BackingStore {
        /// The operation that failed (e.g., "update_network").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Record or speaker entry not found.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Kind of the missing object (e.g., "Network", "BGP peer").
        kind: String,
        /// Its name or key.
        name: String,
    },

    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Filesystem access failed (state directories, sysfs).
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// The path being accessed.
        path: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl NetError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a resource conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::ResourceConflict {
            message: message.into(),
        }
    }

    /// Creates a resource exhausted error.
    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Creates a transport failure error.
    pub fn transport(member: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportFailure {
            member: member.into(),
            message: message.into(),
        }
    }

    /// Creates a backing store error.
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackingStore {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Creates an I/O error bound to a path.
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Prefixes the message of this error with some context, keeping its kind.
    ///
    /// Kinds without a free-form message are returned unchanged.
    pub fn context(self, prefix: impl AsRef<str>) -> Self {
        let prefix = prefix.as_ref();
        match self {
            Self::InvalidConfig { field, message } => Self::InvalidConfig {
                field,
                message: format!("{}: {}", prefix, message),
            },
            Self::ResourceConflict { message } => Self::ResourceConflict {
                message: format!("{}: {}", prefix, message),
            },
            Self::ResourceExhausted { message } => Self::ResourceExhausted {
                message: format!("{}: {}", prefix, message),
            },
            Self::TransportFailure { member, message } => Self::TransportFailure {
                member,
                message: format!("{}: {}", prefix, message),
            },
            Self::BackingStore { operation, message } => Self::BackingStore {
                operation,
                message: format!("{}: {}", prefix, message),
            },
            Self::Internal { message } => Self::Internal {
                message: format!("{}: {}", prefix, message),
            },
            Self::ShellCommandFailed {
                command,
                exit_code,
                output,
            } => Self::ShellCommandFailed {
                command,
                exit_code,
                output: format!("{}: {}", prefix, output),
            },
            other => other,
        }
    }

    /// Returns true for the `NotImplemented` sentinel.
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, NetError::NotImplemented)
    }

    /// Returns true if this error is a missing record or peer.
    pub fn is_not_found(&self) -> bool {
        matches!(self, NetError::NotFound { .. })
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry. Nothing in this workspace retries on
    /// its own; the hint is for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NetError::TransportFailure { .. } | NetError::BackingStore { .. }
        )
    }
}
