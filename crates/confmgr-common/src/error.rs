//! Internal error types for backend operations.
//!
//! [`BackendError`] covers failures inside the backend itself. Errors that
//! must travel back to a NETCONF client are represented separately as
//! [`crate::netconf::RpcError`]; handlers translate between the two at the
//! protocol boundary.

use std::io;

use confmgr_types::XmlParseError;
use thiserror::Error;

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors that can occur inside the backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Filesystem operation failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// What the backend was doing (e.g. "datastore copy").
        context: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// XML could not be parsed.
    #[error("XML parse error: {source}")]
    Xml {
        #[from]
        source: XmlParseError,
    },

    /// Datastore operation failed.
    #[error("Datastore operation failed: {operation}: {message}")]
    Datastore {
        /// The operation that failed (e.g. "copy", "put").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Named datastore does not exist.
    #[error("No such datastore: {name}")]
    NoSuchDatastore {
        /// The datastore name.
        name: String,
    },

    /// Schema is missing or inconsistent.
    #[error("Schema error: {message}")]
    Schema {
        /// Error message.
        message: String,
    },

    /// Configuration option invalid or missing.
    #[error("Invalid configuration for {option}: {message}")]
    Config {
        /// The option that failed.
        option: String,
        /// Error message.
        message: String,
    },

    /// A plugin callback failed.
    #[error("Plugin '{plugin}' failed: {message}")]
    Plugin {
        /// Plugin name.
        plugin: String,
        /// Error message.
        message: String,
    },

    /// Another backend daemon already holds the pidfile.
    #[error("Daemon already running with pid {pid}")]
    AlreadyRunning {
        /// The recorded pid.
        pid: u32,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl BackendError {
    /// Creates an IO error with context.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a datastore error.
    pub fn datastore(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Datastore {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a missing-datastore error.
    pub fn no_such_datastore(name: impl Into<String>) -> Self {
        Self::NoSuchDatastore { name: name.into() }
    }

    /// Creates a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(option: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            option: option.into(),
            message: message.into(),
        }
    }

    /// Creates a plugin error.
    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for parse-category errors.
    ///
    /// Startup degrades these to status `ERR` rather than aborting.
    pub fn is_parse(&self) -> bool {
        matches!(self, BackendError::Xml { .. })
    }
}
