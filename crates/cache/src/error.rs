//! Error types for the query cache

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Boxed error returned by a query executor
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error while touching the cache directory
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(sqlcache::store::io),
        help("Check that the cache directory exists and is writable")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "rename", "remove_file")
        operation: String,
    },

    /// No entry is stored under the key
    #[error("Cache key not found: {key}")]
    #[diagnostic(
        code(sqlcache::store::not_found),
        help("The entry may have been evicted or never existed")
    )]
    NotFound {
        /// The cache key that was not found
        key: String,
    },

    /// A stored entry could not be decoded
    #[error("Corrupt cache entry {key}: {reason}")]
    #[diagnostic(
        code(sqlcache::store::corrupt),
        help("The entry will be re-executed on the next query; `sqlcache prune` removes it")
    )]
    CorruptEntry {
        /// Key of the damaged entry (empty when decoding a detached blob)
        key: String,
        /// What failed while decoding
        reason: String,
    },

    /// The query executor failed; never cached
    #[error("Query execution failed: {source}")]
    #[diagnostic(code(sqlcache::execution))]
    Execution {
        /// Error reported by the executor, unchanged
        #[source]
        source: BoxError,
    },

    /// A table does not satisfy the tabular model invariants
    #[error("Invalid table: {message}")]
    #[diagnostic(code(sqlcache::table::schema))]
    Schema {
        /// What is wrong with the table
        message: String,
    },

    /// Metadata (de)serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(sqlcache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(sqlcache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// A string is not a well-formed cache key
    #[error("Invalid cache key: {value}")]
    #[diagnostic(
        code(sqlcache::key::invalid),
        help("Cache keys are 64 lowercase hexadecimal characters")
    )]
    InvalidKey {
        /// The rejected input
        value: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a not found error
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a corrupt entry error
    #[must_use]
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptEntry {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Wrap an executor failure
    #[must_use]
    pub fn execution(source: impl Into<BoxError>) -> Self {
        Self::Execution {
            source: source.into(),
        }
    }

    /// Create a schema error
    #[must_use]
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// True for the failures the manager recovers from by re-executing
    #[must_use]
    pub const fn is_corrupt(&self) -> bool {
        matches!(self, Self::CorruptEntry { .. })
    }

    /// True when the error means "no such entry"
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Attach an entry key to a corrupt error raised while the key was unknown
    #[must_use]
    pub(crate) fn with_key(self, key: &str) -> Self {
        match self {
            Self::CorruptEntry { reason, .. } => Self::CorruptEntry {
                key: key.to_string(),
                reason,
            },
            other => other,
        }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
