//! Error types for the SQLite executor

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for SQLite execution
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// The database file could not be opened
    #[error("Failed to open SQLite database {}", path.display())]
    #[diagnostic(
        code(sqlcache_sqlite::open),
        help("Check that the file exists and is a SQLite database")
    )]
    Open {
        /// Database file
        path: PathBuf,
        /// Driver error
        #[source]
        source: rusqlite::Error,
    },

    /// SQLite rejected or failed the statement
    #[error(transparent)]
    #[diagnostic(code(sqlcache_sqlite::sqlite))]
    Sqlite(#[from] rusqlite::Error),

    /// The result set could not be represented as a table
    #[error("Unsupported result set: {0}")]
    #[diagnostic(code(sqlcache_sqlite::table))]
    Table(#[from] sqlcache::Error),

    /// Another thread panicked while holding the connection
    #[error("SQLite connection lock poisoned")]
    #[diagnostic(code(sqlcache_sqlite::poisoned))]
    Poisoned,
}

/// Result type for SQLite execution
pub type Result<T> = std::result::Result<T, Error>;
