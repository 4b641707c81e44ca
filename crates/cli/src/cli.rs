//! Argument parsing, error mapping and JSON envelopes

use crate::tracing::{LogLevel, TracingFormat};
use clap::{Parser, Subcommand};
use miette::{Diagnostic, Report};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the CLI application
pub const EXIT_OK: i32 = 0;
/// CLI or configuration error exit code
pub const EXIT_CLI: i32 = 2;
/// Cache, database or I/O failure exit code
pub const EXIT_RUNTIME: i32 = 3;

/// CLI-specific error types with proper exit code mapping
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum CliError {
    /// CLI or configuration error (exit code 2)
    #[error("Configuration error: {message}")]
    #[diagnostic(code(sqlcache::cli::config))]
    Config {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// The query itself failed (exit code 3)
    #[error("Query failed: {message}")]
    #[diagnostic(code(sqlcache::cli::query))]
    Query {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Cache or I/O failure (exit code 3)
    #[error("{message}")]
    #[diagnostic(code(sqlcache::cli::runtime))]
    Runtime {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
}

impl CliError {
    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    /// Create a new query error
    #[must_use]
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            help: None,
        }
    }

    /// Create a new runtime error
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            help: None,
        }
    }

    /// Add help text to an existing error
    #[must_use]
    pub fn with_help(self, help_text: impl Into<String>) -> Self {
        let help = Some(help_text.into());
        match self {
            Self::Config { message, .. } => Self::Config { message, help },
            Self::Query { message, .. } => Self::Query { message, help },
            Self::Runtime { message, .. } => Self::Runtime { message, help },
        }
    }
}

/// Map cache errors onto CLI categories
///
/// - Configuration and malformed keys are user input problems (exit code 2)
/// - Executor failures are query problems (exit code 3)
/// - Everything else is a runtime failure (exit code 3)
impl From<sqlcache::Error> for CliError {
    fn from(err: sqlcache::Error) -> Self {
        match err {
            sqlcache::Error::Configuration { message } => Self::config(message),
            sqlcache::Error::InvalidKey { .. } => Self::config(err.to_string())
                .with_help("Keys are 64 hex characters, as printed by `sqlcache list`"),
            sqlcache::Error::Execution { source } => Self::query(source.to_string()),
            sqlcache::Error::Io {
                source,
                path,
                operation,
            } => {
                let path_str = path
                    .as_ref()
                    .map_or(String::new(), |p| format!(" on {}", p.display()));
                Self::runtime(format!("I/O {operation} failed{path_str}: {source}"))
                    .with_help("Check permissions on the cache directory")
            }
            other => Self::runtime(other.to_string()),
        }
    }
}

impl From<sqlcache_sqlite::Error> for CliError {
    fn from(err: sqlcache_sqlite::Error) -> Self {
        match err {
            sqlcache_sqlite::Error::Open { .. } => Self::config(err.to_string())
                .with_help("Pass the path of an existing SQLite database file"),
            other => Self::query(other.to_string()),
        }
    }
}

/// Map CLI error to appropriate exit code
#[must_use]
pub const fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Config { .. } => EXIT_CLI,
        CliError::Query { .. } | CliError::Runtime { .. } => EXIT_RUNTIME,
    }
}

/// Render an error as a JSON envelope on `out` or as a miette report on stderr
pub fn render_error(err: &CliError, json_mode: bool, out: &mut impl Write) {
    if json_mode {
        let envelope = ErrorEnvelope::new(serde_json::json!({
            "code": match err {
                CliError::Config { .. } => "config",
                CliError::Query { .. } => "query",
                CliError::Runtime { .. } => "runtime",
            },
            "message": err.to_string()
        }));
        let written = serde_json::to_writer(&mut *out, &envelope)
            .map_err(io::Error::other)
            .and_then(|()| writeln!(out));
        if written.is_err() {
            let _ = writeln!(io::stderr(), "Error serializing error response");
        }
    } else {
        let report = Report::new(err.clone());
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{report:?}");
        let _ = stderr.flush();
    }
}

/// Success response envelope for JSON output
#[derive(Debug, Clone, Serialize)]
pub struct OkEnvelope<T> {
    /// Always "ok"
    pub status: &'static str,
    /// The command result
    pub data: T,
}

impl<T> OkEnvelope<T> {
    /// Create a new success envelope
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self { status: "ok", data }
    }
}

/// Error response envelope for JSON output
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope<E> {
    /// Always "error"
    pub status: &'static str,
    /// The error details
    pub error: E,
}

impl<E> ErrorEnvelope<E> {
    /// Create a new error envelope
    #[must_use]
    pub const fn new(error: E) -> Self {
        Self {
            status: "error",
            error,
        }
    }
}

/// Inspect, maintain and query an on-disk SQL result cache.
#[derive(Parser, Debug)]
#[command(name = "sqlcache")]
#[command(about = "Inspect, maintain and query an on-disk SQL result cache")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Cache root directory (defaults to the platform cache directory).
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Logical cache name: a sub-directory of the cache root.
    #[arg(long, short = 'n', global = true)]
    pub name: Option<String>,

    /// TOML file with cache settings; flags override its values.
    #[arg(long, short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Logging verbosity level.
    #[arg(
        short = 'L',
        long,
        global = true,
        default_value = "warn",
        value_enum
    )]
    pub level: LogLevel,

    /// Log line format on stderr.
    #[arg(long, global = true, default_value = "compact", value_enum)]
    pub log_format: TracingFormat,

    /// Emit results and errors as JSON envelopes on stdout.
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// List cached entries, oldest first.
    List,

    /// Show entry count, total size and age range.
    Stats,

    /// Remove expired entries and enforce the size budget.
    Prune {
        /// Total size budget in bytes.
        #[arg(long, value_name = "BYTES")]
        max_size: Option<u64>,
        /// Remove entries older than this many seconds.
        #[arg(long, value_name = "SECS")]
        max_age_secs: Option<u64>,
        /// Report what would be removed without deleting anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove one entry by key.
    Evict {
        /// Cache key (64 hex characters).
        key: String,
    },

    /// Write every valid entry into a .tar.zst archive.
    Export {
        /// Destination archive.
        path: PathBuf,
    },

    /// Load entries from an archive written by `export`.
    Import {
        /// Source archive.
        path: PathBuf,
    },

    /// Run a query against a SQLite database through the cache.
    Query {
        /// SQLite database file.
        db: PathBuf,
        /// SQL statement; `?` placeholders take `--param` values in order.
        sql: String,
        /// Positional parameter (`null`, `true`/`false`, integer, float, otherwise text).
        #[arg(long = "param", short = 'p', value_name = "VALUE")]
        params: Vec<String>,
        /// Only serve cached results younger than this many seconds.
        #[arg(long, value_name = "SECS")]
        max_age_secs: Option<u64>,
        /// Execute even if cached, then replace the entry.
        #[arg(long, conflicts_with = "no_cache")]
        force_refresh: bool,
        /// Execute without reading or writing the cache.
        #[arg(long)]
        no_cache: bool,
    },
}

/// Parse the process arguments
#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}
