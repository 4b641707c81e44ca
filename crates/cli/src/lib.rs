//! Command-line surface for sqlcache
//!
//! Maintenance commands (`list`, `stats`, `prune`, `evict`, `export`,
//! `import`) operate on a cache directory; `query` runs SQL against a SQLite
//! file through a [`sqlcache::CacheManager`].

#![expect(clippy::missing_errors_doc, reason = "CLI errors are rendered, not matched")]

pub mod cli;
pub mod commands;
pub mod tracing;

use cli::{Cli, EXIT_OK, exit_code_for, render_error};
use std::io::{self, Write};

/// Run a parsed command line to completion and return the process exit code
pub fn run(cli: &Cli) -> i32 {
    let tracing_config = tracing::TracingConfig {
        format: if cli.json {
            tracing::TracingFormat::Json
        } else {
            cli.log_format
        },
        level: cli.level.into(),
        ..Default::default()
    };
    // Ignore error if tracing already initialized (e.g., in tests)
    let _ = tracing::init_tracing(tracing_config);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match commands::execute(cli, &mut out) {
        Ok(()) => EXIT_OK,
        Err(err) => {
            render_error(&err, cli.json, &mut out);
            let _ = out.flush();
            exit_code_for(&err)
        }
    }
}
