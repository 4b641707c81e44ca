//! On-disk caching of SQL query results
//!
//! Repeated analytical queries are served from a local cache directory
//! instead of being re-run against the database:
//! - Keys are derived from the normalized query text, the ordered bound
//!   parameters and a credential-free database identity
//! - Results are stored in a compressed columnar binary format that keeps
//!   every value's type (nulls, NaN, dates, offset timestamps)
//! - Entries are committed atomically, so any number of processes can share
//!   one cache directory
//! - Size and age limits are enforced by pruning the oldest entries
//!
//! # Overview
//!
//! ```no_run
//! use sqlcache::{CacheManager, CacheStore, DbIdentity, FreshnessPolicy};
//! # fn run<E: sqlcache::QueryExecutor>(executor: E) -> sqlcache::Result<()> {
//! let store = CacheStore::open("/tmp/sqlcache/warehouse")?;
//! let manager = CacheManager::new(
//!     store,
//!     executor,
//!     DbIdentity::from_connection_string("postgresql://analyst@db/warehouse"),
//! );
//! let policy = FreshnessPolicy::fresh_within(chrono::Duration::hours(1));
//! let outcome = manager.query("SELECT region, sum(total) FROM sales GROUP BY 1", &[], &policy)?;
//! println!("{} rows, cached: {}", outcome.table.row_count(), outcome.served_from_cache);
//! # Ok(())
//! # }
//! ```

#![expect(
    clippy::missing_errors_doc,
    reason = "Fallible operations share the crate error type documented on `Error`"
)]

pub mod codec;
pub mod config;
mod error;
pub mod executor;
pub mod identity;
pub mod key;
pub mod manager;
pub mod store;
pub mod table;

// Re-export error types at crate root
pub use error::{BoxError, Error, Result};

// Re-export main types
pub use codec::Codec;
pub use config::{CacheConfig, CacheInputs, cache_root, cache_root_from_inputs};
pub use executor::{FnExecutor, QueryExecutor};
pub use identity::DbIdentity;
pub use key::{CacheKey, DerivedKey, Normalization, derive, derive_key, normalize};
pub use manager::{CacheManager, FreshnessPolicy, QueryOutcome};
pub use store::{
    ArchiveReport, CacheEntry, CacheStore, EntryInfo, EntryMeta, PruneReport, StoreStats,
};
pub use table::{Column, ColumnData, ColumnSchema, DataType, Table, TableBuilder, Value};
