//! Serve-or-execute orchestration
//!
//! Every request walks the same states:
//!
//! ```text
//! LOOKUP -> HIT_FRESH ----------------------> SERVE
//!        -> HIT_STALE -> EXECUTE -> (put) -> SERVE
//!        -> MISS      -> EXECUTE -> (put) -> SERVE
//! ```
//!
//! Failures of the cache itself (unreadable entries, a read-only or missing
//! cache directory) degrade to re-execution. Failures of the executor are
//! returned to the caller and never cached.

use crate::codec::Codec;
use crate::executor::QueryExecutor;
use crate::identity::DbIdentity;
use crate::key::{CacheKey, DerivedKey, derive_key};
use crate::store::{CacheEntry, CacheStore, EntryInfo, EntryMeta, PruneReport};
use crate::table::{Table, Value};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::time::Instant;

/// When a cached result may be served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreshnessPolicy {
    /// Oldest acceptable entry; `None` accepts any age
    pub max_age: Option<Duration>,
    /// Execute even when a fresh entry exists, then overwrite it
    pub force_refresh: bool,
    /// Execute without reading or writing the cache at all
    pub bypass: bool,
}

impl FreshnessPolicy {
    /// Serve any cached entry regardless of age
    #[must_use]
    pub const fn any_age() -> Self {
        Self {
            max_age: None,
            force_refresh: false,
            bypass: false,
        }
    }

    /// Serve entries no older than `max_age`
    #[must_use]
    pub const fn fresh_within(max_age: Duration) -> Self {
        Self {
            max_age: Some(max_age),
            force_refresh: false,
            bypass: false,
        }
    }

    /// Always execute and replace the cached entry
    #[must_use]
    pub const fn refresh() -> Self {
        Self {
            max_age: None,
            force_refresh: true,
            bypass: false,
        }
    }

    /// Execute and leave the cache untouched
    #[must_use]
    pub const fn bypass() -> Self {
        Self {
            max_age: None,
            force_refresh: false,
            bypass: true,
        }
    }

    /// Set or clear the age limit
    #[must_use]
    pub const fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    /// Toggle forced refresh
    #[must_use]
    pub const fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    /// Whether an entry created at `created_at` may be served at `now`
    ///
    /// Entries stamped in the future (clock skew between writers) count as
    /// age zero.
    #[must_use]
    pub fn accepts(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        !self.force_refresh
            && self
                .max_age
                .is_none_or(|limit| now.signed_duration_since(created_at) <= limit)
    }
}

/// A served result
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    /// The decoded or freshly executed table, owned by the caller
    pub table: Table,
    /// True when no execution happened
    pub served_from_cache: bool,
    /// Key the result is stored under
    pub key: CacheKey,
    /// When the served data was produced
    pub created_at: DateTime<Utc>,
}

enum Lookup {
    Fresh(Table, DateTime<Utc>),
    Stale,
    Miss,
}

/// Caches results of a [`QueryExecutor`] in a [`CacheStore`]
#[derive(Debug)]
pub struct CacheManager<E> {
    store: CacheStore,
    executor: E,
    identity: DbIdentity,
    codec: Codec,
    name: Option<String>,
}

impl<E: QueryExecutor> CacheManager<E> {
    /// Cache `executor`'s results for the database named by `identity`
    #[must_use]
    pub fn new(store: CacheStore, executor: E, identity: DbIdentity) -> Self {
        Self {
            store,
            executor,
            identity,
            codec: Codec::default(),
            name: None,
        }
    }

    /// Use a specific codec (compression level) for new entries
    #[must_use]
    pub const fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Record a logical cache name in entry metadata
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Backing store
    #[must_use]
    pub const fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Wrapped executor
    #[must_use]
    pub const fn executor(&self) -> &E {
        &self.executor
    }

    /// Database identity mixed into every key
    #[must_use]
    pub const fn identity(&self) -> &DbIdentity {
        &self.identity
    }

    /// Key a query would be cached under
    #[must_use]
    pub fn key_for(&self, sql: &str, params: &[Value]) -> CacheKey {
        derive_key(sql, params, self.identity.as_str()).key
    }

    /// Serve `sql` from the cache when `policy` allows, otherwise execute it
    /// and cache the result
    ///
    /// # Errors
    ///
    /// Returns [`Error::Execution`] when the executor fails. Cache failures
    /// are logged and never returned.
    #[tracing::instrument(
        name = "sqlcache_query",
        skip_all,
        fields(key = tracing::field::Empty, force_refresh = policy.force_refresh, bypass = policy.bypass)
    )]
    pub fn query(
        &self,
        sql: &str,
        params: &[Value],
        policy: &FreshnessPolicy,
    ) -> Result<QueryOutcome> {
        let derived = derive_key(sql, params, self.identity.as_str());
        tracing::Span::current().record("key", derived.key.short());

        if policy.bypass {
            tracing::debug!("Cache bypassed");
            let (table, created_at, _) = self.execute(sql, params)?;
            return Ok(QueryOutcome {
                table,
                served_from_cache: false,
                key: derived.key,
                created_at,
            });
        }

        tracing::debug!(state = "LOOKUP");
        match self.lookup(&derived.key, policy) {
            Lookup::Fresh(table, created_at) => {
                tracing::debug!(state = "HIT_FRESH", rows = table.row_count());
                return Ok(QueryOutcome {
                    table,
                    served_from_cache: true,
                    key: derived.key,
                    created_at,
                });
            }
            Lookup::Stale => tracing::debug!(state = "HIT_STALE"),
            Lookup::Miss => tracing::debug!(state = "MISS"),
        }

        tracing::debug!(state = "EXECUTE");
        let (table, created_at, duration_ms) = self.execute(sql, params)?;

        if derived.volatile && policy.max_age.is_none() {
            tracing::warn!(
                key = %derived.key.short(),
                "Caching result of a query that calls a volatile function without an age limit"
            );
        }
        self.commit(sql, params, &derived, &table, created_at, duration_ms);

        tracing::debug!(state = "SERVE", rows = table.row_count());
        Ok(QueryOutcome {
            table,
            served_from_cache: false,
            key: derived.key,
            created_at,
        })
    }

    fn lookup(&self, key: &CacheKey, policy: &FreshnessPolicy) -> Lookup {
        let entry = match self.store.get(key) {
            Ok(entry) => entry,
            Err(e) if e.is_not_found() => return Lookup::Miss,
            Err(e) if e.is_corrupt() => {
                tracing::warn!(key = %key.short(), error = %e, "Corrupt cache entry, re-executing");
                return Lookup::Stale;
            }
            Err(e) => {
                tracing::warn!(key = %key.short(), error = %e, "Cache read failed, re-executing");
                return Lookup::Miss;
            }
        };

        let created_at = entry.meta.created_at;
        if !policy.accepts(created_at, Utc::now()) {
            tracing::debug!(
                key = %key.short(),
                age_secs = Utc::now().signed_duration_since(created_at).num_seconds(),
                "Cached entry not acceptable under freshness policy"
            );
            return Lookup::Stale;
        }

        match self.decode(&entry) {
            Ok(table) => Lookup::Fresh(table, created_at),
            Err(e) => {
                tracing::warn!(key = %key.short(), error = %e, "Corrupt cache entry, re-executing");
                Lookup::Stale
            }
        }
    }

    fn decode(&self, entry: &CacheEntry) -> Result<Table> {
        let key = entry.meta.key.as_hex();
        let table = self
            .codec
            .decode(&entry.payload)
            .map_err(|e| e.with_key(key))?;
        if table.row_count() as u64 != entry.meta.row_count || table.schema() != entry.meta.schema
        {
            return Err(Error::corrupt(key, "payload does not match header schema"));
        }
        Ok(table)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<(Table, DateTime<Utc>, u64)> {
        let created_at = Utc::now();
        let started = Instant::now();
        let table = self
            .executor
            .execute(sql, params)
            .map_err(Error::execution)?;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            rows = table.row_count(),
            columns = table.column_count(),
            duration_ms,
            "Executed query"
        );
        Ok((table, created_at, duration_ms))
    }

    /// Write a fresh result back; failures are logged, never returned
    fn commit(
        &self,
        sql: &str,
        params: &[Value],
        derived: &DerivedKey,
        table: &Table,
        created_at: DateTime<Utc>,
        duration_ms: u64,
    ) {
        let payload = match self.codec.encode(table) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(key = %derived.key.short(), error = %e, "Failed to encode result, not caching");
                return;
            }
        };

        let mut meta = EntryMeta::new(derived.key.clone(), sql, table);
        meta.db_identity = self.identity.as_str().to_string();
        meta.cache_name.clone_from(&self.name);
        meta.username = self.identity.username().map(str::to_string);
        meta.param_count = params.len();
        meta.normalization = derived.normalization;
        meta.volatile = derived.volatile;
        meta.created_at = created_at;
        meta.duration_ms = duration_ms;

        let entry = CacheEntry::new(meta, payload);
        if let Err(e) = self.store.put(&derived.key, &entry) {
            tracing::warn!(key = %derived.key.short(), error = %e, "Failed to cache result");
        }
    }

    /// Drop the cached result for `sql` with `params`
    ///
    /// Returns whether an entry existed.
    pub fn invalidate(&self, sql: &str, params: &[Value]) -> Result<bool> {
        self.store.evict(&self.key_for(sql, params))
    }

    /// Whether a result for `sql` with `params` is cached, fresh or not
    #[must_use]
    pub fn exists_in_cache(&self, sql: &str, params: &[Value]) -> bool {
        self.store.contains(&self.key_for(sql, params))
    }

    /// Apply size and age limits to the backing store
    pub fn prune(
        &self,
        max_total_size: Option<u64>,
        max_age: Option<Duration>,
    ) -> Result<PruneReport> {
        self.store.enforce_limits(max_total_size, max_age)
    }

    /// Metadata of all cached results
    pub fn entries(&self) -> Result<Vec<EntryInfo>> {
        self.store.list()
    }
}
