//! Subcommand implementations
//!
//! Every command produces a serializable report. With `--json` the report is
//! wrapped in an [`OkEnvelope`]; otherwise it renders itself as text.

use crate::cli::{Cli, CliError, Commands, OkEnvelope};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use sqlcache::{
    ArchiveReport, CacheConfig, CacheKey, CacheManager, CacheStore, ColumnSchema, EntryInfo,
    FreshnessPolicy, PruneReport, StoreStats, Value,
};
use sqlcache_sqlite::SqliteExecutor;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Longest query text shown by `list` before eliding
const QUERY_PREVIEW_CHARS: usize = 60;

/// Command output that can render itself for humans
pub trait Render: Serialize {
    /// Write the human-readable form
    fn render_text(&self, out: &mut dyn Write) -> io::Result<()>;
}

/// Build the effective configuration: file values, then flag overrides
pub fn resolve_config(cli: &Cli) -> Result<CacheConfig, CliError> {
    let mut config = match &cli.config {
        Some(path) => CacheConfig::load(path)?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = &cli.cache_dir {
        config.root = Some(dir.clone());
    }
    if let Some(name) = &cli.name {
        config.name = Some(name.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Run the parsed command, writing its output to `out`
pub fn execute(cli: &Cli, out: &mut dyn Write) -> Result<(), CliError> {
    let config = resolve_config(cli)?;
    tracing::debug!(command = ?cli.command, "Running command");

    match &cli.command {
        Commands::List => emit(&list(&open_existing(&config)?)?, cli.json, out),
        Commands::Stats => emit(&stats(&open_existing(&config)?)?, cli.json, out),
        Commands::Prune {
            max_size,
            max_age_secs,
            dry_run,
        } => {
            let max_size = max_size.or(config.max_total_size);
            let max_age = match max_age_secs {
                Some(secs) => Some(seconds(*secs)?),
                None => config.max_age(),
            };
            let report = prune(&open_existing(&config)?, max_size, max_age, *dry_run)?;
            emit(&report, cli.json, out)
        }
        Commands::Evict { key } => emit(&evict(&open_existing(&config)?, key)?, cli.json, out),
        Commands::Export { path } => {
            emit(&export(&open_existing(&config)?, path)?, cli.json, out)
        }
        Commands::Import { path } => emit(&import(&config.open_store()?, path)?, cli.json, out),
        Commands::Query {
            db,
            sql,
            params,
            max_age_secs,
            force_refresh,
            no_cache,
        } => {
            let policy = if *no_cache {
                FreshnessPolicy::bypass()
            } else {
                FreshnessPolicy::any_age()
                    .with_max_age(max_age_secs.map(seconds).transpose()?)
                    .with_force_refresh(*force_refresh)
            };
            let params: Vec<Value> = params.iter().map(|p| parse_param(p)).collect();
            let report = query(&config, db, sql, &params, &policy)?;
            emit(&report, cli.json, out)
        }
    }
}

fn emit<R: Render>(report: &R, json: bool, out: &mut dyn Write) -> Result<(), CliError> {
    let written = if json {
        serde_json::to_writer(&mut *out, &OkEnvelope::new(report))
            .map_err(io::Error::other)
            .and_then(|()| writeln!(out))
    } else {
        report.render_text(out)
    };
    written
        .and_then(|()| out.flush())
        .map_err(|e| CliError::runtime(format!("Failed to write output: {e}")))
}

/// Read-only commands never create the cache directory
fn open_existing(config: &CacheConfig) -> Result<CacheStore, CliError> {
    let dir = config.resolve_dir()?;
    if !dir.is_dir() {
        return Err(CliError::config(format!(
            "Cache directory {} does not exist",
            dir.display()
        ))
        .with_help("Pass --cache-dir/--name, or run a query to populate the cache"));
    }
    Ok(CacheStore::new(dir))
}

fn seconds(secs: u64) -> Result<Duration, CliError> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| CliError::config(format!("{secs} seconds is out of range")))
}

/// Interpret a `--param` value
#[must_use]
pub fn parse_param(raw: &str) -> Value {
    match raw {
        "null" | "NULL" => Value::Null,
        "true" => Value::Boolean(true),
        "false" => Value::Boolean(false),
        _ => raw
            .parse::<i64>()
            .map(Value::Int64)
            .or_else(|_| raw.parse::<f64>().map(Value::Float64))
            .unwrap_or_else(|_| Value::Text(raw.to_string())),
    }
}

// =============================================================================
// list
// =============================================================================

/// One row of `list` output
#[derive(Debug, Serialize)]
pub struct ListedEntry {
    /// Cache key
    pub key: CacheKey,
    /// When the result was produced
    pub created_at: DateTime<Utc>,
    /// Seconds since `created_at`
    pub age_secs: i64,
    /// Entry file size in bytes
    pub size: u64,
    /// Rows in the cached result
    pub rows: u64,
    /// Execution time of the original query
    pub duration_ms: u64,
    /// Query text as first submitted
    pub query: String,
}

/// `list` output
#[derive(Debug, Serialize)]
pub struct ListReport {
    /// Entries, oldest first
    pub entries: Vec<ListedEntry>,
}

fn list(store: &CacheStore) -> Result<ListReport, CliError> {
    let now = Utc::now();
    let entries = store
        .list()?
        .into_iter()
        .map(|info: EntryInfo| ListedEntry {
            age_secs: info.age(now).num_seconds(),
            key: info.meta.key,
            created_at: info.meta.created_at,
            size: info.size,
            rows: info.meta.row_count,
            duration_ms: info.meta.duration_ms,
            query: info.meta.query_text,
        })
        .collect();
    Ok(ListReport { entries })
}

impl Render for ListReport {
    fn render_text(&self, out: &mut dyn Write) -> io::Result<()> {
        if self.entries.is_empty() {
            return writeln!(out, "No cached entries");
        }
        writeln!(out, "{:<12}  {:>8}  {:>10}  {:>8}  QUERY", "KEY", "AGE", "SIZE", "ROWS")?;
        for entry in &self.entries {
            writeln!(
                out,
                "{:<12}  {:>8}  {:>10}  {:>8}  {}",
                entry.key.short(),
                human_age(entry.age_secs),
                human_bytes(entry.size),
                entry.rows,
                preview(&entry.query)
            )?;
        }
        Ok(())
    }
}

fn preview(query: &str) -> String {
    let flat = query.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= QUERY_PREVIEW_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(QUERY_PREVIEW_CHARS - 3).collect();
    format!("{cut}...")
}

fn human_age(secs: i64) -> String {
    match secs {
        s if s < 60 => format!("{}s", s.max(0)),
        s if s < 3_600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3_600),
        s => format!("{}d", s / 86_400),
    }
}

#[allow(clippy::cast_precision_loss)]
fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

// =============================================================================
// stats
// =============================================================================

/// `stats` output
#[derive(Debug, Serialize)]
pub struct StatsReport {
    /// Cache directory
    pub root: PathBuf,
    /// Aggregates over committed entries
    #[serde(flatten)]
    pub stats: StoreStats,
}

fn stats(store: &CacheStore) -> Result<StatsReport, CliError> {
    Ok(StatsReport {
        root: store.root().to_path_buf(),
        stats: store.stats()?,
    })
}

impl Render for StatsReport {
    fn render_text(&self, out: &mut dyn Write) -> io::Result<()> {
        let stamp = |t: Option<DateTime<Utc>>| {
            t.map_or_else(
                || "-".to_string(),
                |t| t.to_rfc3339_opts(SecondsFormat::Secs, true),
            )
        };
        writeln!(out, "Cache:   {}", self.root.display())?;
        writeln!(out, "Entries: {}", self.stats.entries)?;
        writeln!(
            out,
            "Size:    {} ({} bytes)",
            human_bytes(self.stats.total_bytes),
            self.stats.total_bytes
        )?;
        writeln!(out, "Oldest:  {}", stamp(self.stats.oldest))?;
        writeln!(out, "Newest:  {}", stamp(self.stats.newest))
    }
}

// =============================================================================
// prune / evict
// =============================================================================

fn prune(
    store: &CacheStore,
    max_size: Option<u64>,
    max_age: Option<Duration>,
    dry_run: bool,
) -> Result<PruneReport, CliError> {
    if max_size.is_none() && max_age.is_none() {
        tracing::info!("No limits configured; only stale temporary and unreadable files are removed");
    }
    let report = if dry_run {
        store.preview_limits(max_size, max_age)?
    } else {
        store.enforce_limits(max_size, max_age)?
    };
    Ok(report)
}

impl Render for PruneReport {
    fn render_text(&self, out: &mut dyn Write) -> io::Result<()> {
        let verb = if self.dry_run { "Would remove" } else { "Removed" };
        writeln!(
            out,
            "{verb} {} entries ({} expired, {} over budget), {} unreadable and {} temporary files, freeing {}",
            self.removed.len(),
            self.expired,
            self.evicted_for_size,
            self.unreadable,
            self.temp_files,
            human_bytes(self.bytes_freed)
        )?;
        for key in &self.removed {
            writeln!(out, "  {key}")?;
        }
        writeln!(
            out,
            "Remaining: {} entries, {}",
            self.remaining_entries,
            human_bytes(self.remaining_bytes)
        )
    }
}

/// `evict` output
#[derive(Debug, Serialize)]
pub struct EvictReport {
    /// Requested key
    pub key: CacheKey,
    /// Whether an entry was present and removed
    pub removed: bool,
}

fn evict(store: &CacheStore, key: &str) -> Result<EvictReport, CliError> {
    let key: CacheKey = key.parse()?;
    let removed = store.evict(&key)?;
    Ok(EvictReport { key, removed })
}

impl Render for EvictReport {
    fn render_text(&self, out: &mut dyn Write) -> io::Result<()> {
        if self.removed {
            writeln!(out, "Evicted {}", self.key)
        } else {
            writeln!(out, "No entry for {}", self.key)
        }
    }
}

// =============================================================================
// export / import
// =============================================================================

fn export(store: &CacheStore, path: &Path) -> Result<ArchiveReport, CliError> {
    Ok(store.export(path)?)
}

fn import(store: &CacheStore, path: &Path) -> Result<ArchiveReport, CliError> {
    Ok(store.import(path)?)
}

impl Render for ArchiveReport {
    fn render_text(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "{} entries via {}", self.entries, self.path.display())?;
        if self.skipped > 0 {
            writeln!(out, "Skipped {} invalid members", self.skipped)?;
        }
        Ok(())
    }
}

// =============================================================================
// query
// =============================================================================

/// `query` output
#[derive(Debug, Serialize)]
pub struct QueryReport {
    /// Cache key of the result
    pub key: CacheKey,
    /// Whether the rows came from the cache
    pub served_from_cache: bool,
    /// When the rows were produced by the database
    pub created_at: DateTime<Utc>,
    /// Column names and types
    pub columns: Vec<ColumnSchema>,
    /// Row-major cell values
    pub rows: Vec<Vec<serde_json::Value>>,
}

fn query(
    config: &CacheConfig,
    db: &Path,
    sql: &str,
    params: &[Value],
    policy: &FreshnessPolicy,
) -> Result<QueryReport, CliError> {
    let executor = SqliteExecutor::open(db)?;
    let identity = executor.identity();
    let (store, policy) = match query_store(config)? {
        Some(store) => (store, *policy),
        None => (CacheStore::new(std::env::temp_dir()), FreshnessPolicy::bypass()),
    };
    let mut manager = CacheManager::new(store, executor, identity).with_codec(config.codec());
    if let Some(name) = &config.name {
        manager = manager.with_name(name.clone());
    }

    let outcome = manager.query(sql, params, &policy)?;
    tracing::info!(
        key = %outcome.key,
        served_from_cache = outcome.served_from_cache,
        rows = outcome.table.row_count(),
        "Query complete"
    );

    let rows = (0..outcome.table.row_count())
        .filter_map(|i| outcome.table.row(i))
        .map(|row| row.iter().map(json_cell).collect())
        .collect();
    Ok(QueryReport {
        key: outcome.key,
        served_from_cache: outcome.served_from_cache,
        created_at: outcome.created_at,
        columns: outcome.table.schema(),
        rows,
    })
}

/// Store for the query command
///
/// The directory is not created up front: when it is unusable, lookups and
/// commits fail inside the manager, which logs them and serves live rows.
/// Without any cache root the query runs uncached.
fn query_store(config: &CacheConfig) -> Result<Option<CacheStore>, CliError> {
    match config.resolve_dir() {
        Ok(dir) => Ok(Some(CacheStore::new(dir))),
        Err(e @ sqlcache::Error::Configuration { .. }) => Err(e.into()),
        Err(e) => {
            tracing::warn!(error = %e, "No usable cache root; running the query uncached");
            Ok(None)
        }
    }
}

fn json_cell(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;
    match value {
        Value::Null => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Int8(v) => Json::from(*v),
        Value::Int16(v) => Json::from(*v),
        Value::Int32(v) => Json::from(*v),
        Value::Int64(v) => Json::from(*v),
        Value::Float32(v) => float_cell(f64::from(*v)),
        Value::Float64(v) => float_cell(*v),
        Value::Text(s) => Json::String(s.clone()),
        Value::Binary(b) => Json::String(hex::encode(b)),
        Value::Date(d) => Json::String(d.format("%Y-%m-%d").to_string()),
        Value::Timestamp(ts) => Json::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
    }
}

/// JSON has no NaN or infinities; those become strings
fn float_cell(v: f64) -> serde_json::Value {
    serde_json::Number::from_f64(v)
        .map_or_else(|| serde_json::Value::String(v.to_string()), serde_json::Value::Number)
}

fn text_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Render for QueryReport {
    fn render_text(&self, out: &mut dyn Write) -> io::Result<()> {
        let header: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        writeln!(out, "{}", header.join("\t"))?;
        for row in &self.rows {
            let cells: Vec<String> = row.iter().map(text_cell).collect();
            writeln!(out, "{}", cells.join("\t"))?;
        }
        Ok(())
    }
}
