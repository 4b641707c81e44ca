//! SQLite query executor for sqlcache
//!
//! [`SqliteExecutor`] runs statements through `rusqlite` and materializes the
//! full result set as a [`sqlcache::Table`], so a [`sqlcache::CacheManager`]
//! can sit in front of a local SQLite database.
//!
//! ```no_run
//! use sqlcache::{CacheManager, CacheStore, FreshnessPolicy};
//! use sqlcache_sqlite::SqliteExecutor;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = SqliteExecutor::open("analytics.db")?;
//! let identity = executor.identity();
//! let manager = CacheManager::new(CacheStore::open("/tmp/sqlcache")?, executor, identity);
//! let outcome = manager.query("SELECT * FROM sales", &[], &FreshnessPolicy::any_age())?;
//! println!("{} rows", outcome.table.row_count());
//! # Ok(())
//! # }
//! ```

mod error;
mod types;

pub use error::{Error, Result};

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags};
use sqlcache::{Column, ColumnData, DataType, DbIdentity, QueryExecutor, Table, Value};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Identity used for connections that have no backing file
const MEMORY_IDENTITY: &str = "sqlite::memory:";

/// A [`QueryExecutor`] over one SQLite connection
///
/// The connection sits behind a mutex so one executor can be shared between
/// threads; statements run one at a time.
#[derive(Debug)]
pub struct SqliteExecutor {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteExecutor {
    /// Open an existing database file for reading and writing
    ///
    /// The file is never created: a mistyped path fails here instead of
    /// silently caching results from an empty database.
    #[tracing::instrument(name = "sqlite_open", skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        tracing::debug!(path = %path.display(), "Opened SQLite database");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// A private in-memory database, empty until populated
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    /// Wrap a connection opened elsewhere
    #[must_use]
    pub fn from_connection(conn: Connection) -> Self {
        let path = conn
            .path()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        Self {
            conn: Mutex::new(conn),
            path,
        }
    }

    /// Database file backing this executor, if any
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Identity to key cached results by: the canonical database file path
    #[must_use]
    pub fn identity(&self) -> DbIdentity {
        self.path.as_ref().map_or_else(
            || DbIdentity::new(MEMORY_IDENTITY),
            |p| DbIdentity::new(format!("sqlite://{}", p.display())),
        )
    }

    /// Run `f` with exclusive access to the connection (schema setup, seeding)
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.lock()?;
        Ok(f(&conn)?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::Poisoned)
    }
}

impl QueryExecutor for SqliteExecutor {
    type Error = Error;

    #[tracing::instrument(name = "sqlite_execute", skip_all, fields(params = params.len()))]
    fn execute(&self, sql: &str, params: &[Value]) -> Result<Table> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;

        let declared: Vec<(String, Option<String>)> = stmt
            .columns()
            .iter()
            .map(|c| (c.name().to_string(), c.decl_type().map(str::to_string)))
            .collect();

        let mut cells: Vec<Vec<SqlValue>> = vec![Vec::new(); declared.len()];
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter().map(types::to_sql)))?;
        while let Some(row) = rows.next()? {
            for (i, column) in cells.iter_mut().enumerate() {
                column.push(row.get::<_, SqlValue>(i)?);
            }
        }

        let columns = declared
            .into_iter()
            .zip(cells)
            .map(|((name, decl), values)| build_column(name, decl.as_deref(), &values))
            .collect::<Result<Vec<_>>>()?;
        let table = Table::new(columns)?;
        tracing::debug!(
            rows = table.row_count(),
            columns = table.column_count(),
            "SQLite statement complete"
        );
        Ok(table)
    }
}

/// Type a column from its declaration, falling back to the values it holds
fn build_column(name: String, decl: Option<&str>, values: &[SqlValue]) -> Result<Column> {
    if let Some(data_type) = decl.and_then(types::declared_type)
        && let Some(data) = fill(data_type, values)
    {
        return Ok(Column::new(name, data));
    }

    let data_type = types::inferred_type(values);
    let data = fill(data_type, values).ok_or_else(|| {
        sqlcache::Error::schema(format!(
            "column '{name}' mixes values that cannot share one {data_type} column"
        ))
    })?;
    Ok(Column::new(name, data))
}

fn fill(data_type: DataType, values: &[SqlValue]) -> Option<ColumnData> {
    let mut data = ColumnData::with_capacity(data_type, values.len());
    for value in values {
        data.push(types::convert(value, data_type)?).ok()?;
    }
    Some(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_types_drive_columns() {
        let executor = SqliteExecutor::open_in_memory().unwrap();
        executor
            .with_connection(|c| {
                c.execute_batch(
                    "CREATE TABLE t (id INTEGER, ok BOOLEAN, code CHAR(2), day DATE);
                     INSERT INTO t VALUES (1, 1, 'ab', '2024-05-01'), (2, 0, NULL, NULL);",
                )
            })
            .unwrap();

        let table = executor.execute("SELECT * FROM t ORDER BY id", &[]).unwrap();
        let types: Vec<_> = table.schema().into_iter().map(|s| s.data_type).collect();
        assert_eq!(
            types,
            vec![
                DataType::Int64,
                DataType::Boolean,
                DataType::FixedText { width: 2 },
                DataType::Date
            ]
        );
        assert_eq!(table.row(1).unwrap()[2], Value::Null);
    }

    #[test]
    fn undeclared_or_ill_fitting_columns_are_inferred() {
        let executor = SqliteExecutor::open_in_memory().unwrap();
        executor
            .with_connection(|c| {
                c.execute_batch(
                    "CREATE TABLE t (n INTEGER);
                     INSERT INTO t VALUES (1), ('not a number');",
                )
            })
            .unwrap();

        let table = executor.execute("SELECT n FROM t", &[]).unwrap();
        assert_eq!(table.schema()[0].data_type, DataType::Text);

        let table = executor.execute("SELECT 1 + 1, 0.5 * 3, 'x'", &[]).unwrap();
        let types: Vec<_> = table.schema().into_iter().map(|s| s.data_type).collect();
        assert_eq!(types, vec![DataType::Int64, DataType::Float64, DataType::Text]);
    }

    #[test]
    fn parameters_are_positional() {
        let executor = SqliteExecutor::open_in_memory().unwrap();
        let table = executor
            .execute("SELECT ? - ?", &[Value::Int64(10), Value::Int32(3)])
            .unwrap();
        assert_eq!(table.row(0).unwrap(), vec![Value::Int64(7)]);
    }

    #[test]
    fn memory_identity() {
        let executor = SqliteExecutor::open_in_memory().unwrap();
        assert_eq!(executor.identity().as_str(), MEMORY_IDENTITY);
        assert!(executor.path().is_none());
    }

    #[test]
    fn missing_file_is_not_created() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("absent.db");
        let err = SqliteExecutor::open(&path).unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
        assert!(!path.exists());
    }
}
