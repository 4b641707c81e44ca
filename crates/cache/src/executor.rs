//! The boundary to whatever actually runs SQL

use crate::table::{Table, Value};
use std::sync::Arc;

/// Executes a query against a live database
///
/// Implementations own the connection; the cache only ever hands over the
/// query text exactly as the caller wrote it plus the ordered parameters.
/// Errors are passed back to the caller unchanged and never cached.
pub trait QueryExecutor {
    /// Failure reported by the database or driver
    type Error: std::error::Error + Send + Sync + 'static;

    /// Run `sql` with positional `params` and materialize the full result
    ///
    /// # Errors
    ///
    /// Returns the driver's error when the statement cannot be executed.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<Table, Self::Error>;
}

impl<T: QueryExecutor + ?Sized> QueryExecutor for &T {
    type Error = T::Error;

    fn execute(&self, sql: &str, params: &[Value]) -> Result<Table, Self::Error> {
        (**self).execute(sql, params)
    }
}

impl<T: QueryExecutor + ?Sized> QueryExecutor for Box<T> {
    type Error = T::Error;

    fn execute(&self, sql: &str, params: &[Value]) -> Result<Table, Self::Error> {
        (**self).execute(sql, params)
    }
}

impl<T: QueryExecutor + ?Sized> QueryExecutor for Arc<T> {
    type Error = T::Error;

    fn execute(&self, sql: &str, params: &[Value]) -> Result<Table, Self::Error> {
        (**self).execute(sql, params)
    }
}

/// Adapts a closure into a [`QueryExecutor`]
pub struct FnExecutor<F>(pub F);

impl<F, E> QueryExecutor for FnExecutor<F>
where
    F: Fn(&str, &[Value]) -> Result<Table, E>,
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    fn execute(&self, sql: &str, params: &[Value]) -> Result<Table, E> {
        (self.0)(sql, params)
    }
}

impl<F> std::fmt::Debug for FnExecutor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnExecutor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Column, ColumnData};

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn closures_and_references_execute() {
        let exec = FnExecutor(|sql: &str, params: &[Value]| -> Result<Table, Boom> {
            if sql.contains("fail") {
                return Err(Boom);
            }
            Table::new(vec![Column::new(
                "n",
                ColumnData::Int64(vec![Some(params.len() as i64)]),
            )])
            .map_err(|_| Boom)
        });

        let by_ref = &exec;
        let table = by_ref.execute("select ?", &[Value::Int64(1)]).unwrap();
        assert_eq!(table.row(0), Some(vec![Value::Int64(1)]));

        let shared: Arc<dyn QueryExecutor<Error = Boom>> = Arc::new(exec);
        assert_eq!(shared.execute("fail", &[]).unwrap_err().to_string(), "boom");
    }
}
