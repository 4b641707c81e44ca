//! Mapping between SQLite storage classes and the typed tabular model
//!
//! SQLite columns are dynamically typed, so a column's type is taken from its
//! declaration when every value fits it, and otherwise inferred from the
//! values actually returned.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat};
use rusqlite::types::Value as SqlValue;
use sqlcache::{DataType, Value};

/// Bind a cache value as a SQLite parameter
pub(crate) fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int8(v) => SqlValue::Integer(i64::from(*v)),
        Value::Int16(v) => SqlValue::Integer(i64::from(*v)),
        Value::Int32(v) => SqlValue::Integer(i64::from(*v)),
        Value::Int64(v) => SqlValue::Integer(*v),
        Value::Float32(v) => SqlValue::Real(f64::from(*v)),
        Value::Float64(v) => SqlValue::Real(*v),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Binary(b) => SqlValue::Blob(b.clone()),
        Value::Date(d) => SqlValue::Text(d.format("%Y-%m-%d").to_string()),
        Value::Timestamp(ts) => SqlValue::Text(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
    }
}

/// Type named by a column declaration, following SQLite's affinity rules
/// with a few common extensions (`BOOLEAN`, `DATE`, `DATETIME`, `CHAR(n)`)
pub(crate) fn declared_type(decl: &str) -> Option<DataType> {
    let decl = decl.trim().to_ascii_uppercase();
    if decl.is_empty() {
        return None;
    }
    if decl.starts_with("BOOL") {
        return Some(DataType::Boolean);
    }
    if decl.contains("TIMESTAMP") || decl.contains("DATETIME") {
        return Some(DataType::Timestamp);
    }
    if decl == "DATE" {
        return Some(DataType::Date);
    }
    if decl.contains("INT") {
        return Some(DataType::Int64);
    }
    if let Some(width) = fixed_char_width(&decl) {
        return Some(DataType::FixedText { width });
    }
    if decl.contains("CHAR") || decl.contains("CLOB") || decl.contains("TEXT") {
        return Some(DataType::Text);
    }
    if decl.contains("BLOB") {
        return Some(DataType::Binary);
    }
    if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") {
        return Some(DataType::Float64);
    }
    // NUMERIC affinity holds integers or reals; let the values decide
    None
}

/// `CHAR(n)` / `CHARACTER(n)` / `NCHAR(n)`, but not `VARCHAR(n)`
fn fixed_char_width(decl: &str) -> Option<u32> {
    let (head, rest) = decl.split_once('(')?;
    if !matches!(head.trim(), "CHAR" | "CHARACTER" | "NCHAR" | "NATIONAL CHARACTER") {
        return None;
    }
    rest.strip_suffix(')')?.trim().parse().ok()
}

/// Narrowest type that can hold every returned value
pub(crate) fn inferred_type(values: &[SqlValue]) -> DataType {
    let (mut ints, mut reals, mut texts, mut blobs) = (false, false, false, false);
    for value in values {
        match value {
            SqlValue::Null => {}
            SqlValue::Integer(_) => ints = true,
            SqlValue::Real(_) => reals = true,
            SqlValue::Text(_) => texts = true,
            SqlValue::Blob(_) => blobs = true,
        }
    }
    match (ints, reals, texts, blobs) {
        (_, _, _, true) => DataType::Binary,
        (_, _, true, false) => DataType::Text,
        (_, true, false, false) => DataType::Float64,
        (true, false, false, false) => DataType::Int64,
        _ => DataType::Text,
    }
}

/// Convert one returned value to `data_type`, or `None` if it does not fit
pub(crate) fn convert(value: &SqlValue, data_type: DataType) -> Option<Value> {
    if matches!(value, SqlValue::Null) {
        return Some(Value::Null);
    }
    match (data_type, value) {
        (DataType::Boolean, SqlValue::Integer(0)) => Some(Value::Boolean(false)),
        (DataType::Boolean, SqlValue::Integer(1)) => Some(Value::Boolean(true)),
        (DataType::Int64, SqlValue::Integer(i)) => Some(Value::Int64(*i)),
        (DataType::Float64, SqlValue::Real(f)) => Some(Value::Float64(*f)),
        #[allow(clippy::cast_precision_loss)]
        (DataType::Float64, SqlValue::Integer(i)) => Some(Value::Float64(*i as f64)),
        (DataType::Text | DataType::FixedText { .. }, SqlValue::Text(s)) => {
            Some(Value::Text(s.clone()))
        }
        (DataType::Text, SqlValue::Integer(i)) => Some(Value::Text(i.to_string())),
        (DataType::Text, SqlValue::Real(f)) => Some(Value::Text(f.to_string())),
        (DataType::Binary, SqlValue::Blob(b)) => Some(Value::Binary(b.clone())),
        (DataType::Binary, SqlValue::Text(s)) => Some(Value::Binary(s.as_bytes().to_vec())),
        (DataType::Date, SqlValue::Text(s)) => {
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok().map(Value::Date)
        }
        (DataType::Timestamp, SqlValue::Text(s)) => parse_timestamp(s).map(Value::Timestamp),
        (DataType::Timestamp, SqlValue::Integer(secs)) => DateTime::from_timestamp(*secs, 0)
            .map(|ts| Value::Timestamp(ts.fixed_offset())),
        _ => None,
    }
}

/// RFC 3339, or SQLite's `YYYY-MM-DD HH:MM:SS[.SSS]` taken as UTC
fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts);
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc().fixed_offset())
}
