//! In-memory tabular model for query results
//!
//! A [`Table`] is an ordered list of named, typed columns of equal length.
//! Column storage is columnar and strongly typed: each [`ColumnData`] variant
//! holds one `Vec<Option<T>>`, where `None` is a SQL NULL. Scalars crossing the
//! API boundary (bind parameters, row-wise construction) use the closed
//! [`Value`] union.
//!
//! Equality treats floats bitwise, so a column holding `NaN` compares equal to
//! itself and `-0.0` is distinct from `0.0`. That is the notion of equality the
//! codec round-trip guarantees.

use crate::{Error, Result};
use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DataType {
    /// `BOOLEAN`
    Boolean,
    /// 8-bit signed integer
    Int8,
    /// 16-bit signed integer
    Int16,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// Single precision float
    Float32,
    /// Double precision float
    Float64,
    /// Variable-length UTF-8 text
    Text,
    /// Fixed-width text (`CHAR(n)`), values kept exactly as returned
    FixedText {
        /// Declared width in characters
        width: u32,
    },
    /// Opaque bytes
    Binary,
    /// Calendar date without time zone
    Date,
    /// Instant with its original UTC offset
    Timestamp,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean => f.write_str("boolean"),
            Self::Int8 => f.write_str("int8"),
            Self::Int16 => f.write_str("int16"),
            Self::Int32 => f.write_str("int32"),
            Self::Int64 => f.write_str("int64"),
            Self::Float32 => f.write_str("float32"),
            Self::Float64 => f.write_str("float64"),
            Self::Text => f.write_str("text"),
            Self::FixedText { width } => write!(f, "char({width})"),
            Self::Binary => f.write_str("binary"),
            Self::Date => f.write_str("date"),
            Self::Timestamp => f.write_str("timestamp"),
        }
    }
}

/// A single scalar value
#[derive(Debug, Clone)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean
    Boolean(bool),
    /// 8-bit integer
    Int8(i8),
    /// 16-bit integer
    Int16(i16),
    /// 32-bit integer
    Int32(i32),
    /// 64-bit integer
    Int64(i64),
    /// Single precision float
    Float32(f32),
    /// Double precision float
    Float64(f64),
    /// Text (fixed or variable width)
    Text(String),
    /// Bytes
    Binary(Vec<u8>),
    /// Date
    Date(NaiveDate),
    /// Timestamp with offset
    Timestamp(DateTime<FixedOffset>),
}

impl Value {
    /// True for [`Value::Null`]
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short name of the value's kind, used in diagnostics
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Int8(_) => "int8",
            Self::Int16(_) => "int16",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Float32(_) => "float32",
            Self::Float64(_) => "float64",
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Date(_) => "date",
            Self::Timestamp(_) => "timestamp",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Int8(a), Self::Int8(b)) => a == b,
            (Self::Int16(a), Self::Int16(b)) => a == b,
            (Self::Int32(a), Self::Int32(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Float32(a), Self::Float32(b)) => a.to_bits() == b.to_bits(),
            (Self::Float64(a), Self::Float64(b)) => a.to_bits() == b.to_bits(),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Binary(a), Self::Binary(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b && a.offset() == b.offset(),
            _ => false,
        }
    }
}

macro_rules! impl_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

impl_value_from! {
    bool => Boolean,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
    String => Text,
    Vec<u8> => Binary,
    NaiveDate => Date,
    DateTime<FixedOffset> => Timestamp,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Typed storage for one column; `None` marks a NULL cell
#[derive(Debug, Clone)]
pub enum ColumnData {
    /// Booleans
    Boolean(Vec<Option<bool>>),
    /// 8-bit integers
    Int8(Vec<Option<i8>>),
    /// 16-bit integers
    Int16(Vec<Option<i16>>),
    /// 32-bit integers
    Int32(Vec<Option<i32>>),
    /// 64-bit integers
    Int64(Vec<Option<i64>>),
    /// Single precision floats
    Float32(Vec<Option<f32>>),
    /// Double precision floats
    Float64(Vec<Option<f64>>),
    /// Variable-length text
    Text(Vec<Option<String>>),
    /// Fixed-width text
    FixedText {
        /// Declared width in characters
        width: u32,
        /// Cell values
        values: Vec<Option<String>>,
    },
    /// Bytes
    Binary(Vec<Option<Vec<u8>>>),
    /// Dates
    Date(Vec<Option<NaiveDate>>),
    /// Timestamps with offset
    Timestamp(Vec<Option<DateTime<FixedOffset>>>),
}

macro_rules! each_column {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            ColumnData::Boolean($v) => $body,
            ColumnData::Int8($v) => $body,
            ColumnData::Int16($v) => $body,
            ColumnData::Int32($v) => $body,
            ColumnData::Int64($v) => $body,
            ColumnData::Float32($v) => $body,
            ColumnData::Float64($v) => $body,
            ColumnData::Text($v) => $body,
            ColumnData::FixedText { values: $v, .. } => $body,
            ColumnData::Binary($v) => $body,
            ColumnData::Date($v) => $body,
            ColumnData::Timestamp($v) => $body,
        }
    };
}

impl ColumnData {
    /// Create an empty column of the given type
    #[must_use]
    pub fn empty(data_type: DataType) -> Self {
        Self::with_capacity(data_type, 0)
    }

    /// Create an empty column with room for `capacity` cells
    #[must_use]
    pub fn with_capacity(data_type: DataType, capacity: usize) -> Self {
        match data_type {
            DataType::Boolean => Self::Boolean(Vec::with_capacity(capacity)),
            DataType::Int8 => Self::Int8(Vec::with_capacity(capacity)),
            DataType::Int16 => Self::Int16(Vec::with_capacity(capacity)),
            DataType::Int32 => Self::Int32(Vec::with_capacity(capacity)),
            DataType::Int64 => Self::Int64(Vec::with_capacity(capacity)),
            DataType::Float32 => Self::Float32(Vec::with_capacity(capacity)),
            DataType::Float64 => Self::Float64(Vec::with_capacity(capacity)),
            DataType::Text => Self::Text(Vec::with_capacity(capacity)),
            DataType::FixedText { width } => Self::FixedText {
                width,
                values: Vec::with_capacity(capacity),
            },
            DataType::Binary => Self::Binary(Vec::with_capacity(capacity)),
            DataType::Date => Self::Date(Vec::with_capacity(capacity)),
            DataType::Timestamp => Self::Timestamp(Vec::with_capacity(capacity)),
        }
    }

    /// The column's semantic type
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        match self {
            Self::Boolean(_) => DataType::Boolean,
            Self::Int8(_) => DataType::Int8,
            Self::Int16(_) => DataType::Int16,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::Float32(_) => DataType::Float32,
            Self::Float64(_) => DataType::Float64,
            Self::Text(_) => DataType::Text,
            Self::FixedText { width, .. } => DataType::FixedText { width: *width },
            Self::Binary(_) => DataType::Binary,
            Self::Date(_) => DataType::Date,
            Self::Timestamp(_) => DataType::Timestamp,
        }
    }

    /// Number of cells, NULLs included
    #[must_use]
    pub fn len(&self) -> usize {
        each_column!(self, v => v.len())
    }

    /// True when the column has no cells
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of NULL cells
    #[must_use]
    pub fn null_count(&self) -> usize {
        each_column!(self, v => v.iter().filter(|c| c.is_none()).count())
    }

    /// Check whether the cell at `index` is NULL
    #[must_use]
    pub fn is_null(&self, index: usize) -> bool {
        each_column!(self, v => v.get(index).is_some_and(Option::is_none))
    }

    /// Cell at `index` as a [`Value`], or `None` when out of range
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Value> {
        let value = match self {
            Self::Boolean(v) => v.get(index)?.map(Value::Boolean),
            Self::Int8(v) => v.get(index)?.map(Value::Int8),
            Self::Int16(v) => v.get(index)?.map(Value::Int16),
            Self::Int32(v) => v.get(index)?.map(Value::Int32),
            Self::Int64(v) => v.get(index)?.map(Value::Int64),
            Self::Float32(v) => v.get(index)?.map(Value::Float32),
            Self::Float64(v) => v.get(index)?.map(Value::Float64),
            Self::Text(v) | Self::FixedText { values: v, .. } => {
                v.get(index)?.clone().map(Value::Text)
            }
            Self::Binary(v) => v.get(index)?.clone().map(Value::Binary),
            Self::Date(v) => v.get(index)?.map(Value::Date),
            Self::Timestamp(v) => v.get(index)?.map(Value::Timestamp),
        };
        Some(value.unwrap_or(Value::Null))
    }

    /// Append a value, checking it against the column type
    ///
    /// `Null` is accepted by every column. Integers widen losslessly into a
    /// wider integer column; nothing else is coerced.
    pub fn push(&mut self, value: Value) -> Result<()> {
        let data_type = self.data_type();
        let mismatch = |v: &Value| {
            Error::schema(format!(
                "cannot store a {} value in a {data_type} column",
                v.kind()
            ))
        };

        match (self, value) {
            (col, Value::Null) => each_column!(col, v => v.push(None)),
            (Self::Boolean(v), Value::Boolean(x)) => v.push(Some(x)),
            (Self::Int8(v), Value::Int8(x)) => v.push(Some(x)),
            (Self::Int16(v), Value::Int8(x)) => v.push(Some(i16::from(x))),
            (Self::Int16(v), Value::Int16(x)) => v.push(Some(x)),
            (Self::Int32(v), Value::Int8(x)) => v.push(Some(i32::from(x))),
            (Self::Int32(v), Value::Int16(x)) => v.push(Some(i32::from(x))),
            (Self::Int32(v), Value::Int32(x)) => v.push(Some(x)),
            (Self::Int64(v), Value::Int8(x)) => v.push(Some(i64::from(x))),
            (Self::Int64(v), Value::Int16(x)) => v.push(Some(i64::from(x))),
            (Self::Int64(v), Value::Int32(x)) => v.push(Some(i64::from(x))),
            (Self::Int64(v), Value::Int64(x)) => v.push(Some(x)),
            (Self::Float32(v), Value::Float32(x)) => v.push(Some(x)),
            (Self::Float64(v), Value::Float64(x)) => v.push(Some(x)),
            (Self::Text(v) | Self::FixedText { values: v, .. }, Value::Text(x)) => v.push(Some(x)),
            (Self::Binary(v), Value::Binary(x)) => v.push(Some(x)),
            (Self::Date(v), Value::Date(x)) => v.push(Some(x)),
            (Self::Timestamp(v), Value::Timestamp(x)) => v.push(Some(x)),
            (_, other) => return Err(mismatch(&other)),
        }
        Ok(())
    }
}

fn bits_eq<T, B: PartialEq>(a: &[Option<T>], b: &[Option<T>], bits: impl Fn(&T) -> B) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| match (x, y) {
            (Some(x), Some(y)) => bits(x) == bits(y),
            (None, None) => true,
            _ => false,
        })
}

impl PartialEq for ColumnData {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Int8(a), Self::Int8(b)) => a == b,
            (Self::Int16(a), Self::Int16(b)) => a == b,
            (Self::Int32(a), Self::Int32(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Float32(a), Self::Float32(b)) => bits_eq(a, b, |f| f.to_bits()),
            (Self::Float64(a), Self::Float64(b)) => bits_eq(a, b, |f| f.to_bits()),
            (Self::Text(a), Self::Text(b)) => a == b,
            (
                Self::FixedText {
                    width: wa,
                    values: a,
                },
                Self::FixedText {
                    width: wb,
                    values: b,
                },
            ) => wa == wb && a == b,
            (Self::Binary(a), Self::Binary(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            // DateTime equality ignores the offset; the offset is part of the value here
            (Self::Timestamp(a), Self::Timestamp(b)) => bits_eq(a, b, |t| {
                (
                    t.timestamp(),
                    t.timestamp_subsec_nanos(),
                    t.offset().local_minus_utc(),
                )
            }),
            _ => false,
        }
    }
}

/// Name and type of one column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name as returned by the database (may repeat)
    pub name: String,
    /// Semantic type
    #[serde(flatten)]
    pub data_type: DataType,
}

/// A named column
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Cell storage
    pub data: ColumnData,
}

impl Column {
    /// Create a column
    #[must_use]
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Schema entry for this column
    #[must_use]
    pub fn schema(&self) -> ColumnSchema {
        ColumnSchema {
            name: self.name.clone(),
            data_type: self.data.data_type(),
        }
    }
}

/// A decoded, caller-owned query result
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<Column>,
    row_count: usize,
}

impl Table {
    /// Build a table from columns of equal length
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] when the columns have different lengths.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let row_count = columns.first().map_or(0, |c| c.data.len());
        if let Some(bad) = columns.iter().find(|c| c.data.len() != row_count) {
            return Err(Error::schema(format!(
                "column '{}' has {} rows, expected {row_count}",
                bad.name,
                bad.data.len()
            )));
        }
        Ok(Self { columns, row_count })
    }

    /// Build a table row by row against a declared schema
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] when a row has the wrong arity or a value
    /// does not fit its column type.
    pub fn from_rows<I>(schema: &[ColumnSchema], rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        let mut builder = TableBuilder::new(schema.to_vec());
        for row in rows {
            builder.push_row(row)?;
        }
        Ok(builder.finish())
    }

    /// Ordered columns
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Consume the table, returning its columns
    #[must_use]
    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }

    /// Column by name (first match)
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Number of rows
    #[must_use]
    pub const fn row_count(&self) -> usize {
        self.row_count
    }

    /// Number of columns
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Ordered schema
    #[must_use]
    pub fn schema(&self) -> Vec<ColumnSchema> {
        self.columns.iter().map(Column::schema).collect()
    }

    /// Materialize one row
    #[must_use]
    pub fn row(&self, index: usize) -> Option<Vec<Value>> {
        if index >= self.row_count {
            return None;
        }
        self.columns.iter().map(|c| c.data.get(index)).collect()
    }
}

/// Row-wise builder used by executors
#[derive(Debug)]
pub struct TableBuilder {
    columns: Vec<Column>,
    row_count: usize,
}

impl TableBuilder {
    /// Start an empty table with the given schema
    #[must_use]
    pub fn new(schema: Vec<ColumnSchema>) -> Self {
        let columns = schema
            .into_iter()
            .map(|s| Column::new(s.name, ColumnData::empty(s.data_type)))
            .collect();
        Self {
            columns,
            row_count: 0,
        }
    }

    /// Append a row
    ///
    /// A failed push leaves the builder unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] on arity or type mismatch, and for any row
    /// pushed onto a schema without columns.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if self.columns.is_empty() {
            return Err(Error::schema("a table without columns cannot hold rows"));
        }
        if row.len() != self.columns.len() {
            return Err(Error::schema(format!(
                "row {} has {} values, expected {}",
                self.row_count,
                row.len(),
                self.columns.len()
            )));
        }
        let mut failure = None;
        for (idx, (column, value)) in self.columns.iter_mut().zip(row).enumerate() {
            if let Err(e) = column.data.push(value) {
                failure = Some((idx, column.name.clone(), e));
                break;
            }
        }
        if let Some((idx, name, e)) = failure {
            self.truncate_to(idx);
            return Err(Error::schema(format!(
                "row {}, column '{name}': {e}",
                self.row_count
            )));
        }
        self.row_count += 1;
        Ok(())
    }

    // Roll back the cells already pushed for the failed row.
    fn truncate_to(&mut self, upto: usize) {
        let len = self.row_count;
        for column in self.columns.iter_mut().take(upto) {
            each_column!(&mut column.data, v => v.truncate(len));
        }
    }

    /// Finish building
    #[must_use]
    pub fn finish(self) -> Table {
        Table {
            columns: self.columns,
            row_count: self.row_count,
        }
    }
}
