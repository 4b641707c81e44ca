//! Columnar binary codec for [`Table`]
//!
//! # Format
//!
//! The encoded blob is a single zstd frame wrapping the raw columnar layout.
//! All integers are little-endian.
//!
//! ```text
//! raw    := "SQCB" version:u8 column_count:u32 row_count:u64 column*
//! column := name_len:u32 name:utf8 type_tag:u8 [width:u32 if fixed text]
//!           has_nulls:u8 [validity bitmap: ceil(rows / 8) bytes, bit set = present]
//!           values
//! ```
//!
//! Only non-NULL cells are written to `values`:
//!
//! - booleans: bit-packed
//! - integers, floats: fixed width (floats by raw bits, so `NaN` payloads survive)
//! - text, binary: `len:u32` per value, then the concatenated bytes
//! - dates: days from the common era as `i32`
//! - timestamps: `secs:i64 nanos:u32 offset_secs:i32`
//!
//! Any structural problem while decoding (bad magic, truncation, invalid UTF-8,
//! trailing bytes, out-of-range dates) yields [`Error::CorruptEntry`].

use crate::table::{Column, ColumnData, DataType, Table};
use crate::{Error, Result};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate};

const MAGIC: &[u8; 4] = b"SQCB";
const VERSION: u8 = 1;

/// Default zstd level, matching the snapshot archives
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Type tags for column variants.
mod tags {
    pub const BOOLEAN: u8 = 0x01;
    pub const INT8: u8 = 0x02;
    pub const INT16: u8 = 0x03;
    pub const INT32: u8 = 0x04;
    pub const INT64: u8 = 0x05;
    pub const FLOAT32: u8 = 0x06;
    pub const FLOAT64: u8 = 0x07;
    pub const TEXT: u8 = 0x08;
    pub const FIXED_TEXT: u8 = 0x09;
    pub const BINARY: u8 = 0x0A;
    pub const DATE: u8 = 0x0B;
    pub const TIMESTAMP: u8 = 0x0C;
}

/// Encoder/decoder with a configurable compression level
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    level: i32,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl Codec {
    /// Create a codec using the given zstd level
    #[must_use]
    pub const fn new(level: i32) -> Self {
        Self { level }
    }

    /// Encode a table to a compressed columnar blob
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if a column name or value is longer
    /// than the format can describe, or compression fails.
    pub fn encode(&self, table: &Table) -> Result<Vec<u8>> {
        let raw = encode_raw(table)?;
        zstd::encode_all(raw.as_slice(), self.level)
            .map_err(|e| Error::serialization(format!("zstd compression failed: {e}")))
    }

    /// Decode a blob produced by [`Codec::encode`]
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptEntry`] when the blob is damaged or truncated.
    pub fn decode(&self, bytes: &[u8]) -> Result<Table> {
        let raw = zstd::decode_all(bytes)
            .map_err(|e| Error::corrupt("", format!("zstd frame unreadable: {e}")))?;
        decode_raw(&raw)
    }
}

/// Encode with the default compression level
///
/// # Errors
///
/// See [`Codec::encode`].
pub fn encode(table: &Table) -> Result<Vec<u8>> {
    Codec::default().encode(table)
}

/// Decode a blob produced by [`encode`]
///
/// # Errors
///
/// See [`Codec::decode`].
pub fn decode(bytes: &[u8]) -> Result<Table> {
    Codec::default().decode(bytes)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn len_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::serialization(format!("{what} too long")))
}

fn encode_raw(table: &Table) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64 + table.row_count() * table.column_count() * 8);
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&len_u32(table.column_count(), "column list")?.to_le_bytes());
    out.extend_from_slice(&(table.row_count() as u64).to_le_bytes());

    for column in table.columns() {
        encode_column(&mut out, column)?;
    }
    Ok(out)
}

fn encode_column(out: &mut Vec<u8>, column: &Column) -> Result<()> {
    let name = column.name.as_bytes();
    out.extend_from_slice(&len_u32(name.len(), "column name")?.to_le_bytes());
    out.extend_from_slice(name);

    match &column.data {
        ColumnData::Boolean(v) => {
            out.push(tags::BOOLEAN);
            write_validity(out, v);
            let present: Vec<bool> = v.iter().flatten().copied().collect();
            write_bits(out, &present);
        }
        ColumnData::Int8(v) => write_fixed_column(out, tags::INT8, v),
        ColumnData::Int16(v) => write_fixed_column(out, tags::INT16, v),
        ColumnData::Int32(v) => write_fixed_column(out, tags::INT32, v),
        ColumnData::Int64(v) => write_fixed_column(out, tags::INT64, v),
        ColumnData::Float32(v) => write_fixed_column(out, tags::FLOAT32, v),
        ColumnData::Float64(v) => write_fixed_column(out, tags::FLOAT64, v),
        ColumnData::Text(v) => {
            out.push(tags::TEXT);
            write_validity(out, v);
            write_varlen(out, v.iter().flatten().map(String::as_bytes))?;
        }
        ColumnData::FixedText { width, values } => {
            out.push(tags::FIXED_TEXT);
            out.extend_from_slice(&width.to_le_bytes());
            write_validity(out, values);
            write_varlen(out, values.iter().flatten().map(String::as_bytes))?;
        }
        ColumnData::Binary(v) => {
            out.push(tags::BINARY);
            write_validity(out, v);
            write_varlen(out, v.iter().flatten().map(Vec::as_slice))?;
        }
        ColumnData::Date(v) => {
            out.push(tags::DATE);
            write_validity(out, v);
            for d in v.iter().flatten() {
                out.extend_from_slice(&d.num_days_from_ce().to_le_bytes());
            }
        }
        ColumnData::Timestamp(v) => {
            out.push(tags::TIMESTAMP);
            write_validity(out, v);
            for ts in v.iter().flatten() {
                out.extend_from_slice(&ts.timestamp().to_le_bytes());
                out.extend_from_slice(&ts.timestamp_subsec_nanos().to_le_bytes());
                out.extend_from_slice(&ts.offset().local_minus_utc().to_le_bytes());
            }
        }
    }
    Ok(())
}

fn write_validity<T>(out: &mut Vec<u8>, cells: &[Option<T>]) {
    if cells.iter().all(Option::is_some) {
        out.push(0);
        return;
    }
    out.push(1);
    let bits: Vec<bool> = cells.iter().map(Option::is_some).collect();
    write_bits(out, &bits);
}

fn write_bits(out: &mut Vec<u8>, bits: &[bool]) {
    for chunk in bits.chunks(8) {
        let byte = chunk
            .iter()
            .enumerate()
            .fold(0u8, |acc, (i, &b)| acc | (u8::from(b) << i));
        out.push(byte);
    }
}

fn write_varlen<'a>(out: &mut Vec<u8>, values: impl Iterator<Item = &'a [u8]> + Clone) -> Result<()> {
    for v in values.clone() {
        out.extend_from_slice(&len_u32(v.len(), "value")?.to_le_bytes());
    }
    for v in values {
        out.extend_from_slice(v);
    }
    Ok(())
}

/// Fixed-width little-endian primitives.
trait Fixed: Copy {
    const WIDTH: usize;
    fn put(self, out: &mut Vec<u8>);
    fn get(bytes: &[u8]) -> Option<Self>;
}

macro_rules! impl_fixed {
    ($($ty:ty),*) => {
        $(
            impl Fixed for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                fn put(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn get(bytes: &[u8]) -> Option<Self> {
                    bytes.try_into().ok().map(<$ty>::from_le_bytes)
                }
            }
        )*
    };
}

impl_fixed!(i8, i16, i32, i64, u32, f32, f64);

fn write_fixed_column<T: Fixed>(out: &mut Vec<u8>, tag: u8, cells: &[Option<T>]) {
    out.push(tag);
    write_validity(out, cells);
    for v in cells.iter().flatten() {
        v.put(out);
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn corrupt(reason: impl Into<String>) -> Error {
    Error::corrupt("", reason)
}

/// Bounds-checked cursor over the raw layout.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(corrupt(format!(
                "unexpected end of input at byte {} (wanted {n}, have {})",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn fixed<T: Fixed>(&mut self) -> Result<T> {
        let bytes = self.take(T::WIDTH)?;
        T::get(bytes).ok_or_else(|| corrupt("fixed-width read failed"))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        bytes
            .try_into()
            .map(u64::from_le_bytes)
            .map_err(|_| corrupt("failed to read u64"))
    }

    fn len(&mut self) -> Result<usize> {
        let n: u32 = self.fixed()?;
        usize::try_from(n).map_err(|_| corrupt("length exceeds platform capacity"))
    }
}

fn decode_raw(raw: &[u8]) -> Result<Table> {
    let mut r = Reader::new(raw);
    if r.take(4)? != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = r.u8()?;
    if version != VERSION {
        return Err(corrupt(format!("unsupported codec version {version}")));
    }
    let column_count = r.len()?;
    let row_count = usize::try_from(r.u64()?)
        .map_err(|_| corrupt("row count exceeds platform capacity"))?;
    if column_count == 0 && row_count != 0 {
        return Err(corrupt("rows declared without columns"));
    }

    let mut columns = Vec::with_capacity(column_count.min(r.remaining()));
    for _ in 0..column_count {
        columns.push(decode_column(&mut r, row_count)?);
    }
    if r.remaining() != 0 {
        return Err(corrupt(format!("{} trailing bytes", r.remaining())));
    }
    Table::new(columns).map_err(|e| corrupt(e.to_string()))
}

fn decode_column(r: &mut Reader<'_>, rows: usize) -> Result<Column> {
    let name_len = r.len()?;
    let name = std::str::from_utf8(r.take(name_len)?)
        .map_err(|e| corrupt(format!("invalid column name: {e}")))?
        .to_string();
    let tag = r.u8()?;
    let width = if tag == tags::FIXED_TEXT {
        Some(r.fixed::<u32>()?)
    } else {
        None
    };
    let validity = read_validity(r, rows)?;

    let data = match tag {
        tags::BOOLEAN => {
            let present = validity.iter().filter(|v| **v).count();
            let bytes = r.take(present.div_ceil(8))?;
            let mut bits = (0..present).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0);
            ColumnData::Boolean(
                validity
                    .iter()
                    .map(|&valid| if valid { bits.next() } else { None })
                    .collect(),
            )
        }
        tags::INT8 => ColumnData::Int8(read_fixed(r, &validity)?),
        tags::INT16 => ColumnData::Int16(read_fixed(r, &validity)?),
        tags::INT32 => ColumnData::Int32(read_fixed(r, &validity)?),
        tags::INT64 => ColumnData::Int64(read_fixed(r, &validity)?),
        tags::FLOAT32 => ColumnData::Float32(read_fixed(r, &validity)?),
        tags::FLOAT64 => ColumnData::Float64(read_fixed(r, &validity)?),
        tags::TEXT => ColumnData::Text(read_text(r, &validity)?),
        tags::FIXED_TEXT => ColumnData::FixedText {
            width: width.unwrap_or_default(),
            values: read_text(r, &validity)?,
        },
        tags::BINARY => ColumnData::Binary(read_varlen(r, &validity)?),
        tags::DATE => {
            let days: Vec<Option<i32>> = read_fixed(r, &validity)?;
            ColumnData::Date(
                days.into_iter()
                    .map(|d| {
                        d.map(|d| {
                            NaiveDate::from_num_days_from_ce_opt(d)
                                .ok_or_else(|| corrupt(format!("date out of range: {d}")))
                        })
                        .transpose()
                    })
                    .collect::<Result<_>>()?,
            )
        }
        tags::TIMESTAMP => ColumnData::Timestamp(
            validity
                .iter()
                .map(|&valid| valid.then(|| read_timestamp(r)).transpose())
                .collect::<Result<_>>()?,
        ),
        other => return Err(corrupt(format!("unknown column type tag {other:#04x}"))),
    };

    if data.len() != rows {
        return Err(corrupt(format!("column '{name}' row count mismatch")));
    }
    Ok(Column::new(name, data))
}

fn read_validity(r: &mut Reader<'_>, rows: usize) -> Result<Vec<bool>> {
    match r.u8()? {
        0 => {
            // A corrupt row count must not drive a huge allocation; every
            // present cell occupies at least one bit of the remaining input.
            if rows > r.remaining().saturating_mul(8) {
                return Err(corrupt("row count exceeds available data"));
            }
            Ok(vec![true; rows])
        }
        1 => {
            let bytes = r.take(rows.div_ceil(8))?;
            Ok((0..rows).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0).collect())
        }
        other => Err(corrupt(format!("invalid null marker {other}"))),
    }
}

fn read_fixed<T: Fixed>(r: &mut Reader<'_>, validity: &[bool]) -> Result<Vec<Option<T>>> {
    let present = validity.iter().filter(|v| **v).count();
    let byte_len = present
        .checked_mul(T::WIDTH)
        .ok_or_else(|| corrupt("column byte length overflow"))?;
    let bytes = r.take(byte_len)?;
    let mut values = bytes.chunks_exact(T::WIDTH).map(T::get);
    validity
        .iter()
        .map(|&valid| {
            if valid {
                values
                    .next()
                    .flatten()
                    .map(Some)
                    .ok_or_else(|| corrupt("short fixed-width column"))
            } else {
                Ok(None)
            }
        })
        .collect()
}

fn read_varlen(r: &mut Reader<'_>, validity: &[bool]) -> Result<Vec<Option<Vec<u8>>>> {
    let present = validity.iter().filter(|v| **v).count();
    if present > r.remaining() / 4 {
        return Err(corrupt("length table exceeds available data"));
    }
    let lens = (0..present).map(|_| r.len()).collect::<Result<Vec<_>>>()?;
    let mut lens = lens.into_iter();
    validity
        .iter()
        .map(|&valid| {
            if !valid {
                return Ok(None);
            }
            let len = lens
                .next()
                .ok_or_else(|| corrupt("short length table"))?;
            Ok(Some(r.take(len)?.to_vec()))
        })
        .collect()
}

fn read_text(r: &mut Reader<'_>, validity: &[bool]) -> Result<Vec<Option<String>>> {
    read_varlen(r, validity)?
        .into_iter()
        .map(|v| {
            v.map(|bytes| {
                String::from_utf8(bytes).map_err(|e| corrupt(format!("invalid UTF-8: {e}")))
            })
            .transpose()
        })
        .collect()
}

fn read_timestamp(r: &mut Reader<'_>) -> Result<DateTime<FixedOffset>> {
    let secs: i64 = r.fixed()?;
    let nanos: u32 = r.fixed()?;
    let offset_secs: i32 = r.fixed()?;
    let offset = FixedOffset::east_opt(offset_secs)
        .ok_or_else(|| corrupt(format!("invalid UTC offset {offset_secs}")))?;
    let utc = DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| corrupt(format!("timestamp out of range: {secs}.{nanos}")))?;
    Ok(utc.with_timezone(&offset))
}
