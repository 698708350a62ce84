//! Record codec: one table row <-> one CSV line.
//!
//! Quoting follows RFC 4180 (via the `csv` crate): a value containing a comma,
//! a double quote, `\r` or `\n` is wrapped in double quotes and inner quotes
//! are doubled. Values are always matched to columns by header *name*, so the
//! header row of a file decides the column order, not the struct.

use std::io;
use std::str::FromStr;

use csv::{ReaderBuilder, StringRecord, Terminator, WriterBuilder};

// ── Record trait ───────────────────────────────────────────────────────────

/// A typed table row with an explicit, ordered field list.
pub trait Record: Sized {
    /// File name of the table inside the data directory.
    const FILE: &'static str;

    /// Canonical column order, used for new files and full rewrites.
    const FIELDS: &'static [&'static str];

    /// Field values in `FIELDS` order.
    fn values(&self) -> Vec<String>;

    /// Build a record from a decoded row. Must not fail: absent or unparsable
    /// cells fall back to a neutral value so one bad cell never hides a row.
    fn from_row(row: &Row<'_>) -> Self;
}

// ── Row view ───────────────────────────────────────────────────────────────

/// A decoded line paired with the header it was read under.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    headers: &'a StringRecord,
    values: &'a StringRecord,
}

impl<'a> Row<'a> {
    pub fn new(headers: &'a StringRecord, values: &'a StringRecord) -> Self {
        Self { headers, values }
    }

    /// Value of the named column; `""` when the column or the cell is missing.
    pub fn get(&self, name: &str) -> &'a str {
        self.headers
            .iter()
            .position(|h| h == name)
            .and_then(|idx| self.values.get(idx))
            .unwrap_or("")
    }

    /// Like [`Row::get`] but maps empty cells to `None`.
    pub fn get_opt(&self, name: &str) -> Option<&'a str> {
        Some(self.get(name)).filter(|v| !v.is_empty())
    }

    /// Parse the named cell, falling back to `default` on empty or bad input.
    pub fn parse_or<T: FromStr>(&self, name: &str, default: T) -> T {
        self.get(name).trim().parse().unwrap_or(default)
    }
}

// ── Line-level codec ───────────────────────────────────────────────────────

/// Encode raw field values as one CSV line (no trailing newline).
pub fn encode_line<I, T>(fields: I) -> csv::Result<String>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(fields)?;
    let bytes = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;

    let mut line = String::from_utf8(bytes)
        .map_err(|e| csv::Error::from(io::Error::new(io::ErrorKind::InvalidData, e)))?;
    if line.ends_with('\n') {
        line.pop();
    }
    Ok(line)
}

/// Decode one CSV line (which may itself span physical lines inside quotes).
/// An empty input decodes to an empty record.
pub fn decode_line(line: &str) -> csv::Result<StringRecord> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    let mut record = StringRecord::new();
    reader.read_record(&mut record)?;
    Ok(record)
}

/// Build a header record from a static field list.
pub fn header_record(fields: &[&str]) -> StringRecord {
    StringRecord::from(fields.to_vec())
}

// ── Record-level codec ─────────────────────────────────────────────────────

/// Values of `record` laid out in `headers` order. Columns the record does not
/// know about are written empty.
pub fn ordered_values<R: Record>(record: &R, headers: &StringRecord) -> Vec<String> {
    let mut values = record.values();
    headers
        .iter()
        .map(|header| {
            R::FIELDS
                .iter()
                .position(|field| *field == header)
                .and_then(|idx| values.get_mut(idx))
                .map(std::mem::take)
                .unwrap_or_default()
        })
        .collect()
}

/// Encode a record against a header row.
pub fn encode<R: Record>(record: &R, headers: &StringRecord) -> csv::Result<String> {
    encode_line(ordered_values(record, headers))
}

/// Decode a line against a header row. Short lines are fine: missing trailing
/// fields decode as empty strings.
pub fn decode<R: Record>(line: &str, headers: &StringRecord) -> csv::Result<R> {
    let values = decode_line(line)?;
    Ok(R::from_row(&Row::new(headers, &values)))
}
