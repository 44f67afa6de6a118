//! Result cursors.
//!
//! A [`ResultSet`] holds raw row payloads and decodes values on access.
//! It is either fully materialized or streaming: a streaming result pulls
//! rows in batches of the fetch size from a [`RowFetcher`] (the session,
//! which keeps the rest of the result unread on the socket).
//!
//! Positions are 1-based: 0 is "before first", `n + 1` is "after last" for
//! a result of `n` rows.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use s2wire_core::{ColumnInfo, DecodeError, Error, Result, Row, Value};

use crate::types::column::Columns;
use crate::types::decode::{binary_row_ranges, text_row_ranges};
use crate::types::{ColumnDescriptor, Encoding, FromColumn, decode_value};

/// Upper bound on rows requested per fetch.
pub const MAX_FETCH_BATCH: usize = 16_384;

/// Rows buffered up front by a streaming cursor.
const MIN_STREAM_BUFFER: usize = 10;

/// Navigation capabilities of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorType {
    /// Only `next`; rows of previous batches are dropped.
    #[default]
    ForwardOnly,
    /// Every navigation; all fetched rows are kept.
    Scrollable,
}

/// One batch of raw rows from the server.
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub rows: Vec<Vec<u8>>,
    /// The terminator of the result was read.
    pub done: bool,
}

/// Source of further rows for a streaming result.
pub trait RowFetcher {
    /// Read up to `max` more rows.
    fn fetch(&mut self, max: usize) -> Result<FetchBatch>;

    /// Read and drop every remaining row.
    fn discard(&mut self) -> Result<()>;
}

/// Outcome of a command that did not produce rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateCount {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    pub info: String,
}

/// Result of one command.
#[derive(Debug)]
pub enum QueryResult<'s> {
    Update(UpdateCount),
    Rows(ResultSet<'s>),
}

impl<'s> QueryResult<'s> {
    pub fn affected_rows(&self) -> u64 {
        match self {
            QueryResult::Update(u) => u.affected_rows,
            QueryResult::Rows(_) => 0,
        }
    }

    pub fn into_rows(self) -> Option<ResultSet<'s>> {
        match self {
            QueryResult::Rows(rs) => Some(rs),
            QueryResult::Update(_) => None,
        }
    }
}

#[derive(Debug)]
struct RawRow {
    payload: Vec<u8>,
    ranges: Vec<Option<Range<usize>>>,
}

/// A cursor over one result.
pub struct ResultSet<'s> {
    columns: Columns,
    names: Arc<ColumnInfo>,
    encoding: Encoding,
    cursor_type: CursorType,
    rows: Vec<RawRow>,
    /// Rows dropped before `rows[0]` (forward-only streaming)
    base: usize,
    /// Current 1-based position
    pos: usize,
    fetch_size: usize,
    fetcher: Option<Box<dyn RowFetcher + Send + 's>>,
    fetches: usize,
}

impl fmt::Debug for ResultSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSet")
            .field("columns", &self.names.names())
            .field("cursor_type", &self.cursor_type)
            .field("position", &self.pos)
            .field("buffered", &self.rows.len())
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

impl ResultSet<'static> {
    /// A result whose rows are all in memory.
    pub fn materialized(
        columns: Columns,
        encoding: Encoding,
        cursor_type: CursorType,
        rows: Vec<Vec<u8>>,
    ) -> Result<Self> {
        let mut rs = ResultSet::empty(columns, encoding, cursor_type, 0);
        rs.rows.reserve(rows.len());
        for payload in rows {
            let row = rs.index_row(payload)?;
            rs.rows.push(row);
        }
        Ok(rs)
    }
}

impl<'s> ResultSet<'s> {
    fn empty(columns: Columns, encoding: Encoding, cursor_type: CursorType, fetch_size: usize) -> Self {
        let names = Arc::new(ColumnInfo::new(
            columns.iter().map(|c| c.name.clone()).collect(),
        ));
        Self {
            columns,
            names,
            encoding,
            cursor_type,
            rows: Vec::new(),
            base: 0,
            pos: 0,
            fetch_size,
            fetcher: None,
            fetches: 0,
        }
    }

    /// A result that pulls rows from `fetcher` in batches of `fetch_size`.
    pub fn streaming(
        columns: Columns,
        encoding: Encoding,
        cursor_type: CursorType,
        fetch_size: usize,
        fetcher: Box<dyn RowFetcher + Send + 's>,
    ) -> Result<Self> {
        let mut rs = Self::empty(columns, encoding, cursor_type, fetch_size);
        rs.rows
            .reserve(fetch_size.max(MIN_STREAM_BUFFER).min(MAX_FETCH_BATCH));
        rs.fetcher = Some(fetcher);
        if fetch_size == 0 {
            rs.fetch_remaining()?;
        }
        Ok(rs)
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn column_names(&self) -> &[String] {
        self.names.names()
    }

    pub fn cursor_type(&self) -> CursorType {
        self.cursor_type
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Every row has been read from the server.
    pub fn is_loaded(&self) -> bool {
        self.fetcher.is_none()
    }

    /// Number of fetch round-trips issued so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches
    }

    pub fn fetch_size(&self) -> usize {
        self.fetch_size
    }

    /// Change the batch size; 0 reads the rest of the result now.
    pub fn set_fetch_size(&mut self, rows: usize) -> Result<()> {
        self.fetch_size = rows;
        if rows == 0 {
            self.fetch_remaining()?;
        }
        Ok(())
    }

    /// Current 1-based position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Row count, once every row has been read.
    pub fn row_count(&self) -> Option<usize> {
        self.is_loaded().then(|| self.fetched())
    }

    pub fn is_before_first(&self) -> bool {
        self.pos == 0 && self.fetched() > 0
    }

    pub fn is_after_last(&self) -> bool {
        self.is_loaded() && self.pos > self.fetched()
    }

    fn fetched(&self) -> usize {
        self.base + self.rows.len()
    }

    fn index_row(&self, payload: Vec<u8>) -> Result<RawRow> {
        let ranges = match self.encoding {
            Encoding::Text => text_row_ranges(&payload, self.columns.len())?,
            Encoding::Binary => binary_row_ranges(&payload, &self.columns)?,
        };
        Ok(RawRow { payload, ranges })
    }

    fn fetch_batch(&mut self) -> Result<()> {
        let Some(fetcher) = self.fetcher.as_mut() else {
            return Ok(());
        };
        let max = match self.fetch_size {
            0 => MAX_FETCH_BATCH,
            n => n.min(MAX_FETCH_BATCH),
        };
        let batch = match fetcher.fetch(max) {
            Ok(batch) => batch,
            Err(e) => {
                self.fetcher = None;
                return Err(e);
            }
        };
        self.fetches += 1;
        tracing::trace!(rows = batch.rows.len(), done = batch.done, "fetched row batch");

        if self.cursor_type == CursorType::ForwardOnly {
            let consumed = self.pos.saturating_sub(self.base).min(self.rows.len());
            self.rows.drain(..consumed);
            self.base += consumed;
        }
        let empty = batch.rows.is_empty();
        for payload in batch.rows {
            let row = self.index_row(payload)?;
            self.rows.push(row);
        }
        if batch.done || empty {
            self.fetcher = None;
        }
        Ok(())
    }

    /// Make row `n` available if it exists.
    fn ensure(&mut self, n: usize) -> Result<bool> {
        while self.fetched() < n && !self.is_loaded() {
            self.fetch_batch()?;
        }
        Ok(self.fetched() >= n)
    }

    /// Read every outstanding row into the buffer.
    pub fn fetch_remaining(&mut self) -> Result<()> {
        let previous = self.fetch_size;
        self.fetch_size = 0;
        let res = (|| {
            while !self.is_loaded() {
                self.fetch_batch()?;
            }
            Ok(())
        })();
        self.fetch_size = previous;
        res
    }

    fn require_scrollable(&self, op: &str) -> Result<()> {
        if self.cursor_type == CursorType::Scrollable {
            Ok(())
        } else {
            Err(Error::Custom(format!(
                "{} is not supported on a forward-only result",
                op
            )))
        }
    }

    /// Move to the next row.
    pub fn next(&mut self) -> Result<bool> {
        let target = self.pos + 1;
        if self.ensure(target)? {
            self.pos = target;
            Ok(true)
        } else {
            self.pos = self.fetched() + 1;
            Ok(false)
        }
    }

    pub fn previous(&mut self) -> Result<bool> {
        self.require_scrollable("previous")?;
        if self.pos <= 1 {
            self.pos = 0;
            return Ok(false);
        }
        self.pos -= 1;
        Ok(true)
    }

    /// Move to row `n`; negative counts from the end (`-1` is the last row).
    pub fn absolute(&mut self, n: i64) -> Result<bool> {
        self.require_scrollable("absolute")?;
        let target = if n >= 0 {
            n as u64
        } else {
            self.fetch_remaining()?;
            let from_end = (self.fetched() as i64) + 1 + n;
            if from_end < 1 {
                self.pos = 0;
                return Ok(false);
            }
            from_end as u64
        };
        self.seek(usize::try_from(target).unwrap_or(usize::MAX))
    }

    /// Move `n` rows from the current position.
    pub fn relative(&mut self, n: i64) -> Result<bool> {
        self.require_scrollable("relative")?;
        let target = i64::try_from(self.pos).unwrap_or(i64::MAX).saturating_add(n);
        if target < 1 {
            self.pos = 0;
            return Ok(false);
        }
        self.seek(usize::try_from(target).unwrap_or(usize::MAX))
    }

    fn seek(&mut self, target: usize) -> Result<bool> {
        if target == 0 {
            self.pos = 0;
            return Ok(false);
        }
        if self.ensure(target)? {
            self.pos = target;
            Ok(true)
        } else {
            self.pos = self.fetched() + 1;
            Ok(false)
        }
    }

    pub fn first(&mut self) -> Result<bool> {
        self.require_scrollable("first")?;
        self.seek(1)
    }

    pub fn last(&mut self) -> Result<bool> {
        self.require_scrollable("last")?;
        self.fetch_remaining()?;
        self.pos = self.fetched();
        Ok(self.pos > 0)
    }

    pub fn before_first(&mut self) -> Result<()> {
        self.require_scrollable("before_first")?;
        self.pos = 0;
        Ok(())
    }

    pub fn after_last(&mut self) -> Result<()> {
        self.require_scrollable("after_last")?;
        self.fetch_remaining()?;
        self.pos = self.fetched() + 1;
        Ok(())
    }

    /// The row under the cursor.
    pub fn row(&self) -> Option<RowView<'_>> {
        let idx = self.pos.checked_sub(self.base + 1)?;
        self.rows.get(idx).map(|raw| RowView {
            raw,
            columns: &self.columns,
            names: &self.names,
            encoding: self.encoding,
        })
    }

    /// Decode the remaining rows into [`Row`] values.
    pub fn collect_rows(mut self) -> Result<Vec<Row>> {
        let mut out = Vec::new();
        while self.next()? {
            if let Some(row) = self.row() {
                out.push(row.to_row()?);
            }
        }
        Ok(out)
    }
}

impl Drop for ResultSet<'_> {
    fn drop(&mut self) {
        if let Some(mut fetcher) = self.fetcher.take() {
            if let Err(e) = fetcher.discard() {
                tracing::warn!(error = %e, "failed to drain streaming result");
            }
        }
    }
}

/// Lazily decoded view of one row.
#[derive(Clone, Copy)]
pub struct RowView<'r> {
    raw: &'r RawRow,
    columns: &'r [ColumnDescriptor],
    names: &'r Arc<ColumnInfo>,
    encoding: Encoding,
}

impl fmt::Debug for RowView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowView")
            .field("columns", &self.names.names())
            .field("bytes", &self.raw.payload.len())
            .finish()
    }
}

impl<'r> RowView<'r> {
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Raw bytes of a value, `None` for SQL NULL or a bad index.
    pub fn raw(&self, index: usize) -> Option<&'r [u8]> {
        let range = self.raw.ranges.get(index)?.clone()?;
        self.raw.payload.get(range)
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.raw.ranges.get(index), Some(None))
    }

    /// Decode column `index`; `Ok(None)` is SQL NULL.
    pub fn get<T: FromColumn>(&self, index: usize) -> Result<Option<T>> {
        let col = self.columns.get(index).ok_or_else(|| {
            Error::Custom(format!(
                "column index {} out of range ({} columns)",
                index,
                self.columns.len()
            ))
        })?;
        decode_value(col, self.encoding, self.raw(index)).map_err(Error::Decode)
    }

    /// Decode a column by name.
    pub fn get_named<T: FromColumn>(&self, name: &str) -> Result<Option<T>> {
        let index = self
            .names
            .index_of(name)
            .ok_or_else(|| Error::Custom(format!("no column named '{}'", name)))?;
        self.get(index)
    }

    /// Decode column `index` without wrapping the error.
    pub fn try_get<T: FromColumn>(&self, index: usize) -> Option<std::result::Result<Option<T>, DecodeError>> {
        let col = self.columns.get(index)?;
        Some(decode_value(col, self.encoding, self.raw(index)))
    }

    /// Decode every value into a [`Row`].
    pub fn to_row(&self) -> Result<Row> {
        let values = (0..self.columns.len())
            .map(|i| self.get::<Value>(i).map(|v| v.unwrap_or(Value::Null)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Row::with_columns(Arc::clone(self.names), values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketWriter;
    use crate::types::FieldType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn int_columns() -> Columns {
        vec![
            ColumnDescriptor::new("a", FieldType::Long, 0),
            ColumnDescriptor::new("b", FieldType::Long, 0),
        ]
        .into()
    }

    fn text_row(a: i32, b: Option<i32>) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_lenenc_string(&a.to_string());
        match b {
            Some(b) => w.write_lenenc_string(&b.to_string()),
            None => w.write_u8(0xFB),
        }
        w.into_bytes()
    }

    /// Serves `total` rows; reports `done` with the final batch.
    struct Scripted {
        next: usize,
        total: usize,
        calls: Arc<AtomicUsize>,
        discarded: Arc<AtomicUsize>,
    }

    impl RowFetcher for Scripted {
        fn fetch(&mut self, max: usize) -> Result<FetchBatch> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let end = self.total.min(self.next.saturating_add(max));
            let rows = (self.next..end)
                .map(|i| text_row(i as i32 + 1, Some((i as i32 + 1) * 10)))
                .collect();
            self.next = end;
            Ok(FetchBatch {
                rows,
                done: end == self.total,
            })
        }

        fn discard(&mut self) -> Result<()> {
            self.discarded.fetch_add(self.total - self.next, Ordering::SeqCst);
            self.next = self.total;
            Ok(())
        }
    }

    fn streaming(total: usize, fetch_size: usize, cursor: CursorType) -> (ResultSet<'static>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let discarded = Arc::new(AtomicUsize::new(0));
        let fetcher = Scripted {
            next: 0,
            total,
            calls: Arc::clone(&calls),
            discarded: Arc::clone(&discarded),
        };
        let rs = ResultSet::streaming(int_columns(), Encoding::Text, cursor, fetch_size, Box::new(fetcher))
            .unwrap();
        (rs, calls, discarded)
    }

    fn current_a(rs: &ResultSet<'_>) -> i32 {
        rs.row().unwrap().get::<i32>(0).unwrap().unwrap()
    }

    #[test]
    fn fetch_count_is_ceil_of_rows_over_fetch_size() {
        for (rows, fs) in [(10, 3), (9, 3), (1, 5), (0, 4), (16, 16)] {
            let (mut rs, calls, _) = streaming(rows, fs, CursorType::ForwardOnly);
            let mut seen = 0;
            while rs.next().unwrap() {
                seen += 1;
            }
            assert_eq!(seen, rows);
            assert_eq!(calls.load(Ordering::SeqCst), rows.div_ceil(fs).max(1));
            assert_eq!(rs.fetch_count(), calls.load(Ordering::SeqCst));
        }
    }

    #[test]
    fn forward_only_drops_consumed_batches() {
        let (mut rs, _, _) = streaming(7, 2, CursorType::ForwardOnly);
        for expected in 1..=5 {
            assert!(rs.next().unwrap());
            assert_eq!(current_a(&rs), expected);
        }
        assert!(rs.rows.len() <= 2);
        assert!(rs.previous().is_err());
        assert!(rs.absolute(1).is_err());
    }

    #[test]
    fn scrollable_navigation() {
        let (mut rs, calls, _) = streaming(5, 2, CursorType::Scrollable);
        assert!(rs.absolute(3).unwrap());
        assert_eq!(current_a(&rs), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(rs.relative(-2).unwrap());
        assert_eq!(current_a(&rs), 1);
        assert!(!rs.previous().unwrap());
        assert!(rs.row().is_none());

        assert!(rs.last().unwrap());
        assert_eq!(current_a(&rs), 5);
        assert_eq!(rs.row_count(), Some(5));
        assert!(rs.absolute(-2).unwrap());
        assert_eq!(current_a(&rs), 4);
        assert!(!rs.relative(10).unwrap());
        assert!(rs.is_after_last());
        assert!(rs.first().unwrap());
        assert_eq!(current_a(&rs), 1);
        rs.before_first().unwrap();
        assert!(rs.is_before_first());
        assert!(!rs.absolute(-9).unwrap());
        assert_eq!(rs.position(), 0);
    }

    #[test]
    fn relative_saturates_at_the_ends() {
        let (mut rs, _, _) = streaming(5, 2, CursorType::Scrollable);
        assert!(rs.next().unwrap());
        assert!(!rs.relative(i64::MAX).unwrap());
        assert!(rs.is_after_last());
        assert_eq!(rs.row_count(), Some(5));

        assert!(!rs.relative(i64::MIN).unwrap());
        assert_eq!(rs.position(), 0);
        assert!(rs.is_before_first());
        assert!(rs.relative(2).unwrap());
        assert_eq!(current_a(&rs), 2);
    }

    #[test]
    fn scrollable_navigation_fetches_no_more_than_needed() {
        let (mut rs, calls, _) = streaming(100, 10, CursorType::Scrollable);
        assert!(rs.absolute(25).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(rs.relative(-20).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn zero_fetch_size_materializes_immediately() {
        let (rs, calls, _) = streaming(40, 0, CursorType::ForwardOnly);
        assert!(rs.is_loaded());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rs.row_count(), Some(40));

        let (mut rs, _, _) = streaming(40, 5, CursorType::ForwardOnly);
        rs.next().unwrap();
        rs.set_fetch_size(0).unwrap();
        assert!(rs.is_loaded());
        let mut n = 1;
        while rs.next().unwrap() {
            n += 1;
        }
        assert_eq!(n, 40);
    }

    #[test]
    fn drop_discards_unread_rows() {
        let (mut rs, _, discarded) = streaming(10, 4, CursorType::ForwardOnly);
        rs.next().unwrap();
        drop(rs);
        assert_eq!(discarded.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn fetch_batch_is_capped() {
        let (mut rs, _, _) = streaming(MAX_FETCH_BATCH + 5, 1_000_000, CursorType::ForwardOnly);
        rs.next().unwrap();
        assert_eq!(rs.rows.len(), MAX_FETCH_BATCH);
    }

    #[test]
    fn materialized_rows_decode_lazily() {
        let rows = vec![text_row(1, Some(2)), text_row(3, None)];
        let mut rs = ResultSet::materialized(int_columns(), Encoding::Text, CursorType::Scrollable, rows)
            .unwrap();
        assert!(rs.is_loaded());
        assert!(rs.absolute(2).unwrap());
        let row = rs.row().unwrap();
        assert!(row.is_null(1));
        assert_eq!(row.get::<i64>(1).unwrap(), None);
        assert_eq!(row.get_named::<i64>("a").unwrap(), Some(3));
        assert!(row.get::<i64>(5).is_err());
        let decoded = row.to_row().unwrap();
        assert_eq!(decoded.get(1), Some(&Value::Null));

        rs.before_first().unwrap();
        let all = rs.collect_rows().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn decode_error_is_local_to_column() {
        let mut w = PacketWriter::new();
        w.write_lenenc_string("300");
        w.write_lenenc_string("7");
        let cols: Columns = vec![
            ColumnDescriptor::new("big", FieldType::Long, 0),
            ColumnDescriptor::new("small", FieldType::Long, 0),
        ]
        .into();
        let mut rs = ResultSet::materialized(cols, Encoding::Text, CursorType::ForwardOnly, vec![w.into_bytes()])
            .unwrap();
        rs.next().unwrap();
        let row = rs.row().unwrap();
        assert!(matches!(row.get::<i8>(0), Err(Error::Decode(_))));
        assert_eq!(row.get::<i8>(1).unwrap(), Some(7));
    }

    #[test]
    fn truncated_row_is_a_protocol_error() {
        let err = ResultSet::materialized(int_columns(), Encoding::Text, CursorType::ForwardOnly, vec![vec![0x05, b'1']])
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
