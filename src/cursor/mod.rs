//! Result cursors
//!
//! A [`ResultCursor`] turns the documents of a store stream into rows. It is
//! forward-only unless opened as scrollable, in which case delivered rows are
//! kept in a bounded replay buffer for backward movement.
//!
//! Rows are numbered from 1. Position 0 is before the first row; a position
//! past the last row means the cursor is exhausted.

mod columns;

pub use columns::ColumnDescriptor;

use crate::native::Document;
use crate::plan::Output;
use crate::schema::TableSchema;
use crate::store::{DocumentStream, StoreError};
use crate::types::Cell;
use columns::Columns;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while reading a cursor
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CursorError {
    #[error("Store failed while streaming results: {cause}")]
    Store { cause: StoreError },

    #[error("Store round trip timed out after {ms} ms")]
    Timeout { ms: u64 },

    #[error("Row {row} is no longer in the replay buffer (holds {capacity} rows)")]
    ReplayBufferExhausted { row: usize, capacity: usize },

    #[error("Cursor is forward-only")]
    ForwardOnly,

    #[error("Cursor is closed")]
    Closed,
}

impl From<StoreError> for CursorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout { ms } => CursorError::Timeout { ms },
            cause => CursorError::Store { cause },
        }
    }
}

/// One result row; cells follow the cursor's column order
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    cells: Vec<Cell>,
}

impl Row {
    pub fn get(&self, index: usize) -> Option<&Cell> {
        self.cells.get(index)
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn into_cells(self) -> Vec<Cell> {
        self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// How a cursor reads its stream
#[derive(Debug, Clone)]
pub struct CursorOptions {
    /// Documents requested per round trip
    pub batch_size: usize,
    /// Keep delivered rows for backward movement
    pub scrollable: bool,
    /// Rows a scrollable cursor can move back over
    pub replay_buffer_rows: usize,
    /// Flatten embedded documents into dotted columns (`SELECT *` only)
    pub expand: bool,
    /// Name of the trailing column holding fields seen after the columns froze
    pub overflow_column: String,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            scrollable: false,
            replay_buffer_rows: 10_000,
            expand: false,
            overflow_column: "_overflow".to_string(),
        }
    }
}

/// Rows kept by a scrollable cursor; the oldest are evicted first
struct ReplayBuffer {
    rows: VecDeque<Row>,
    /// Number of the first kept row, minus one
    evicted: usize,
    capacity: usize,
}

impl ReplayBuffer {
    fn push(&mut self, row: Row) {
        if self.rows.len() == self.capacity {
            self.rows.pop_front();
            self.evicted += 1;
        }
        self.rows.push_back(row);
    }

    fn get(&self, number: usize) -> Result<Row, CursorError> {
        number
            .checked_sub(self.evicted + 1)
            .and_then(|i| self.rows.get(i))
            .cloned()
            .ok_or(CursorError::ReplayBufferExhausted {
                row: number,
                capacity: self.capacity,
            })
    }
}

pub struct ResultCursor {
    stream: Option<Box<dyn DocumentStream>>,
    columns: Columns,
    options: CursorOptions,
    pending: VecDeque<Document>,
    default_row: Option<Document>,
    replay: Option<ReplayBuffer>,
    /// Rows read from the stream so far
    fetched: usize,
    position: usize,
    exhausted: bool,
    closed: bool,
}

impl ResultCursor {
    /// Wrap a store stream; `hints` is the schema snapshot of the queried collection
    pub fn new(
        stream: Box<dyn DocumentStream>,
        output: Output,
        default_row: Option<Document>,
        hints: Option<Arc<TableSchema>>,
        options: CursorOptions,
    ) -> Self {
        let columns = match output {
            Output::Columns(columns) => Columns::fixed(columns, hints),
            Output::Fields => Columns::discovered(&options.overflow_column, options.expand, hints),
        };
        let replay = options.scrollable.then(|| ReplayBuffer {
            rows: VecDeque::new(),
            evicted: 0,
            capacity: options.replay_buffer_rows.max(1),
        });
        debug!(batch_size = options.batch_size, scrollable = options.scrollable, "Opened cursor");
        Self {
            stream: Some(stream),
            columns,
            options,
            pending: VecDeque::new(),
            default_row,
            replay,
            fetched: 0,
            position: 0,
            exhausted: false,
            closed: false,
        }
    }

    /// Column metadata; for `SELECT *` it is final once the first row was returned
    pub fn columns(&self) -> &[ColumnDescriptor] {
        self.columns.descriptors()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.index_of(name)
    }

    /// Current row number (0 before the first row)
    pub fn row_number(&self) -> usize {
        self.position
    }

    pub fn is_scrollable(&self) -> bool {
        self.replay.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Advance to the next row
    pub fn next(&mut self) -> Result<Option<Row>, CursorError> {
        self.ensure_open()?;
        if self.position < self.fetched {
            self.position += 1;
            return self.buffered(self.position).map(Some);
        }
        if self.position > self.fetched {
            return Ok(None);
        }
        match self.fetch()? {
            Some(row) => {
                self.position = self.fetched;
                Ok(Some(row))
            }
            None => {
                self.position = self.fetched + 1;
                Ok(None)
            }
        }
    }

    /// Read all remaining rows
    pub fn collect_rows(&mut self) -> Result<Vec<Row>, CursorError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next()? {
            rows.push(row);
        }
        Ok(rows)
    }

    pub fn previous(&mut self) -> Result<Option<Row>, CursorError> {
        self.scroll()?;
        let target = self.position.saturating_sub(1).min(self.fetched + 1);
        self.absolute(target as i64)
    }

    pub fn first_row(&mut self) -> Result<Option<Row>, CursorError> {
        self.absolute(1)
    }

    pub fn last_row(&mut self) -> Result<Option<Row>, CursorError> {
        self.absolute(-1)
    }

    pub fn before_first(&mut self) -> Result<(), CursorError> {
        self.scroll()?;
        self.position = 0;
        Ok(())
    }

    /// Move to row `n`; negative numbers count from the end, 0 is before the first row
    pub fn absolute(&mut self, n: i64) -> Result<Option<Row>, CursorError> {
        self.scroll()?;
        let target = if n < 0 {
            self.read_to_end()?;
            let back = usize::try_from(n.unsigned_abs()).unwrap_or(usize::MAX);
            match (self.fetched + 1).checked_sub(back) {
                Some(target) => target,
                None => {
                    self.position = 0;
                    return Ok(None);
                }
            }
        } else {
            usize::try_from(n).unwrap_or(usize::MAX)
        };

        if target == 0 {
            self.position = 0;
            return Ok(None);
        }
        while self.fetched < target && !self.exhausted {
            if self.fetch()?.is_none() {
                break;
            }
        }
        if target > self.fetched {
            self.position = self.fetched + 1;
            return Ok(None);
        }
        let row = self.buffered(target)?;
        self.position = target;
        Ok(Some(row))
    }

    /// Move `offset` rows from the current position
    pub fn relative(&mut self, offset: i64) -> Result<Option<Row>, CursorError> {
        self.scroll()?;
        let current = i64::try_from(self.position).unwrap_or(i64::MAX);
        self.absolute(current.saturating_add(offset).max(0))
    }

    /// Release the store stream; later reads fail with [`CursorError::Closed`]
    pub fn close(&mut self) {
        if !self.closed {
            debug!(rows = self.fetched, "Closing cursor");
        }
        self.release();
        self.closed = true;
        self.pending.clear();
        self.replay = None;
    }

    fn ensure_open(&self) -> Result<(), CursorError> {
        if self.closed {
            Err(CursorError::Closed)
        } else {
            Ok(())
        }
    }

    fn scroll(&self) -> Result<(), CursorError> {
        self.ensure_open()?;
        if self.replay.is_none() {
            return Err(CursorError::ForwardOnly);
        }
        Ok(())
    }

    fn buffered(&self, number: usize) -> Result<Row, CursorError> {
        match &self.replay {
            Some(replay) => replay.get(number),
            None => Err(CursorError::ForwardOnly),
        }
    }

    fn read_to_end(&mut self) -> Result<(), CursorError> {
        while self.fetch()?.is_some() {}
        Ok(())
    }

    /// Produce the next row from the stream, keeping it for replay
    fn fetch(&mut self) -> Result<Option<Row>, CursorError> {
        if self.pending.is_empty() && !self.exhausted {
            self.fill()?;
        }
        let doc = match self.pending.pop_front() {
            Some(doc) => doc,
            None if self.fetched == 0 => match self.default_row.take() {
                Some(doc) => doc,
                None => return Ok(None),
            },
            None => return Ok(None),
        };

        self.columns.freeze();
        let row = Row {
            cells: self.columns.row(&doc),
        };
        self.fetched += 1;
        if let Some(replay) = &mut self.replay {
            replay.push(row.clone());
        }
        Ok(Some(row))
    }

    fn fill(&mut self) -> Result<(), CursorError> {
        let Some(stream) = self.stream.as_mut() else {
            self.exhausted = true;
            return Ok(());
        };
        match stream.next_batch(self.options.batch_size.max(1)) {
            Ok(batch) if batch.is_empty() => {
                debug!(rows = self.fetched, "Cursor exhausted");
                self.exhausted = true;
                self.release();
                Ok(())
            }
            Ok(batch) => {
                self.columns.discover(&batch);
                self.pending.extend(batch);
                Ok(())
            }
            Err(err) => {
                let err = CursorError::from(err);
                warn!(error = %err, rows = self.fetched, "Cursor terminated");
                self.release();
                self.closed = true;
                Err(err)
            }
        }
    }

    fn release(&mut self) {
        self.stream = None;
    }
}

impl Iterator for ResultCursor {
    type Item = Result<Row, CursorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        ResultCursor::next(self).transpose()
    }
}

impl Drop for ResultCursor {
    fn drop(&mut self) {
        if self.stream.is_some() {
            debug!(rows = self.fetched, "Releasing unfinished cursor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeValue;
    use crate::plan::OutputColumn;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct VecStream {
        batches: VecDeque<Result<Vec<Document>, StoreError>>,
        dropped: Arc<AtomicBool>,
    }

    impl DocumentStream for VecStream {
        fn next_batch(&mut self, _max: usize) -> Result<Vec<Document>, StoreError> {
            self.batches.pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    impl Drop for VecStream {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn doc(pairs: &[(&str, NativeValue)]) -> Document {
        pairs.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    fn numbered(n: i32) -> Document {
        doc(&[("_id", n.into())])
    }

    fn cursor(
        batches: Vec<Result<Vec<Document>, StoreError>>,
        output: Output,
        options: CursorOptions,
    ) -> (ResultCursor, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        let stream = VecStream {
            batches: batches.into(),
            dropped: Arc::clone(&dropped),
        };
        (ResultCursor::new(Box::new(stream), output, None, None, options), dropped)
    }

    fn ids(rows: &[Row]) -> Vec<i64> {
        rows.iter().filter_map(|r| r.get(0).and_then(Cell::as_i64)).collect()
    }

    #[test]
    fn test_explicit_columns() {
        let output = Output::Columns(vec![
            OutputColumn { label: "name".into(), key: "name".into(), source: None },
            OutputColumn { label: "age".into(), key: "age".into(), source: None },
        ]);
        let (mut cursor, _) = cursor(
            vec![Ok(vec![doc(&[("age", 35.into()), ("name", "C".into())]), doc(&[("name", "B".into())])])],
            output,
            CursorOptions::default(),
        );
        let rows = cursor.collect_rows().unwrap();
        assert_eq!(rows[0].cells(), &[Cell::String("C".into()), Cell::Integer(35)]);
        assert_eq!(rows[1].cells(), &[Cell::String("B".into()), Cell::Null]);
        assert_eq!(cursor.columns()[1].inferred_type, crate::types::CanonicalType::Integer);
    }

    #[test]
    fn test_star_columns_are_stable() {
        let (mut cursor, _) = cursor(
            vec![
                Ok(vec![doc(&[("_id", 1.into()), ("a", 1.into())])]),
                Ok(vec![doc(&[("_id", 2.into()), ("b", 2.into())])]),
            ],
            Output::Fields,
            CursorOptions::default(),
        );
        let first = cursor.next().unwrap().unwrap();
        let before: Vec<String> = cursor.columns().iter().map(|c| c.name.clone()).collect();
        assert_eq!(before, ["_id", "a", "_overflow"]);
        assert_eq!(first.len(), 3);

        let second = cursor.next().unwrap().unwrap();
        let after: Vec<String> = cursor.columns().iter().map(|c| c.name.clone()).collect();
        assert_eq!(before, after);
        assert_eq!(second.get(1), Some(&Cell::Null));
        assert_eq!(second.get(2), Some(&Cell::Document(doc(&[("b", 2.into())]))));
    }

    #[test]
    fn test_store_error_terminates() {
        let (mut cursor, dropped) = cursor(
            vec![Ok(vec![numbered(1)]), Err(StoreError::Timeout { ms: 50 })],
            Output::Fields,
            CursorOptions::default(),
        );
        assert!(cursor.next().unwrap().is_some());
        assert_eq!(cursor.next(), Err(CursorError::Timeout { ms: 50 }));
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(cursor.next(), Err(CursorError::Closed));
    }

    #[test]
    fn test_drop_releases_stream() {
        let (mut cursor, dropped) = cursor(vec![Ok(vec![numbered(1), numbered(2)])], Output::Fields, CursorOptions::default());
        cursor.next().unwrap();
        assert!(!dropped.load(Ordering::SeqCst));
        drop(cursor);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_forward_only_rejects_scrolling() {
        let (mut cursor, _) = cursor(vec![Ok(vec![numbered(1)])], Output::Fields, CursorOptions::default());
        assert_eq!(cursor.previous(), Err(CursorError::ForwardOnly));
        assert_eq!(cursor.first_row(), Err(CursorError::ForwardOnly));
    }

    #[test]
    fn test_scrollable_navigation() {
        let options = CursorOptions { scrollable: true, batch_size: 2, ..Default::default() };
        let (mut cursor, _) = cursor(
            vec![Ok(vec![numbered(1), numbered(2)]), Ok(vec![numbered(3), numbered(4)])],
            Output::Fields,
            options,
        );
        assert_eq!(ids(&[cursor.next().unwrap().unwrap()]), [1]);
        assert_eq!(ids(&[cursor.next().unwrap().unwrap()]), [2]);
        assert_eq!(ids(&[cursor.previous().unwrap().unwrap()]), [1]);
        assert_eq!(cursor.previous().unwrap(), None);
        assert_eq!(cursor.row_number(), 0);

        assert_eq!(ids(&[cursor.last_row().unwrap().unwrap()]), [4]);
        assert_eq!(ids(&[cursor.absolute(-2).unwrap().unwrap()]), [3]);
        assert_eq!(ids(&[cursor.relative(-2).unwrap().unwrap()]), [1]);
        assert_eq!(ids(&[cursor.first_row().unwrap().unwrap()]), [1]);
        assert_eq!(cursor.absolute(9).unwrap(), None);
        assert_eq!(cursor.row_number(), 5);

        cursor.before_first().unwrap();
        let rows = cursor.by_ref().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(ids(&rows), [1, 2, 3, 4]);

        // scrolling still works after iterating by reference
        assert_eq!(ids(&[cursor.last_row().unwrap().unwrap()]), [4]);
    }

    #[test]
    fn test_replay_buffer_exhausted() {
        let options = CursorOptions { scrollable: true, replay_buffer_rows: 2, ..Default::default() };
        let (mut cursor, _) = cursor(
            vec![Ok(vec![numbered(1), numbered(2), numbered(3)])],
            Output::Fields,
            options,
        );
        cursor.collect_rows().unwrap();
        assert_eq!(ids(&[cursor.absolute(2).unwrap().unwrap()]), [2]);
        assert_eq!(
            cursor.first_row(),
            Err(CursorError::ReplayBufferExhausted { row: 1, capacity: 2 })
        );
    }

    #[test]
    fn test_default_row_on_empty_stream() {
        let output = Output::Columns(vec![OutputColumn { label: "n".into(), key: "n".into(), source: None }]);
        let stream = VecStream {
            batches: VecDeque::new(),
            dropped: Arc::new(AtomicBool::new(false)),
        };
        let mut cursor = ResultCursor::new(
            Box::new(stream),
            output,
            Some(doc(&[("n", 0.into())])),
            None,
            CursorOptions::default(),
        );
        let rows = cursor.collect_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(0), Some(&Cell::Integer(0)));
    }
}
