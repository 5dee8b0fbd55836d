//! The `EventTable` is the immutable point array every pass runs against:
//! one fixed-width quantized vector per event, plus an opaque name index.

mod io;

pub use io::{read_leftover, read_selected};

use crate::constants::{MAX_COLUMNS, MAX_EVENTS, MAX_INPUT_VALUE};
use crate::error::{Error, Result};

/// An ordered table of events, sorted ascending by the sort-key column.
///
/// The sort order is load-bearing: both the coordinator and the workers
/// use it to skip whole block pairs whose sort-key ranges are further
/// apart than the distance cutoff. Tables are immutable once built and
/// shared read-only across all workers.
#[derive(Debug)]
pub struct EventTable {
    cols: usize,
    sort_key: usize,
    /// Row-major storage, `cols` values per event.
    data: Vec<u16>,
    /// One opaque name index per event.
    names: Vec<u32>,
    /// Column-header text carried through from ingest.
    header: String,
    /// Subsampling factor recorded at ingest (1 = every event kept).
    load_every: u32,
}

impl EventTable {
    /// Builds a table from unsorted rows, sorting by the sort-key column.
    ///
    /// # Arguments
    /// * `cols`: values per event, at most [`MAX_COLUMNS`].
    /// * `sort_key`: the column of maximum variance chosen at ingest.
    /// * `rows`: `(name_index, values)` pairs; every `values` slice must
    ///   hold exactly `cols` entries below [`MAX_INPUT_VALUE`].
    pub fn from_rows(cols: usize, sort_key: usize, rows: Vec<(u32, Vec<u16>)>) -> Result<Self> {
        if cols == 0 || cols > MAX_COLUMNS {
            return Err(Error::TooManyColumns { got: cols, max: MAX_COLUMNS });
        }
        if sort_key >= cols {
            return Err(Error::Config(format!(
                "sort key {sort_key} is outside the {cols} data columns"
            )));
        }
        if rows.len() > MAX_EVENTS {
            return Err(Error::TooManyRows { got: rows.len(), max: MAX_EVENTS });
        }
        let mut rows = rows;
        for (_, values) in &rows {
            if values.len() != cols {
                return Err(Error::ColumnMismatch { got: values.len(), expected: cols });
            }
            if values.iter().any(|&v| v >= MAX_INPUT_VALUE) {
                return Err(Error::Config(format!(
                    "input values must stay below {MAX_INPUT_VALUE}"
                )));
            }
        }
        rows.sort_by_key(|(_, values)| values[sort_key]);

        let mut names = Vec::with_capacity(rows.len());
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (name, values) in rows {
            names.push(name);
            data.extend_from_slice(&values);
        }
        Ok(EventTable {
            cols,
            sort_key,
            data,
            names,
            header: String::new(),
            load_every: 1,
        })
    }

    /// Used by the binary reader, which trusts the sort order written at
    /// ingest instead of re-sorting.
    pub(crate) fn from_sorted_parts(
        cols: usize,
        sort_key: usize,
        data: Vec<u16>,
        names: Vec<u32>,
        header: String,
        load_every: u32,
    ) -> Self {
        debug_assert_eq!(data.len(), names.len() * cols);
        EventTable { cols, sort_key, data, names, header, load_every }
    }

    /// Number of events in the table.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Values per event.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// The column the table is sorted by.
    pub fn sort_key(&self) -> usize {
        self.sort_key
    }

    /// The data vector of one event.
    pub fn row(&self, index: usize) -> &[u16] {
        let start = index * self.cols;
        &self.data[start..start + self.cols]
    }

    /// The sort-key value of one event.
    pub fn sort_value(&self, index: usize) -> u16 {
        self.data[index * self.cols + self.sort_key]
    }

    /// The opaque name index of one event.
    pub fn name(&self, index: usize) -> u32 {
        self.names[index]
    }

    /// Column-header text carried through from ingest.
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Subsampling factor recorded at ingest.
    pub fn load_every(&self) -> u32 {
        self.load_every
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_sorted_by_sort_key() {
        let table = EventTable::from_rows(
            4,
            0,
            vec![
                (7, vec![30, 0, 0, 0]),
                (8, vec![10, 1, 0, 0]),
                (9, vec![20, 2, 0, 0]),
            ],
        )
        .unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.name(0), 8);
        assert_eq!(table.sort_value(0), 10);
        assert_eq!(table.sort_value(2), 30);
        assert_eq!(table.row(1), &[20, 2, 0, 0]);
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(EventTable::from_rows(65, 0, vec![]).is_err());
        assert!(EventTable::from_rows(4, 4, vec![]).is_err());
        assert!(EventTable::from_rows(4, 0, vec![(1, vec![0, 0])]).is_err());
        assert!(EventTable::from_rows(4, 0, vec![(1, vec![20_000, 0, 0, 0])]).is_err());
    }
}
