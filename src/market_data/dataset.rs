// =============================================================================
// Dataset — timestamp-indexed columnar table of aggregate bars
// =============================================================================
//
// Columns are kept in insertion order so that the on-disk layout is stable.
// A column is either numeric or raw text; text only appears when a file was
// loaded with cells that do not parse as numbers, and the preprocessor is
// responsible for coercing it back.
//
// Invariant once cleaned: the index is UTC, strictly ascending and unique.
// =============================================================================

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, Utc};

use crate::types::AggregateRecord;

pub const OPEN: &str = "open";
pub const HIGH: &str = "high";
pub const LOW: &str = "low";
pub const CLOSE: &str = "close";
pub const VOLUME: &str = "volume";
pub const VWAP: &str = "vwap";
pub const TRANSACTIONS: &str = "transactions";
pub const DAILY_RETURN: &str = "daily_return";

/// Columns that must be numeric after preprocessing.
pub const PRICE_VOLUME_COLUMNS: [&str; 5] = [OPEN, HIGH, LOW, CLOSE, VOLUME];

/// Name written in the header above the index column.
pub const INDEX_NAME: &str = "timestamp";

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Row index. Data from the provider is always UTC; files written by other
/// tools may carry a fixed offset or no zone at all.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeIndex {
    Utc(Vec<DateTime<Utc>>),
    Offset(Vec<DateTime<FixedOffset>>),
    Naive(Vec<NaiveDateTime>),
}

/// What [`Dataset::normalize_index_to_utc`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimezoneAction {
    #[default]
    AlreadyUtc,
    /// No zone attached; the wall-clock values were taken as UTC.
    Localized,
    /// Non-UTC offset converted to UTC.
    Converted,
}

impl TimeIndex {
    pub fn len(&self) -> usize {
        match self {
            Self::Utc(v) => v.len(),
            Self::Offset(v) => v.len(),
            Self::Naive(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, rows: &[usize]) -> Self {
        match self {
            Self::Utc(v) => Self::Utc(rows.iter().map(|&i| v[i]).collect()),
            Self::Offset(v) => Self::Offset(rows.iter().map(|&i| v[i]).collect()),
            Self::Naive(v) => Self::Naive(rows.iter().map(|&i| v[i]).collect()),
        }
    }
}

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Float(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
}

fn float_missing(v: &Option<f64>) -> bool {
    v.map_or(true, f64::is_nan)
}

fn text_missing(v: &Option<String>) -> bool {
    v.as_deref().map_or(true, |s| s.trim().is_empty())
}

fn fill_forward<T: Clone>(values: &mut [Option<T>], missing: fn(&Option<T>) -> bool) {
    let mut last: Option<T> = None;
    for v in values.iter_mut() {
        if missing(v) {
            if let Some(prev) = &last {
                *v = Some(prev.clone());
            }
        } else {
            last = v.clone();
        }
    }
}

fn fill_backward<T: Clone>(values: &mut [Option<T>], missing: fn(&Option<T>) -> bool) {
    let mut next: Option<T> = None;
    for v in values.iter_mut().rev() {
        if missing(v) {
            if let Some(later) = &next {
                *v = Some(later.clone());
            }
        } else {
            next = v.clone();
        }
    }
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Self::Float(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    pub fn as_floats(&self) -> Option<&[Option<f64>]> {
        match self {
            Self::Float(v) => Some(v),
            Self::Text(_) => None,
        }
    }

    /// `None`, NaN and blank text all count as missing.
    pub fn is_missing(&self, row: usize) -> bool {
        match self {
            Self::Float(v) => v.get(row).map_or(true, float_missing),
            Self::Text(v) => v.get(row).map_or(true, text_missing),
        }
    }

    pub fn missing_count(&self) -> usize {
        match self {
            Self::Float(v) => v.iter().filter(|x| float_missing(x)).count(),
            Self::Text(v) => v.iter().filter(|x| text_missing(x)).count(),
        }
    }

    /// Propagate the last present value into following gaps.
    pub fn forward_fill(&mut self) {
        match self {
            Self::Float(v) => fill_forward(v, float_missing),
            Self::Text(v) => fill_forward(v, text_missing),
        }
    }

    /// Propagate the next present value into preceding gaps.
    pub fn backward_fill(&mut self) {
        match self {
            Self::Float(v) => fill_backward(v, float_missing),
            Self::Text(v) => fill_backward(v, text_missing),
        }
    }

    fn take(&self, rows: &[usize]) -> Self {
        match self {
            Self::Float(v) => Self::Float(rows.iter().map(|&i| v[i]).collect()),
            Self::Text(v) => Self::Text(rows.iter().map(|&i| v[i].clone()).collect()),
        }
    }
}

// ---------------------------------------------------------------------------
// Dataset
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("column '{column}' has {found} rows, index has {expected}")]
pub struct LengthMismatch {
    pub column: String,
    pub expected: usize,
    pub found: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    index: TimeIndex,
    columns: Vec<(String, Column)>,
}

impl Default for Dataset {
    fn default() -> Self {
        Self::new(TimeIndex::Utc(Vec::new()))
    }
}

impl Dataset {
    /// A dataset with the given index and no columns yet.
    pub fn new(index: TimeIndex) -> Self {
        Self {
            index,
            columns: Vec::new(),
        }
    }

    /// Build the canonical bar table from provider records, in the order
    /// given. Callers are expected to have sorted them already.
    pub fn from_records(records: &[AggregateRecord]) -> Self {
        let index = TimeIndex::Utc(records.iter().map(|r| r.timestamp).collect());
        let mut ds = Self::new(index);
        let cols: [(&str, Vec<Option<f64>>); 7] = [
            (OPEN, records.iter().map(|r| Some(r.open)).collect()),
            (HIGH, records.iter().map(|r| Some(r.high)).collect()),
            (LOW, records.iter().map(|r| Some(r.low)).collect()),
            (CLOSE, records.iter().map(|r| Some(r.close)).collect()),
            (VOLUME, records.iter().map(|r| Some(r.volume as f64)).collect()),
            (VWAP, records.iter().map(|r| r.vwap).collect()),
            (
                TRANSACTIONS,
                records.iter().map(|r| r.transactions.map(|n| n as f64)).collect(),
            ),
        ];
        for (name, values) in cols {
            ds.columns.push((name.to_string(), Column::Float(values)));
        }
        ds
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// `(rows, columns)`, excluding the index.
    pub fn shape(&self) -> (usize, usize) {
        (self.len(), self.columns.len())
    }

    pub fn index(&self) -> &TimeIndex {
        &self.index
    }

    pub fn utc_index(&self) -> Option<&[DateTime<Utc>]> {
        match &self.index {
            TimeIndex::Utc(v) => Some(v),
            _ => None,
        }
    }

    /// Insert a column, replacing any existing column of the same name in
    /// place.
    pub fn insert_column(
        &mut self,
        name: impl Into<String>,
        column: Column,
    ) -> Result<(), LengthMismatch> {
        let name = name.into();
        if column.len() != self.len() {
            return Err(LengthMismatch {
                column: name,
                expected: self.len(),
                found: column.len(),
            });
        }
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = column,
            None => self.columns.push((name, column)),
        }
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn floats(&self, name: &str) -> Option<&[Option<f64>]> {
        self.column(name).and_then(Column::as_floats)
    }

    /// Numeric cell lookup, `None` for text, missing, or out of range.
    pub fn value(&self, name: &str, row: usize) -> Option<f64> {
        self.floats(name).and_then(|v| v.get(row).copied().flatten())
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(n, c)| (n.as_str(), c))
    }

    pub(crate) fn columns_mut(&mut self) -> impl Iterator<Item = (&str, &mut Column)> {
        self.columns.iter_mut().map(|(n, c)| (n.as_str(), c))
    }

    /// Per-column missing cell counts, only for columns with gaps.
    pub fn missing_counts(&self) -> Vec<(String, usize)> {
        self.columns
            .iter()
            .map(|(n, c)| (n.clone(), c.missing_count()))
            .filter(|(_, count)| *count > 0)
            .collect()
    }

    pub fn row_has_missing(&self, row: usize) -> bool {
        self.columns.iter().any(|(_, c)| c.is_missing(row))
    }

    /// New dataset made of the given rows, in the given order.
    pub fn take_rows(&self, rows: &[usize]) -> Self {
        Self {
            index: self.index.take(rows),
            columns: self
                .columns
                .iter()
                .map(|(n, c)| (n.clone(), c.take(rows)))
                .collect(),
        }
    }

    /// Bring the index to UTC: naive stamps are taken as UTC wall-clock,
    /// offset stamps are converted. Instants already in UTC are untouched.
    pub fn normalize_index_to_utc(&mut self) -> TimezoneAction {
        let (index, action) = match &self.index {
            TimeIndex::Utc(_) => return TimezoneAction::AlreadyUtc,
            TimeIndex::Naive(v) => (
                v.iter().map(|n| n.and_utc()).collect(),
                TimezoneAction::Localized,
            ),
            TimeIndex::Offset(v) => {
                let all_zero = v.iter().all(|d| d.offset().fix().local_minus_utc() == 0);
                let action = if all_zero {
                    TimezoneAction::AlreadyUtc
                } else {
                    TimezoneAction::Converted
                };
                (v.iter().map(|d| d.with_timezone(&Utc)).collect(), action)
            }
        };
        self.index = TimeIndex::Utc(index);
        action
    }

    /// Stable-sort a UTC index ascending and keep the first row of every
    /// duplicated timestamp. Returns `(was_out_of_order, duplicates_dropped)`.
    /// Non-UTC indexes are left alone.
    pub fn sort_and_dedup(&mut self) -> (bool, usize) {
        let Some(stamps) = self.utc_index() else {
            return (false, 0);
        };

        let out_of_order = stamps.windows(2).any(|w| w[1] < w[0]);
        let mut order: Vec<usize> = (0..stamps.len()).collect();
        if out_of_order {
            order.sort_by_key(|&i| stamps[i]);
        }

        let mut keep = Vec::with_capacity(order.len());
        let mut last: Option<DateTime<Utc>> = None;
        for i in order {
            if last == Some(stamps[i]) {
                continue;
            }
            last = Some(stamps[i]);
            keep.push(i);
        }

        let dropped = stamps.len() - keep.len();
        if out_of_order || dropped > 0 {
            *self = self.take_rows(&keep);
        }
        (out_of_order, dropped)
    }
}
