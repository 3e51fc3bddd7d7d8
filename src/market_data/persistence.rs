// =============================================================================
// Persistence — dataset <-> delimited text file
// =============================================================================
//
// Layout: header row, leading `timestamp` column (ISO 8601 with offset),
// one row per observation, numbers written in their shortest exact decimal
// form and missing cells left empty.
//
// Writes go to `<file>.tmp` first and are renamed into place so a crash never
// leaves a truncated file behind.
//
// Neither `save` nor `load` propagates errors: failures are logged and turned
// into `false` / `None`.
// =============================================================================

use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use tracing::{error, info, warn};

use crate::error::PersistenceError;
use crate::market_data::dataset::{Column, Dataset, TimeIndex, INDEX_NAME};

/// Timestamp text format. `%.f` prints nothing for whole seconds.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%:z";
const NAIVE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const NAIVE_ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Save `dataset` as `directory/filename`, creating the directory if needed.
pub fn save(dataset: &Dataset, filename: &str, directory: impl AsRef<Path>) -> bool {
    let directory = directory.as_ref();
    if dataset.is_empty() {
        warn!(file = %filename, "dataset is empty; nothing saved");
        return false;
    }

    match write_file(dataset, filename, directory) {
        Ok(path) => {
            info!(path = %path.display(), rows = dataset.len(), "dataset saved");
            true
        }
        Err(e) => {
            error!(file = %filename, dir = %directory.display(), error = %e, "failed to save dataset");
            false
        }
    }
}

/// Load `directory/filename`; `None` if absent or unreadable. The index is
/// always returned in UTC.
pub fn load(filename: &str, directory: impl AsRef<Path>) -> Option<Dataset> {
    let path = directory.as_ref().join(filename);
    if !path.exists() {
        warn!(path = %path.display(), "file not found");
        return None;
    }

    match read_file(&path) {
        Ok(ds) => {
            info!(path = %path.display(), rows = ds.len(), "dataset loaded");
            Some(ds)
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to load dataset");
            None
        }
    }
}

fn write_file(dataset: &Dataset, filename: &str, directory: &Path) -> Result<PathBuf, PersistenceError> {
    if !directory.exists() {
        std::fs::create_dir_all(directory).map_err(|e| PersistenceError::io(directory, e))?;
        info!(dir = %directory.display(), "created directory");
    }

    let path = directory.join(filename);
    let tmp_path = directory.join(format!("{filename}.tmp"));
    let bytes = encode_csv(dataset)?;

    std::fs::write(&tmp_path, &bytes).map_err(|e| PersistenceError::io(&tmp_path, e))?;
    if let Err(e) = std::fs::rename(&tmp_path, &path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(PersistenceError::io(&path, e));
    }
    Ok(path)
}

fn read_file(path: &Path) -> Result<Dataset, PersistenceError> {
    let bytes = std::fs::read(path).map_err(|e| PersistenceError::io(path, e))?;
    let mut ds = decode_csv(&bytes)?;
    ds.normalize_index_to_utc();
    Ok(ds)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn index_labels(index: &TimeIndex) -> Vec<String> {
    match index {
        TimeIndex::Utc(v) => v.iter().map(|t| t.format(TIMESTAMP_FORMAT).to_string()).collect(),
        TimeIndex::Offset(v) => v.iter().map(|t| t.format(TIMESTAMP_FORMAT).to_string()).collect(),
        TimeIndex::Naive(v) => v.iter().map(|t| t.format(NAIVE_FORMAT).to_string()).collect(),
    }
}

fn cell_text(column: &Column, row: usize) -> String {
    match column {
        Column::Float(v) => v[row].map(|x| x.to_string()).unwrap_or_default(),
        Column::Text(v) => v[row].clone().unwrap_or_default(),
    }
}

pub fn encode_csv(dataset: &Dataset) -> Result<Vec<u8>, PersistenceError> {
    let mut wtr = csv::Writer::from_writer(vec![]);

    let mut header = vec![INDEX_NAME];
    header.extend(dataset.column_names());
    wtr.write_record(&header)?;

    for (row, stamp) in index_labels(dataset.index()).into_iter().enumerate() {
        let mut record = Vec::with_capacity(header.len());
        record.push(stamp);
        record.extend(dataset.columns().map(|(_, c)| cell_text(c, row)));
        wtr.write_record(&record)?;
    }

    wtr.into_inner()
        .map_err(|e| PersistenceError::Shape(format!("failed to flush CSV writer: {e}")))
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

enum Stamp {
    Aware(DateTime<FixedOffset>),
    Naive(NaiveDateTime),
}

fn parse_stamp(s: &str) -> Option<Stamp> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_str(s, TIMESTAMP_FORMAT) {
        return Some(Stamp::Aware(t));
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(Stamp::Aware(t));
    }
    for fmt in [NAIVE_FORMAT, NAIVE_ISO_FORMAT] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Stamp::Naive(t));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(Stamp::Naive)
}

fn build_index(stamps: Vec<Stamp>) -> Result<TimeIndex, PersistenceError> {
    let aware = stamps.iter().filter(|s| matches!(s, Stamp::Aware(_))).count();
    if aware == stamps.len() {
        return Ok(TimeIndex::Offset(
            stamps
                .into_iter()
                .filter_map(|s| match s {
                    Stamp::Aware(t) => Some(t),
                    Stamp::Naive(_) => None,
                })
                .collect(),
        ));
    }
    if aware == 0 {
        return Ok(TimeIndex::Naive(
            stamps
                .into_iter()
                .filter_map(|s| match s {
                    Stamp::Naive(t) => Some(t),
                    Stamp::Aware(_) => None,
                })
                .collect(),
        ));
    }
    Err(PersistenceError::Shape(
        "index mixes timezone-aware and naive timestamps".into(),
    ))
}

/// A column is numeric when every non-empty cell parses as a number.
fn build_column(cells: Vec<Option<String>>) -> Column {
    let numeric: Option<Vec<Option<f64>>> = cells
        .iter()
        .map(|c| match c {
            None => Some(None),
            Some(s) => s.trim().parse::<f64>().ok().map(Some),
        })
        .collect();
    match numeric {
        Some(values) => Column::Float(values),
        None => Column::Text(cells),
    }
}

pub fn decode_csv(bytes: &[u8]) -> Result<Dataset, PersistenceError> {
    let mut rdr = csv::Reader::from_reader(bytes);
    let headers = rdr.headers()?.clone();
    if headers.is_empty() {
        return Err(PersistenceError::Shape("missing header row".into()));
    }

    let names: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();
    let mut stamps = Vec::new();
    let mut cells: Vec<Vec<Option<String>>> = vec![Vec::new(); names.len()];

    for (line, result) in rdr.records().enumerate() {
        let record = result?;
        let raw = record.get(0).unwrap_or_default();
        let stamp = parse_stamp(raw).ok_or_else(|| PersistenceError::Timestamp {
            value: raw.to_string(),
            line: line + 2,
        })?;
        stamps.push(stamp);

        for (col, field) in cells.iter_mut().zip(record.iter().skip(1)) {
            col.push(if field.is_empty() { None } else { Some(field.to_string()) });
        }
    }

    let mut ds = Dataset::new(build_index(stamps)?);
    for (name, values) in names.into_iter().zip(cells) {
        ds.insert_column(name, build_column(values))
            .map_err(|e| PersistenceError::Shape(e.to_string()))?;
    }
    Ok(ds)
}
