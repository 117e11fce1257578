//! Loaders for DAQ and GPS CSV exports.
//!
//! DAQ exports start with a fixed block of `Key: Value` metadata lines
//! (serial number, acquisition settings) followed by an ordinary CSV table
//! with `Sample`, `Date/Time` and one column per analog input. GPS exports are
//! plain CSV with a time column and latitude/longitude columns.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use csv::ReaderBuilder;
use log::debug;
use thiserror::Error;

use super::table::{Column, TimeSeriesTable};
use crate::error::{Outcome, PipelineError, PipelineWarning};

/// Metadata lines at the top of every DAQ export.
pub const DAQ_HEADER_LINES: usize = 6;

/// Column holding the acquisition timestamp in DAQ exports.
pub const DAQ_TIME_COLUMN: &str = "Date/Time";

/// Bookkeeping columns that are not channels.
const DAQ_SKIP_COLUMNS: &[&str] = &["Sample"];

/// Header names accepted as the time column of a GPS export.
const GPS_TIME_COLUMNS: &[&str] = &["date/time", "datetime", "timestamp", "time", "utc"];

const TIMESTAMP_FORMATS: &[&str] = &[
    "%m/%d/%Y %H:%M:%S%.f",
    "%m/%d/%Y %I:%M:%S%.f %p",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
];

/// Errors that can occur during file loading.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Empty file: {0}")]
    EmptyFile(PathBuf),

    #[error("Truncated header in {path}: expected {expected} metadata lines, found {found}")]
    TruncatedHeader {
        path: PathBuf,
        expected: usize,
        found: usize,
    },

    #[error("Missing required columns: {0}")]
    MissingColumns(String),

    #[error("Unparseable timestamp '{value}' on data row {row}")]
    InvalidTimestamp { value: String, row: usize },

    #[error(transparent)]
    Table(#[from] PipelineError),
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// A loaded file: its table plus whatever metadata preceded it.
#[derive(Debug, Clone)]
pub struct LoadedTable {
    pub table: TimeSeriesTable,
    pub metadata: BTreeMap<String, String>,
    pub warnings: Vec<PipelineWarning>,
    pub source_path: PathBuf,
}

impl LoadedTable {
    /// DAQ serial number from the metadata block, if present.
    pub fn serial_number(&self) -> Option<&str> {
        self.metadata.get("Serial Number").map(String::as_str)
    }
}

/// Parse a timestamp in any of the formats DAQ and GPS exports use.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim().trim_matches('"');
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Parse one `Key: Value` metadata line. Lines without a colon yield `None`.
fn parse_metadata_line(line: &str) -> Option<(String, String)> {
    let line = line.trim_start_matches('\u{feff}').replace('"', "");
    let (key, value) = line.split_once(':')?;
    Some((key.trim().to_string(), value.trim().to_string()))
}

/// Read `count` metadata lines from the top of a reader.
fn read_metadata<R: BufRead>(reader: &mut R, count: usize, path: &Path) -> Result<BTreeMap<String, String>> {
    let mut metadata = BTreeMap::new();
    let mut line = String::new();
    for found in 0..count {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(LoaderError::TruncatedHeader {
                path: path.to_path_buf(),
                expected: count,
                found,
            });
        }
        if let Some((key, value)) = parse_metadata_line(&line) {
            metadata.insert(key, value);
        }
    }
    Ok(metadata)
}

/// Parse a CSV body into a table. The first header accepted by `time_column`
/// is the timestamp; headers listed in `skip` are ignored.
fn read_table<R: Read>(
    reader: R,
    time_column: impl Fn(&str) -> bool,
    skip: &[&str],
    path: &Path,
) -> Result<Outcome<TimeSeriesTable>> {
    let mut csv_reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = csv_reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let time_idx = headers
        .iter()
        .position(|h| time_column(h.as_str()))
        .ok_or_else(|| LoaderError::MissingColumns(format!("time column in {}", path.display())))?;

    let channel_idx: Vec<usize> = (0..headers.len())
        .filter(|&i| i != time_idx && !headers[i].is_empty() && !skip.contains(&headers[i].as_str()))
        .collect();

    let mut timestamps = Vec::new();
    let mut values: Vec<Vec<Option<f64>>> = vec![Vec::new(); channel_idx.len()];
    let mut text_cells = vec![0usize; channel_idx.len()];

    for (row, result) in csv_reader.records().enumerate() {
        let record = result?;
        let raw_time = record.get(time_idx).unwrap_or("");
        if raw_time.is_empty() && record.iter().all(str::is_empty) {
            continue;
        }
        let ts = parse_timestamp(raw_time).ok_or_else(|| LoaderError::InvalidTimestamp {
            value: raw_time.to_string(),
            row: row + 1,
        })?;
        timestamps.push(ts);

        for (slot, &idx) in channel_idx.iter().enumerate() {
            let cell = record.get(idx).unwrap_or("");
            let parsed = if cell.is_empty() {
                None
            } else {
                let v = cell.parse::<f64>().ok();
                if v.is_none() {
                    text_cells[slot] += 1;
                }
                v
            };
            values[slot].push(parsed);
        }
    }

    if timestamps.is_empty() {
        return Err(LoaderError::EmptyFile(path.to_path_buf()));
    }

    // Columns that never hold a number (status strings, fix type) are dropped.
    let columns: Vec<Column> = channel_idx
        .iter()
        .zip(values)
        .zip(text_cells)
        .filter_map(|((&idx, vals), text)| {
            if text > 0 && vals.iter().all(Option::is_none) {
                debug!("Dropping non-numeric column '{}'", headers[idx]);
                None
            } else {
                Some(Column::new(headers[idx].clone(), vals))
            }
        })
        .collect();

    Ok(TimeSeriesTable::build(timestamps, columns)?)
}

/// Load a DAQ CSV export.
///
/// The first [`DAQ_HEADER_LINES`] lines are parsed as `Key: Value` metadata.
/// Channel columns keep their raw names (e.g. `AI0 (°C)`); renaming to
/// semantic labels is left to the channel renamer. Empty or non-numeric
/// cells become missing values.
pub fn load_daq_csv<P: AsRef<Path>>(path: P) -> Result<LoadedTable> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let metadata = read_metadata(&mut reader, DAQ_HEADER_LINES, path)?;
    let outcome = read_table(reader, |h| h == DAQ_TIME_COLUMN, DAQ_SKIP_COLUMNS, path)?;

    debug!(
        "Loaded DAQ file {} ({} rows, {} channels, serial {:?})",
        path.display(),
        outcome.value.len(),
        outcome.value.columns().len(),
        metadata.get("Serial Number")
    );

    Ok(LoadedTable {
        table: outcome.value,
        metadata,
        warnings: outcome.warnings,
        source_path: path.to_path_buf(),
    })
}

/// Load a GPS CSV export with a time column and coordinate columns.
pub fn load_gps_csv<P: AsRef<Path>>(path: P) -> Result<LoadedTable> {
    let path = path.as_ref();
    let file = File::open(path)?;

    let outcome = read_table(
        BufReader::new(file),
        |h| GPS_TIME_COLUMNS.contains(&h.to_lowercase().as_str()),
        &[],
        path,
    )?;

    debug!(
        "Loaded GPS file {} ({} fixes)",
        path.display(),
        outcome.value.len()
    );

    Ok(LoadedTable {
        table: outcome.value,
        metadata: BTreeMap::new(),
        warnings: outcome.warnings,
        source_path: path.to_path_buf(),
    })
}

/// Read only the metadata block of a DAQ export.
pub fn read_daq_metadata<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, String>> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    read_metadata(&mut reader, DAQ_HEADER_LINES, path)
}
