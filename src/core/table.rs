//! Time-indexed tabular data shared by every pipeline stage.
//!
//! A [`TimeSeriesTable`] owns a strictly ascending, duplicate-free timestamp
//! axis and a list of labelled numeric columns. Missing values are `None`;
//! they are never replaced by zero.

use std::collections::HashSet;

use chrono::{Duration, NaiveDateTime};
use log::warn;

use crate::error::{Outcome, PipelineError, PipelineWarning, Result};

/// One labelled numeric column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub label: String,
    pub values: Vec<Option<f64>>,
}

impl Column {
    pub fn new<S: Into<String>>(label: S, values: Vec<Option<f64>>) -> Self {
        Self {
            label: label.into(),
            values,
        }
    }

    /// Number of non-missing values.
    pub fn count_present(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }
}

/// A single row of a table: timestamp plus label/value pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading<'a> {
    pub timestamp: NaiveDateTime,
    pub values: Vec<(&'a str, Option<f64>)>,
}

impl<'a> SensorReading<'a> {
    /// Value for `label`, `None` if the label is absent or the value missing.
    pub fn get(&self, label: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(l, _)| *l == label)
            .and_then(|(_, v)| *v)
    }
}

/// Ordered, timestamp-keyed table of numeric channels.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimeSeriesTable {
    timestamps: Vec<NaiveDateTime>,
    columns: Vec<Column>,
}

/// Output of the temporal aligner.
pub type MergedDataset = TimeSeriesTable;

impl TimeSeriesTable {
    /// Build a table from raw rows, sorting by timestamp and dropping
    /// duplicate timestamps (the first occurrence in input order is kept).
    ///
    /// Non-finite values are stored as missing.
    pub fn build(timestamps: Vec<NaiveDateTime>, columns: Vec<Column>) -> Result<Outcome<Self>> {
        let n = timestamps.len();
        let mut seen = HashSet::with_capacity(columns.len());
        for col in &columns {
            if col.values.len() != n {
                return Err(PipelineError::ShapeMismatch {
                    column: col.label.clone(),
                    expected: n,
                    found: col.values.len(),
                });
            }
            if !seen.insert(col.label.as_str()) {
                return Err(PipelineError::DuplicateColumn(col.label.clone()));
            }
        }

        // Stable sort keeps input order among equal timestamps
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| timestamps[i]);

        let mut keep = Vec::with_capacity(n);
        for &i in &order {
            match keep.last() {
                Some(&prev) if timestamps[prev] == timestamps[i] => {}
                _ => keep.push(i),
            }
        }
        let dropped = n - keep.len();

        let sorted_ts: Vec<NaiveDateTime> = keep.iter().map(|&i| timestamps[i]).collect();
        let sorted_cols: Vec<Column> = columns
            .into_iter()
            .map(|col| Column {
                values: keep
                    .iter()
                    .map(|&i| col.values[i].filter(|v| v.is_finite()))
                    .collect(),
                label: col.label,
            })
            .collect();

        let table = Self {
            timestamps: sorted_ts,
            columns: sorted_cols,
        };

        if dropped > 0 {
            warn!("Dropped {} duplicate timestamps while building table", dropped);
            Ok(Outcome::with_warnings(
                table,
                vec![PipelineWarning::DuplicateTimestamps { dropped }],
            ))
        } else {
            Ok(Outcome::clean(table))
        }
    }

    /// Same as [`TimeSeriesTable::build`], discarding the warnings (they are logged).
    pub fn new(timestamps: Vec<NaiveDateTime>, columns: Vec<Column>) -> Result<Self> {
        Self::build(timestamps, columns).map(|outcome| outcome.value)
    }

    /// Build from parts that already satisfy the ordering invariant.
    pub(crate) fn from_sorted(timestamps: Vec<NaiveDateTime>, columns: Vec<Column>) -> Self {
        debug_assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
        debug_assert!(columns.iter().all(|c| c.values.len() == timestamps.len()));
        Self {
            timestamps,
            columns,
        }
    }

    /// Number of rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    #[inline]
    pub fn timestamps(&self) -> &[NaiveDateTime] {
        &self.timestamps
    }

    #[inline]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column labels in table order.
    pub fn labels(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.label.as_str()).collect()
    }

    pub fn has_column(&self, label: &str) -> bool {
        self.columns.iter().any(|c| c.label == label)
    }

    pub fn column(&self, label: &str) -> Option<&[Option<f64>]> {
        self.columns
            .iter()
            .find(|c| c.label == label)
            .map(|c| c.values.as_slice())
    }

    /// Value at `row` for `label`.
    pub fn value(&self, row: usize, label: &str) -> Option<f64> {
        self.column(label).and_then(|values| values.get(row).copied().flatten())
    }

    /// Row view at index `row`.
    pub fn row(&self, row: usize) -> Option<SensorReading<'_>> {
        let timestamp = *self.timestamps.get(row)?;
        Some(SensorReading {
            timestamp,
            values: self
                .columns
                .iter()
                .map(|c| (c.label.as_str(), c.values[row]))
                .collect(),
        })
    }

    /// Return a new table with `label` added, or replaced if it already exists.
    pub fn with_column<S: Into<String>>(&self, label: S, values: Vec<Option<f64>>) -> Result<Self> {
        let label = label.into();
        if values.len() != self.len() {
            return Err(PipelineError::ShapeMismatch {
                column: label,
                expected: self.len(),
                found: values.len(),
            });
        }
        let values = values.into_iter().map(|v| v.filter(|x| x.is_finite())).collect();
        let mut columns = self.columns.clone();
        match columns.iter_mut().find(|c| c.label == label) {
            Some(existing) => existing.values = values,
            None => columns.push(Column { label, values }),
        }
        Ok(Self {
            timestamps: self.timestamps.clone(),
            columns,
        })
    }

    /// Keep only the listed columns (in the listed order); unknown labels are skipped.
    pub fn select(&self, labels: &[&str]) -> Self {
        let columns = labels
            .iter()
            .filter_map(|l| self.columns.iter().find(|c| c.label == *l).cloned())
            .collect();
        Self {
            timestamps: self.timestamps.clone(),
            columns,
        }
    }

    /// Rows whose timestamp falls in `[start, end]`.
    pub fn between(&self, start: NaiveDateTime, end: NaiveDateTime) -> Self {
        let lo = self.timestamps.partition_point(|t| *t < start);
        let hi = self.timestamps.partition_point(|t| *t <= end).max(lo);
        Self {
            timestamps: self.timestamps[lo..hi].to_vec(),
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    label: c.label.clone(),
                    values: c.values[lo..hi].to_vec(),
                })
                .collect(),
        }
    }

    /// Index of the row with exactly this timestamp.
    pub fn index_of(&self, ts: NaiveDateTime) -> Option<usize> {
        self.timestamps.binary_search(&ts).ok()
    }

    /// Index of the row closest in time to `ts`, if within `tolerance`.
    ///
    /// On an exact tie between an earlier and a later row the earlier wins.
    pub fn nearest_index(&self, ts: NaiveDateTime, tolerance: Duration) -> Option<usize> {
        nearest_timestamp(&self.timestamps, ts, tolerance)
    }
}

/// Nearest-timestamp search over a sorted slice.
pub(crate) fn nearest_timestamp(
    sorted: &[NaiveDateTime],
    ts: NaiveDateTime,
    tolerance: Duration,
) -> Option<usize> {
    if sorted.is_empty() {
        return None;
    }
    let idx = sorted.partition_point(|t| *t < ts);

    let before = idx.checked_sub(1).map(|i| (i, ts - sorted[i]));
    let after = sorted.get(idx).map(|t| (idx, *t - ts));

    let best = match (before, after) {
        (Some(b), Some(a)) => {
            if a.1 < b.1 {
                a
            } else {
                b
            }
        }
        (Some(b), None) => b,
        (None, Some(a)) => a,
        (None, None) => return None,
    };

    if best.1 <= tolerance {
        Some(best.0)
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{NaiveDate, NaiveDateTime};

    /// Timestamp `secs` seconds after 2024-10-15 12:00:00.
    pub fn ts(secs: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 10, 15)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            + chrono::Duration::seconds(secs)
    }

    pub fn some(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().map(|&v| Some(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{some, ts};
    use super::*;

    #[test]
    fn test_build_sorts_and_dedups() {
        let outcome = TimeSeriesTable::build(
            vec![ts(4), ts(0), ts(2), ts(0)],
            vec![Column::new("a", some(&[4.0, 0.0, 2.0, 99.0]))],
        )
        .unwrap();

        let table = outcome.value;
        assert_eq!(table.timestamps(), &[ts(0), ts(2), ts(4)]);
        assert_eq!(table.column("a").unwrap(), &[Some(0.0), Some(2.0), Some(4.0)]);
        assert_eq!(
            outcome.warnings,
            vec![PipelineWarning::DuplicateTimestamps { dropped: 1 }]
        );
    }

    #[test]
    fn test_build_rejects_shape_mismatch() {
        let err = TimeSeriesTable::new(vec![ts(0), ts(1)], vec![Column::new("a", some(&[1.0]))])
            .unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_build_rejects_duplicate_label() {
        let err = TimeSeriesTable::new(
            vec![ts(0)],
            vec![Column::new("a", some(&[1.0])), Column::new("a", some(&[2.0]))],
        )
        .unwrap_err();
        assert_eq!(err, PipelineError::DuplicateColumn("a".to_string()));
    }

    #[test]
    fn test_non_finite_values_become_missing() {
        let table = TimeSeriesTable::new(
            vec![ts(0), ts(1)],
            vec![Column::new("a", vec![Some(f64::NAN), Some(1.0)])],
        )
        .unwrap();
        assert_eq!(table.value(0, "a"), None);
        assert_eq!(table.value(1, "a"), Some(1.0));
    }

    #[test]
    fn test_between_is_inclusive() {
        let table = TimeSeriesTable::new(
            (0..10).map(ts).collect(),
            vec![Column::new("a", (0..10).map(|i| Some(i as f64)).collect())],
        )
        .unwrap();

        let slice = table.between(ts(3), ts(5));
        assert_eq!(slice.len(), 3);
        assert_eq!(slice.value(0, "a"), Some(3.0));
        assert_eq!(slice.value(2, "a"), Some(5.0));

        assert!(table.between(ts(20), ts(30)).is_empty());
    }

    #[test]
    fn test_nearest_index_tolerance_and_tie() {
        let table = TimeSeriesTable::new(vec![ts(0), ts(10)], vec![]).unwrap();

        assert_eq!(table.nearest_index(ts(3), Duration::seconds(5)), Some(0));
        assert_eq!(table.nearest_index(ts(8), Duration::seconds(5)), Some(1));
        // equidistant: earlier sample wins
        assert_eq!(table.nearest_index(ts(5), Duration::seconds(5)), Some(0));
        assert_eq!(table.nearest_index(ts(30), Duration::seconds(5)), None);
    }

    #[test]
    fn test_with_column_replaces_existing() {
        let table = TimeSeriesTable::new(vec![ts(0)], vec![Column::new("a", some(&[1.0]))]).unwrap();
        let updated = table.with_column("a", some(&[2.0])).unwrap();
        assert_eq!(updated.labels(), vec!["a"]);
        assert_eq!(updated.value(0, "a"), Some(2.0));
        // original untouched
        assert_eq!(table.value(0, "a"), Some(1.0));
    }

    #[test]
    fn test_row_view() {
        let table = TimeSeriesTable::new(
            vec![ts(0)],
            vec![Column::new("a", some(&[1.0])), Column::new("b", vec![None])],
        )
        .unwrap();
        let row = table.row(0).unwrap();
        assert_eq!(row.timestamp, ts(0));
        assert_eq!(row.get("a"), Some(1.0));
        assert_eq!(row.get("b"), None);
        assert!(table.row(1).is_none());
    }
}
