//! Temporal alignment of several sensor tables onto one timeline.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use log::debug;

use crate::core::table::{Column, MergedDataset, TimeSeriesTable};
use crate::error::{PipelineError, Result};

/// Merge tables on the union of their timestamps.
///
/// Each output row carries a source's values only if that source has a row
/// at exactly that timestamp; all other cells are missing. Nothing is
/// interpolated or forward-filled. A label shared by several sources becomes
/// one column, and the merge fails with `AmbiguousColumn` if two of them
/// hold a value at the same timestamp.
pub fn merge_tables(tables: &[&TimeSeriesTable]) -> Result<MergedDataset> {
    if tables.is_empty() {
        return Err(PipelineError::NoSources);
    }

    let mut timeline: Vec<NaiveDateTime> = tables
        .iter()
        .flat_map(|t| t.timestamps().iter().copied())
        .collect();
    timeline.sort_unstable();
    timeline.dedup();

    let row_of: HashMap<NaiveDateTime, usize> = timeline
        .iter()
        .enumerate()
        .map(|(i, ts)| (*ts, i))
        .collect();

    let mut columns: Vec<Column> = Vec::new();
    let mut column_index: HashMap<String, usize> = HashMap::new();

    for table in tables {
        // Source rows are sorted, so their output rows are too.
        let targets: Vec<usize> = table.timestamps().iter().map(|ts| row_of[ts]).collect();

        for source in table.columns() {
            let idx = *column_index.entry(source.label.clone()).or_insert_with(|| {
                columns.push(Column::new(source.label.clone(), vec![None; timeline.len()]));
                columns.len() - 1
            });
            let dest = &mut columns[idx];

            for (value, &row) in source.values.iter().zip(targets.iter()) {
                let Some(v) = value else { continue };
                if dest.values[row].is_some() {
                    return Err(PipelineError::AmbiguousColumn {
                        column: source.label.clone(),
                        timestamp: timeline[row],
                    });
                }
                dest.values[row] = Some(*v);
            }
        }
    }

    debug!(
        "Merged {} tables into {} rows x {} columns",
        tables.len(),
        timeline.len(),
        columns.len()
    );

    Ok(TimeSeriesTable::from_sorted(timeline, columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::table::test_support::{some, ts};

    #[test]
    fn test_union_timeline_marks_missing() {
        let a = TimeSeriesTable::new(
            vec![ts(0), ts(2), ts(4)],
            vec![
                Column::new("t1", some(&[1.0, 2.0, 3.0])),
                Column::new("t2", some(&[10.0, 20.0, 30.0])),
            ],
        )
        .unwrap();
        let b = TimeSeriesTable::new(vec![ts(1), ts(3)], vec![Column::new("t3", some(&[5.0, 6.0]))])
            .unwrap();

        let merged = merge_tables(&[&a, &b]).unwrap();

        assert_eq!(merged.timestamps(), &[ts(0), ts(1), ts(2), ts(3), ts(4)]);
        assert_eq!(
            merged.column("t1").unwrap(),
            &[Some(1.0), None, Some(2.0), None, Some(3.0)]
        );
        assert_eq!(
            merged.column("t2").unwrap(),
            &[Some(10.0), None, Some(20.0), None, Some(30.0)]
        );
        assert_eq!(
            merged.column("t3").unwrap(),
            &[None, Some(5.0), None, Some(6.0), None]
        );
    }

    #[test]
    fn test_collision_fails() {
        let a = TimeSeriesTable::new(vec![ts(0), ts(1)], vec![Column::new("IR Raw", some(&[1.0, 2.0]))])
            .unwrap();
        let b = TimeSeriesTable::new(vec![ts(1), ts(2)], vec![Column::new("IR Raw", some(&[3.0, 4.0]))])
            .unwrap();

        let err = merge_tables(&[&a, &b]).unwrap_err();
        assert_eq!(
            err,
            PipelineError::AmbiguousColumn {
                column: "IR Raw".to_string(),
                timestamp: ts(1),
            }
        );
    }

    #[test]
    fn test_shared_label_on_disjoint_timestamps() {
        let a = TimeSeriesTable::new(vec![ts(0)], vec![Column::new("x", some(&[1.0]))]).unwrap();
        let b = TimeSeriesTable::new(vec![ts(5)], vec![Column::new("x", some(&[2.0]))]).unwrap();

        let merged = merge_tables(&[&a, &b]).unwrap();
        assert_eq!(merged.labels(), vec!["x"]);
        assert_eq!(merged.column("x").unwrap(), &[Some(1.0), Some(2.0)]);
    }

    #[test]
    fn test_different_sampling_rates() {
        let fast = TimeSeriesTable::new(
            (0..10).map(ts).collect(),
            vec![Column::new("fast", (0..10).map(|i| Some(i as f64)).collect())],
        )
        .unwrap();
        let slow = TimeSeriesTable::new(
            vec![ts(0), ts(5)],
            vec![Column::new("slow", some(&[1.0, 2.0]))],
        )
        .unwrap();

        let merged = merge_tables(&[&fast, &slow]).unwrap();
        assert_eq!(merged.len(), 10);
        let present = merged.column("slow").unwrap().iter().filter(|v| v.is_some()).count();
        assert_eq!(present, 2);
    }

    #[test]
    fn test_no_sources() {
        assert_eq!(merge_tables(&[]).unwrap_err(), PipelineError::NoSources);
    }
}
