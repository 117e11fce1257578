//! CSV writers for pipeline outputs.
//!
//! - Time-series tables (one row per timestamp, one column per channel)
//! - Spatially enabled datasets (adds latitude/longitude and planar x/y)
//! - Heatmap grids (one row per cell, undefined cells left blank)
//! - Vertical profiles (one row per quantity and band)
//!
//! Missing values are written as empty fields, never as zero.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use thiserror::Error;

use super::table::TimeSeriesTable;
use crate::processors::grid::Grid;
use crate::processors::profile::VerticalProfile;
use crate::processors::spatial::GeoEnabledDataset;

/// Timestamp format used in every exported table.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// CSV writing error.
    #[error("CSV write error for '{path}': {source}")]
    CsvError {
        path: String,
        #[source]
        source: csv::Error,
    },
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

/// Creates parent directories for a file path if they don't exist.
fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// A CSV writer bound to its path for error reporting.
struct CsvOut {
    writer: csv::Writer<BufWriter<File>>,
    path: String,
}

impl CsvOut {
    fn create(path: &Path) -> Result<Self> {
        ensure_parent_dirs(path)?;
        let file = File::create(path).map_err(|e| WriteError::CreateFile {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(Self {
            writer: csv::Writer::from_writer(BufWriter::new(file)),
            path: path.display().to_string(),
        })
    }

    fn record<I, S>(&mut self, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.writer
            .write_record(fields)
            .map_err(|e| WriteError::CsvError {
                path: self.path.clone(),
                source: e,
            })
    }

    fn finish(mut self) -> Result<()> {
        self.writer.flush().map_err(|e| WriteError::WriteFile {
            path: self.path,
            source: e,
        })
    }
}

fn fmt_value(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Write a time-series table with a leading `Time` column.
pub fn write_table_csv(path: &Path, table: &TimeSeriesTable) -> Result<()> {
    let mut out = CsvOut::create(path)?;

    out.record(std::iter::once("Time").chain(table.labels()))?;

    for row in 0..table.len() {
        let mut fields = Vec::with_capacity(table.columns().len() + 1);
        fields.push(table.timestamps()[row].format(TIMESTAMP_FORMAT).to_string());
        fields.extend(table.columns().iter().map(|c| fmt_value(c.values[row])));
        out.record(&fields)?;
    }

    out.finish()
}

/// Write a spatially enabled dataset. Rows without a position keep blank
/// coordinate fields.
pub fn write_geo_csv(path: &Path, dataset: &GeoEnabledDataset) -> Result<()> {
    let mut out = CsvOut::create(path)?;
    let table = dataset.table();

    out.record(
        ["Time", "Latitude", "Longitude", "x", "y"]
            .into_iter()
            .chain(table.labels()),
    )?;

    for row in 0..table.len() {
        let mut fields = Vec::with_capacity(table.columns().len() + 5);
        fields.push(table.timestamps()[row].format(TIMESTAMP_FORMAT).to_string());
        match dataset.position(row) {
            Some(pos) => {
                fields.push(format!("{:.7}", pos.latitude));
                fields.push(format!("{:.7}", pos.longitude));
                fields.push(format!("{:.3}", pos.planar.x));
                fields.push(format!("{:.3}", pos.planar.y));
            }
            None => fields.extend(std::iter::repeat(String::new()).take(4)),
        }
        fields.extend(table.columns().iter().map(|c| fmt_value(c.values[row])));
        out.record(&fields)?;
    }

    out.finish()
}

/// Write every heatmap cell with its planar bounds.
pub fn write_grid_csv(path: &Path, grid: &Grid) -> Result<()> {
    let mut out = CsvOut::create(path)?;

    out.record([
        "col",
        "row",
        "min_x",
        "min_y",
        "max_x",
        "max_y",
        "value",
        "count",
        "interpolated",
    ])?;

    for row in 0..grid.rows() {
        for col in 0..grid.cols() {
            let bounds = grid.cell_bounds(col, row);
            let cell = grid.cell(col, row);
            out.record(&[
                col.to_string(),
                row.to_string(),
                format!("{:.3}", bounds.min_x),
                format!("{:.3}", bounds.min_y),
                format!("{:.3}", bounds.max_x),
                format!("{:.3}", bounds.max_y),
                fmt_value(cell.map(|c| c.value)),
                cell.map(|c| c.count.to_string()).unwrap_or_default(),
                cell.map(|c| c.interpolated.to_string()).unwrap_or_default(),
            ])?;
        }
    }

    out.finish()
}

/// Write vertical profiles, one row per quantity and band.
pub fn write_profiles_csv(path: &Path, profiles: &[VerticalProfile]) -> Result<()> {
    let mut out = CsvOut::create(path)?;

    out.record(["quantity", "lower_ft", "upper_ft", "mean", "unit", "count"])?;

    for profile in profiles {
        for band in &profile.bands {
            out.record(&[
                profile.quantity.to_string(),
                format!("{:.3}", band.lower),
                format!("{:.3}", band.upper),
                fmt_value(band.mean),
                profile.quantity.unit().to_string(),
                band.count.to_string(),
            ])?;
        }
    }

    out.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GridConfig, ProfileConfig};
    use crate::core::table::test_support::{some, ts};
    use crate::core::table::Column;
    use crate::processors::grid::aggregate_heatmap;
    use crate::processors::profile::vertical_profile;
    use crate::processors::spatial::{GeoPosition, PlanarPoint};
    use tempfile::tempdir;

    fn table() -> TimeSeriesTable {
        TimeSeriesTable::new(
            vec![ts(0), ts(1)],
            vec![
                Column::new("1.8 ft (°F)", some(&[65.5, 66.0])),
                Column::new("IR (°F)", vec![None, Some(70.25)]),
            ],
        )
        .unwrap()
    }

    fn geo() -> GeoEnabledDataset {
        let positions = vec![
            Some(GeoPosition {
                latitude: 40.0,
                longitude: -83.0,
                planar: PlanarPoint { x: 0.0, y: 0.0 },
            }),
            None,
        ];
        GeoEnabledDataset::new(table(), positions, "EPSG:3857").unwrap()
    }

    #[test]
    fn test_write_table_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("merged.csv");

        write_table_csv(&path, &table()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "Time,1.8 ft (°F),IR (°F)");
        assert_eq!(lines[1], "2024-10-15 12:00:00.000,65.5,");
        assert_eq!(lines[2], "2024-10-15 12:00:01.000,66,70.25");
    }

    #[test]
    fn test_write_geo_csv_blank_positions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geo.csv");

        write_geo_csv(&path, &geo()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].starts_with("Time,Latitude,Longitude,x,y,"));
        assert!(lines[1].contains("40.0000000,-83.0000000,0.000,0.000"));
        assert!(lines[2].starts_with("2024-10-15 12:00:01.000,,,,,"));
    }

    #[test]
    fn test_write_grid_csv_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run1").join("grids").join("heatmap.csv");
        let grid = aggregate_heatmap(&geo(), "1.8 ft (°F)", &GridConfig::default()).unwrap();

        write_grid_csv(&path, &grid).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with(",65.5,1,false"));
    }

    #[test]
    fn test_write_profiles_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("profile.csv");
        let profiles = vertical_profile(&table(), &ProfileConfig::default()).unwrap();

        write_profiles_csv(&path, &profiles).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "quantity,lower_ft,upper_ft,mean,unit,count");
        assert_eq!(lines[1], "temperature,0.000,10.800,65.75,°F,2");
    }
}
