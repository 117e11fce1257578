//! Core data types and I/O operations.

pub mod loaders;
pub mod table;
pub mod writers;

pub use loaders::{load_daq_csv, load_gps_csv, LoadedTable, LoaderError};
pub use table::{Column, MergedDataset, SensorReading, TimeSeriesTable};
pub use writers::{write_geo_csv, write_grid_csv, write_profiles_csv, write_table_csv, WriteError};
