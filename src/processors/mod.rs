//! Data processing stages.

pub mod channels;
pub mod grid;
pub mod merge;
pub mod pipeline;
pub mod profile;
pub mod spatial;
pub mod units;

// Re-export key types for convenience
pub use channels::{rename_channels, CartProfiles, ChannelMap};
pub use grid::{aggregate_heatmap, Grid, GridCell};
pub use merge::merge_tables;
pub use pipeline::{process_run, process_runs, RunContext, RunInputs, RunOutput};
pub use profile::{vertical_profile, Quantity, VerticalProfile};
pub use spatial::{spatially_enable, GeoEnabledDataset, PositionTrack};
pub use units::{convert_celsius_columns, humidity_from_voltage, ir_from_voltage};
