//! Alignment, unit conversion and spatial gridding for M-TEMP sensor carts.
//!
//! This crate provides tools for:
//! - Loading DAQ temperature/IR/RH exports and GPS tracks
//! - Renaming raw DAQ channels to per-cart semantic labels
//! - Converting Celsius, IR voltage and RH voltage to physical units
//! - Merging recordings onto one timeline and joining GPS positions
//! - Aggregating observations into spatial heatmaps and vertical profiles
//!
//! # Example
//!
//! ```no_run
//! use mtemp_pipeline::core::loaders::load_daq_csv;
//! use mtemp_pipeline::processors::pipeline::RunContext;
//! use mtemp_pipeline::PipelineConfig;
//!
//! let config = PipelineConfig::default();
//! let raw = load_daq_csv("temperature.csv").unwrap();
//! let mut ctx = RunContext::new(&config);
//! ctx.prepare_temperature(&raw.table, "Cart 2 Temp").unwrap();
//! let profiles = ctx.vertical_profile().unwrap();
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod processors;
pub mod visualization;

pub use config::{CalibrationConfig, GridConfig, PipelineConfig, ProfileConfig, SpatialConfig};
pub use crate::core::table::{MergedDataset, TimeSeriesTable};
pub use error::{Outcome, PipelineError, PipelineWarning};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
