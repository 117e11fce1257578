//! Per-run orchestration.
//!
//! A [`RunContext`] holds the datasets produced so far for one test run and
//! exposes each stage as a method. Stages read from the context and store
//! their output back into it; a failing stage leaves everything computed
//! before it untouched. [`process_runs`] drives whole runs, in parallel,
//! each with its own context.

use std::fmt;

use log::{info, warn};
use rayon::prelude::*;

use crate::config::{seconds_to_duration, PipelineConfig};
use crate::core::table::{MergedDataset, TimeSeriesTable};
use crate::error::{PipelineError, PipelineWarning, Result};
use crate::processors::channels::rename_channels;
use crate::processors::grid::{aggregate_heatmap, Grid};
use crate::processors::merge::merge_tables;
use crate::processors::profile::{vertical_profile, VerticalProfile};
use crate::processors::spatial::{spatially_enable, GeoEnabledDataset, PositionTrack};
use crate::processors::units::{convert_celsius_columns, humidity_from_voltage, ir_from_voltage};

/// Kind of DAQ recording, used to pick a cart's channel profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Temperature,
    IrRh,
}

/// Channel profile name for a cart and recording kind, e.g. "Cart 2 IR".
pub fn profile_name(cart: &str, kind: SourceKind) -> String {
    match kind {
        SourceKind::Temperature => format!("{} Temp", cart),
        SourceKind::IrRh => format!("{} IR", cart),
    }
}

/// A raw table and the channel profile it should be renamed with.
#[derive(Debug, Clone)]
pub struct SourceTable {
    pub table: TimeSeriesTable,
    pub profile: String,
}

/// Everything one run needs, already loaded.
#[derive(Debug, Clone, Default)]
pub struct RunInputs {
    pub id: u32,
    pub temperature: Option<SourceTable>,
    pub ir_rh: Option<SourceTable>,
    pub gps: Option<TimeSeriesTable>,
}

/// Pipeline stages, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Temperature,
    IrRh,
    Spatial,
    Heatmap,
    Profile,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Temperature => "temperature",
            Stage::IrRh => "ir/rh",
            Stage::Spatial => "spatial",
            Stage::Heatmap => "heatmap",
            Stage::Profile => "profile",
        };
        write!(f, "{}", name)
    }
}

/// Datasets produced so far for one run.
pub struct RunContext<'a> {
    config: &'a PipelineConfig,
    temperature: Option<TimeSeriesTable>,
    ir_rh: Option<TimeSeriesTable>,
    merged: Option<MergedDataset>,
    geo: Option<GeoEnabledDataset>,
    warnings: Vec<PipelineWarning>,
}

impl<'a> RunContext<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self {
            config,
            temperature: None,
            ir_rh: None,
            merged: None,
            geo: None,
            warnings: Vec::new(),
        }
    }

    /// Rename a raw temperature table and add its Fahrenheit columns.
    pub fn prepare_temperature(&mut self, raw: &TimeSeriesTable, profile: &str) -> Result<&TimeSeriesTable> {
        let (renamed, warnings) = rename_channels(raw, &self.config.carts, profile)?.into_parts();
        self.warnings.extend(warnings);
        let converted = convert_celsius_columns(&renamed)?;
        self.invalidate();
        Ok(self.temperature.insert(converted))
    }

    /// Rename a raw IR/RH table and derive IR temperature and humidity.
    ///
    /// Humidity pairs with temperature columns from the prepared temperature
    /// table, so call [`prepare_temperature`](Self::prepare_temperature)
    /// first when the run has one.
    pub fn prepare_ir_rh(&mut self, raw: &TimeSeriesTable, profile: &str) -> Result<&TimeSeriesTable> {
        let config = self.config;
        let calibration = &config.calibration;
        let renamed = rename_channels(raw, &config.carts, profile)?;
        self.warnings.extend(renamed.warnings);

        let with_ir = ir_from_voltage(&renamed.value, &calibration.ir)?;
        let humidity = humidity_from_voltage(
            &with_ir,
            self.temperature.as_ref(),
            &calibration.humidity_channels,
            &calibration.humidity,
            seconds_to_duration(calibration.pairing_gap_seconds),
        )?;
        self.warnings.extend(humidity.warnings);
        self.invalidate();
        Ok(self.ir_rh.insert(humidity.value))
    }

    /// Merge every prepared table onto one timeline.
    pub fn merge(&mut self) -> Result<&MergedDataset> {
        let sources: Vec<&TimeSeriesTable> = self.temperature.iter().chain(self.ir_rh.iter()).collect();
        let merged = merge_tables(&sources)?;
        self.geo = None;
        Ok(self.merged.insert(merged))
    }

    /// Attach GPS positions to the merged dataset, merging first if needed.
    pub fn spatially_enable(&mut self, gps: &TimeSeriesTable) -> Result<&GeoEnabledDataset> {
        if self.merged.is_none() {
            self.merge()?;
        }
        let spatial = &self.config.spatial;
        let track = PositionTrack::from_table(gps, &spatial.latitude_label, &spatial.longitude_label)?;
        let merged = self.merged.as_ref().ok_or(PipelineError::NoSources)?;
        let outcome = spatially_enable(merged, &track, spatial)?;
        self.warnings.extend(outcome.warnings);
        Ok(self.geo.insert(outcome.value))
    }

    /// Heatmap of `column` (the configured target if `None`).
    pub fn heatmap(&self, column: Option<&str>) -> Result<Grid> {
        let geo = self.geo.as_ref().ok_or(PipelineError::NoPositionData)?;
        let column = column.unwrap_or(&self.config.grid.target);
        aggregate_heatmap(geo, column, &self.config.grid)
    }

    /// Vertical profiles of the most complete dataset available.
    pub fn vertical_profile(&self) -> Result<Vec<VerticalProfile>> {
        let table = self
            .merged
            .as_ref()
            .or(self.temperature.as_ref())
            .or(self.ir_rh.as_ref())
            .ok_or(PipelineError::NoSources)?;
        vertical_profile(table, &self.config.profile)
    }

    pub fn temperature(&self) -> Option<&TimeSeriesTable> {
        self.temperature.as_ref()
    }

    pub fn ir_rh(&self) -> Option<&TimeSeriesTable> {
        self.ir_rh.as_ref()
    }

    pub fn merged(&self) -> Option<&MergedDataset> {
        self.merged.as_ref()
    }

    pub fn geo(&self) -> Option<&GeoEnabledDataset> {
        self.geo.as_ref()
    }

    pub fn warnings(&self) -> &[PipelineWarning] {
        &self.warnings
    }

    /// Downstream datasets no longer match their inputs.
    fn invalidate(&mut self) {
        self.merged = None;
        self.geo = None;
    }
}

/// Products of one run.
#[derive(Debug)]
pub struct RunOutput {
    pub id: u32,
    pub merged: MergedDataset,
    pub geo: Option<GeoEnabledDataset>,
    pub heatmap: Option<Grid>,
    pub profiles: Vec<VerticalProfile>,
    pub warnings: Vec<PipelineWarning>,
    /// Stages that failed without stopping the run
    pub failures: Vec<(Stage, PipelineError)>,
}

/// Run every stage for one set of inputs.
///
/// Only a failed merge is fatal. Any other failing stage is recorded in
/// `failures` and the stages that do not depend on it still run.
pub fn process_run(inputs: &RunInputs, config: &PipelineConfig) -> Result<RunOutput> {
    let mut ctx = RunContext::new(config);
    let mut failures = Vec::new();

    if let Some(source) = &inputs.temperature {
        if let Err(e) = ctx.prepare_temperature(&source.table, &source.profile) {
            failures.push((Stage::Temperature, e));
        }
    }
    if let Some(source) = &inputs.ir_rh {
        if let Err(e) = ctx.prepare_ir_rh(&source.table, &source.profile) {
            failures.push((Stage::IrRh, e));
        }
    }

    ctx.merge()?;

    let mut heatmap = None;
    if let Some(gps) = &inputs.gps {
        let enabled = ctx.spatially_enable(gps).map(|_| ());
        match enabled {
            Ok(()) => match ctx.heatmap(None) {
                Ok(grid) => heatmap = Some(grid),
                Err(e) => failures.push((Stage::Heatmap, e)),
            },
            Err(e) => failures.push((Stage::Spatial, e)),
        }
    }

    let profiles = match ctx.vertical_profile() {
        Ok(p) => p,
        Err(e) => {
            failures.push((Stage::Profile, e));
            Vec::new()
        }
    };

    for (stage, err) in &failures {
        warn!("Run {}: {} stage failed: {}", inputs.id, stage, err);
    }

    let RunContext {
        merged, geo, warnings, ..
    } = ctx;
    let merged = merged.ok_or(PipelineError::NoSources)?;

    info!(
        "Run {}: {} rows, {} warnings, {} failed stages",
        inputs.id,
        merged.len(),
        warnings.len(),
        failures.len()
    );

    Ok(RunOutput {
        id: inputs.id,
        merged,
        geo,
        heatmap,
        profiles,
        warnings,
        failures,
    })
}

/// Process independent runs in parallel. Results keep the input order.
pub fn process_runs(runs: &[RunInputs], config: &PipelineConfig) -> Vec<(u32, Result<RunOutput>)> {
    runs.par_iter()
        .map(|inputs| (inputs.id, process_run(inputs, config)))
        .collect()
}
