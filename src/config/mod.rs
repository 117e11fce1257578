//! Configuration types for the M-TEMP pipeline.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::processors::channels::CartProfiles;
use crate::processors::profile::Quantity;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Polynomial coefficients (constant term first) mapping IR voltage to °F.
///
/// 0 V reads -40 °F and 5 V reads 140 °F on the current IR head.
pub const DEFAULT_IR_COEFFICIENTS: [f64; 2] = [-40.0, 36.0];

/// Supply voltage of the RH sensors.
pub const DEFAULT_RH_SUPPLY_VOLTAGE: f64 = 5.0;
/// Output ratio at 0 %RH.
pub const DEFAULT_RH_ZERO_OFFSET: f64 = 0.16;
/// Output ratio change per %RH.
pub const DEFAULT_RH_SLOPE: f64 = 0.0062;
/// Temperature compensation: true RH = sensor RH / (intercept - slope * °C).
pub const DEFAULT_RH_TEMP_COMP_INTERCEPT: f64 = 1.0546;
pub const DEFAULT_RH_TEMP_COMP_SLOPE: f64 = 0.00216;

/// IR head calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrCalibration {
    /// Label of the raw voltage channel
    #[serde(default = "default_ir_raw_label")]
    pub raw_label: String,

    /// Label of the derived temperature column
    #[serde(default = "default_ir_output_label")]
    pub output_label: String,

    /// Polynomial coefficients, constant term first
    #[serde(default = "default_ir_coefficients")]
    pub coefficients: Vec<f64>,
}

fn default_ir_raw_label() -> String {
    "IR Raw (V)".to_string()
}

fn default_ir_output_label() -> String {
    "IR (°F)".to_string()
}

fn default_ir_coefficients() -> Vec<f64> {
    DEFAULT_IR_COEFFICIENTS.to_vec()
}

impl Default for IrCalibration {
    fn default() -> Self {
        Self {
            raw_label: default_ir_raw_label(),
            output_label: default_ir_output_label(),
            coefficients: default_ir_coefficients(),
        }
    }
}

/// RH sensor calibration shared by every humidity channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumidityCalibration {
    #[serde(default = "default_rh_supply")]
    pub supply_voltage: f64,

    #[serde(default = "default_rh_zero_offset")]
    pub zero_offset: f64,

    #[serde(default = "default_rh_slope")]
    pub slope: f64,

    #[serde(default = "default_rh_comp_intercept")]
    pub temp_comp_intercept: f64,

    #[serde(default = "default_rh_comp_slope")]
    pub temp_comp_slope: f64,
}

fn default_rh_supply() -> f64 {
    DEFAULT_RH_SUPPLY_VOLTAGE
}

fn default_rh_zero_offset() -> f64 {
    DEFAULT_RH_ZERO_OFFSET
}

fn default_rh_slope() -> f64 {
    DEFAULT_RH_SLOPE
}

fn default_rh_comp_intercept() -> f64 {
    DEFAULT_RH_TEMP_COMP_INTERCEPT
}

fn default_rh_comp_slope() -> f64 {
    DEFAULT_RH_TEMP_COMP_SLOPE
}

impl Default for HumidityCalibration {
    fn default() -> Self {
        Self {
            supply_voltage: DEFAULT_RH_SUPPLY_VOLTAGE,
            zero_offset: DEFAULT_RH_ZERO_OFFSET,
            slope: DEFAULT_RH_SLOPE,
            temp_comp_intercept: DEFAULT_RH_TEMP_COMP_INTERCEPT,
            temp_comp_slope: DEFAULT_RH_TEMP_COMP_SLOPE,
        }
    }
}

/// A humidity channel and the temperature sensor it is compensated with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumidityChannel {
    /// Raw voltage label
    pub raw: String,
    /// Paired temperature label, in °C
    pub temperature: String,
    /// Label of the derived %RH column
    pub output: String,
}

impl HumidityChannel {
    pub fn new(raw: &str, temperature: &str, output: &str) -> Self {
        Self {
            raw: raw.to_string(),
            temperature: temperature.to_string(),
            output: output.to_string(),
        }
    }
}

fn default_humidity_channels() -> Vec<HumidityChannel> {
    vec![
        HumidityChannel::new("Raw RH 0.0ft", "0.6 ft (°C)", "RH 0.0 ft (%)"),
        HumidityChannel::new("Raw RH 1.8ft", "1.8 ft (°C)", "RH 1.8 ft (%)"),
        HumidityChannel::new("Raw RH 7.2ft", "7.2 ft (°C)", "RH 7.2 ft (%)"),
        HumidityChannel::new("Raw RH 9.0ft", "9.0 ft (°C)", "RH 9.0 ft (%)"),
    ]
}

/// Instrument calibration tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default)]
    pub ir: IrCalibration,

    #[serde(default)]
    pub humidity: HumidityCalibration,

    #[serde(default = "default_humidity_channels")]
    pub humidity_channels: Vec<HumidityChannel>,

    /// Maximum gap when pairing an RH sample with a temperature sample from
    /// another table
    #[serde(default = "default_pairing_gap")]
    pub pairing_gap_seconds: f64,
}

fn default_pairing_gap() -> f64 {
    2.0
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            ir: IrCalibration::default(),
            humidity: HumidityCalibration::default(),
            humidity_channels: default_humidity_channels(),
            pairing_gap_seconds: default_pairing_gap(),
        }
    }
}

/// Planar projection used by the spatial enabler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionKind {
    /// Spherical Web Mercator (EPSG:3857)
    WebMercator,
    /// Equirectangular metres about the track centroid
    LocalTangent,
}

impl Default for ProjectionKind {
    fn default() -> Self {
        ProjectionKind::WebMercator
    }
}

/// GPS join and reprojection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialConfig {
    /// Largest allowed time gap between a sensor row and its GPS sample
    #[serde(default = "default_max_gap")]
    pub max_gap_seconds: f64,

    #[serde(default)]
    pub projection: ProjectionKind,

    #[serde(default = "default_latitude_label")]
    pub latitude_label: String,

    #[serde(default = "default_longitude_label")]
    pub longitude_label: String,
}

fn default_max_gap() -> f64 {
    2.0
}

fn default_latitude_label() -> String {
    "Latitude".to_string()
}

fn default_longitude_label() -> String {
    "Longitude".to_string()
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            max_gap_seconds: default_max_gap(),
            projection: ProjectionKind::default(),
            latitude_label: default_latitude_label(),
            longitude_label: default_longitude_label(),
        }
    }
}

/// Heatmap settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Cell edge length in metres
    #[serde(default = "default_cell_size")]
    pub cell_size_m: u32,

    /// Fill empty cells by inverse-distance weighting
    #[serde(default)]
    pub interpolate: bool,

    /// Neighbour search radius for interpolation, in cells
    #[serde(default = "default_search_radius")]
    pub search_radius_cells: f64,

    /// Distance exponent of the interpolation weights
    #[serde(default = "default_idw_power")]
    pub idw_power: f64,

    /// Column aggregated into the heatmap
    #[serde(default = "default_target")]
    pub target: String,
}

fn default_cell_size() -> u32 {
    10
}

fn default_search_radius() -> f64 {
    3.0
}

fn default_idw_power() -> f64 {
    1.0
}

fn default_target() -> String {
    "1.8 ft (°F)".to_string()
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            cell_size_m: default_cell_size(),
            interpolate: false,
            search_radius_cells: default_search_radius(),
            idw_power: default_idw_power(),
            target: default_target(),
        }
    }
}

/// Which physical quantities a profile or plot covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantitySelection {
    #[serde(default = "default_true")]
    pub temperature: bool,
    #[serde(default)]
    pub ir: bool,
    #[serde(default)]
    pub humidity: bool,
}

fn default_true() -> bool {
    true
}

impl Default for QuantitySelection {
    fn default() -> Self {
        Self {
            temperature: true,
            ir: false,
            humidity: false,
        }
    }
}

impl QuantitySelection {
    pub fn includes(&self, quantity: Quantity) -> bool {
        match quantity {
            Quantity::Temperature => self.temperature,
            Quantity::Ir => self.ir,
            Quantity::Humidity => self.humidity,
        }
    }

    /// Selected quantities in a fixed order.
    pub fn selected(&self) -> Vec<Quantity> {
        [Quantity::Temperature, Quantity::Ir, Quantity::Humidity]
            .into_iter()
            .filter(|q| self.includes(*q))
            .collect()
    }
}

/// Vertical profile settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Top of the profile, in feet
    #[serde(default = "default_max_height")]
    pub max_height_ft: f64,

    #[serde(default)]
    pub quantities: QuantitySelection,

    /// Include the secondary ("b") temperature sensors
    #[serde(default = "default_true")]
    pub include_secondary: bool,

    /// Height assigned to the IR channel, which has none in its label
    #[serde(default)]
    pub ir_height_ft: f64,
}

fn default_max_height() -> f64 {
    10.8
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            max_height_ft: default_max_height(),
            quantities: QuantitySelection::default(),
            include_secondary: true,
            ir_height_ft: 0.0,
        }
    }
}

/// One recorded test run and where its files live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub id: u32,

    /// Folder holding the run's files
    pub folder: PathBuf,

    #[serde(default)]
    pub temperature_file: Option<String>,

    #[serde(default)]
    pub ir_rh_file: Option<String>,

    #[serde(default)]
    pub gps_file: Option<String>,

    /// Cart name ("Cart 1"); resolved from the DAQ serial when absent
    #[serde(default)]
    pub cart: Option<String>,

    #[serde(default)]
    pub route: Option<String>,
}

impl RunConfig {
    pub fn temperature_path(&self) -> Option<PathBuf> {
        self.temperature_file.as_ref().map(|f| self.folder.join(f))
    }

    pub fn ir_rh_path(&self) -> Option<PathBuf> {
        self.ir_rh_file.as_ref().map(|f| self.folder.join(f))
    }

    pub fn gps_path(&self) -> Option<PathBuf> {
        self.gps_file.as_ref().map(|f| self.folder.join(f))
    }
}

/// Main pipeline configuration combining all sub-configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub carts: CartProfiles,

    #[serde(default)]
    pub calibration: CalibrationConfig,

    #[serde(default)]
    pub spatial: SpatialConfig,

    #[serde(default)]
    pub grid: GridConfig,

    #[serde(default)]
    pub profile: ProfileConfig,

    #[serde(default)]
    pub runs: Vec<RunConfig>,
}

impl PipelineConfig {
    /// Load configuration from a YAML file and validate it.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values no stage can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grid.cell_size_m == 0 {
            return Err(ConfigError::Invalid {
                field: "grid.cell_size_m",
                reason: "must be a positive integer".to_string(),
            });
        }
        if !(self.profile.max_height_ft > 0.0) {
            return Err(ConfigError::Invalid {
                field: "profile.max_height_ft",
                reason: format!("must be positive, got {}", self.profile.max_height_ft),
            });
        }
        if !(self.spatial.max_gap_seconds >= 0.0) {
            return Err(ConfigError::Invalid {
                field: "spatial.max_gap_seconds",
                reason: format!("must be non-negative, got {}", self.spatial.max_gap_seconds),
            });
        }
        if !(self.calibration.pairing_gap_seconds >= 0.0) {
            return Err(ConfigError::Invalid {
                field: "calibration.pairing_gap_seconds",
                reason: format!(
                    "must be non-negative, got {}",
                    self.calibration.pairing_gap_seconds
                ),
            });
        }
        if self.calibration.ir.coefficients.is_empty() {
            return Err(ConfigError::Invalid {
                field: "calibration.ir.coefficients",
                reason: "at least one coefficient is required".to_string(),
            });
        }
        if self.calibration.humidity.slope == 0.0 || self.calibration.humidity.supply_voltage == 0.0 {
            return Err(ConfigError::Invalid {
                field: "calibration.humidity",
                reason: "slope and supply_voltage must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Look up a run by id.
    pub fn run(&self, id: u32) -> Option<&RunConfig> {
        self.runs.iter().find(|r| r.id == id)
    }
}

/// Convert a duration in (possibly fractional) seconds to a chrono duration.
pub fn seconds_to_duration(seconds: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((seconds * 1000.0).round() as i64)
}
