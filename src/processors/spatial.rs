//! GPS join and planar reprojection.
//!
//! Each sensor row is paired with the GPS sample closest in time, provided
//! the gap does not exceed the configured limit. Matched rows are projected
//! from WGS84 degrees to planar metres so the grid aggregator can bin them by
//! distance. Rows without a match keep no position; they stay in the dataset
//! for time-series use but never enter a heatmap.

use std::f64::consts::{FRAC_PI_4, PI};

use chrono::NaiveDateTime;
use log::{debug, info, warn};

use crate::config::{seconds_to_duration, ProjectionKind, SpatialConfig};
use crate::core::table::{nearest_timestamp, TimeSeriesTable};
use crate::error::{Outcome, PipelineError, PipelineWarning, Result};

/// WGS84 semi-major axis in metres (spherical Web Mercator radius).
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Web Mercator is undefined at the poles; latitudes are clamped here.
const MERCATOR_MAX_LAT: f64 = 85.051_128_78;

/// A point in projected metres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanarPoint {
    pub x: f64,
    pub y: f64,
}

/// Axis-aligned planar extent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanarBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl PlanarBounds {
    /// Bounds of a set of points, `None` if empty.
    pub fn from_points<I: IntoIterator<Item = PlanarPoint>>(points: I) -> Option<Self> {
        points.into_iter().fold(None, |acc, p| {
            Some(match acc {
                None => PlanarBounds {
                    min_x: p.x,
                    min_y: p.y,
                    max_x: p.x,
                    max_y: p.y,
                },
                Some(b) => PlanarBounds {
                    min_x: b.min_x.min(p.x),
                    min_y: b.min_y.min(p.y),
                    max_x: b.max_x.max(p.x),
                    max_y: b.max_y.max(p.y),
                },
            })
        })
    }

    /// Inclusive containment test.
    pub fn contains(&self, p: PlanarPoint) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Geographic to planar transform.
pub trait Projection {
    fn project(&self, latitude: f64, longitude: f64) -> PlanarPoint;

    /// Planar units per ground metre at `latitude`.
    fn scale_factor(&self, latitude: f64) -> f64;

    /// Short identifier of the coordinate reference.
    fn name(&self) -> &'static str;
}

/// Spherical Web Mercator (EPSG:3857).
#[derive(Debug, Clone, Copy, Default)]
pub struct WebMercator;

impl Projection for WebMercator {
    fn project(&self, latitude: f64, longitude: f64) -> PlanarPoint {
        let lat = latitude.clamp(-MERCATOR_MAX_LAT, MERCATOR_MAX_LAT).to_radians();
        PlanarPoint {
            x: EARTH_RADIUS_M * longitude.to_radians(),
            y: EARTH_RADIUS_M * (FRAC_PI_4 + lat / 2.0).tan().ln(),
        }
    }

    fn scale_factor(&self, latitude: f64) -> f64 {
        1.0 / latitude
            .clamp(-MERCATOR_MAX_LAT, MERCATOR_MAX_LAT)
            .to_radians()
            .cos()
    }

    fn name(&self) -> &'static str {
        "EPSG:3857"
    }
}

/// Equirectangular projection about a fixed origin. Accurate to well under a
/// metre over the few kilometres a single run covers.
#[derive(Debug, Clone, Copy)]
pub struct LocalTangent {
    pub origin_latitude: f64,
    pub origin_longitude: f64,
    cos_origin: f64,
}

impl LocalTangent {
    pub fn new(origin_latitude: f64, origin_longitude: f64) -> Self {
        Self {
            origin_latitude,
            origin_longitude,
            cos_origin: origin_latitude.to_radians().cos(),
        }
    }
}

impl Projection for LocalTangent {
    fn project(&self, latitude: f64, longitude: f64) -> PlanarPoint {
        let d_lon = wrap_degrees(longitude - self.origin_longitude);
        PlanarPoint {
            x: EARTH_RADIUS_M * d_lon.to_radians() * self.cos_origin,
            y: EARTH_RADIUS_M * (latitude - self.origin_latitude).to_radians(),
        }
    }

    fn scale_factor(&self, _latitude: f64) -> f64 {
        1.0
    }

    fn name(&self) -> &'static str {
        "local-tangent"
    }
}

/// Wrap a longitude difference into [-180, 180).
fn wrap_degrees(d: f64) -> f64 {
    let r = (d.to_radians() + PI).rem_euclid(2.0 * PI) - PI;
    r.to_degrees()
}

/// GPS samples sorted by time.
#[derive(Debug, Clone, Default)]
pub struct PositionTrack {
    timestamps: Vec<NaiveDateTime>,
    latitudes: Vec<f64>,
    longitudes: Vec<f64>,
}

impl PositionTrack {
    /// Extract the track from a table with latitude/longitude columns.
    ///
    /// Rows with a missing or out-of-range coordinate are skipped.
    pub fn from_table(table: &TimeSeriesTable, latitude_label: &str, longitude_label: &str) -> Result<Self> {
        let lats = table
            .column(latitude_label)
            .ok_or_else(|| PipelineError::MissingColumn(latitude_label.to_string()))?;
        let lons = table
            .column(longitude_label)
            .ok_or_else(|| PipelineError::MissingColumn(longitude_label.to_string()))?;

        let mut track = PositionTrack::default();
        let mut skipped = 0usize;
        for ((ts, lat), lon) in table.timestamps().iter().zip(lats).zip(lons) {
            match (lat, lon) {
                (Some(lat), Some(lon)) if lat.abs() <= 90.0 && lon.abs() <= 180.0 => {
                    track.timestamps.push(*ts);
                    track.latitudes.push(*lat);
                    track.longitudes.push(*lon);
                }
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!("Skipped {} GPS rows without a valid fix", skipped);
        }
        Ok(track)
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Mean latitude/longitude of the track.
    pub fn centroid(&self) -> Option<(f64, f64)> {
        if self.is_empty() {
            return None;
        }
        let n = self.len() as f64;
        Some((
            self.latitudes.iter().sum::<f64>() / n,
            self.longitudes.iter().sum::<f64>() / n,
        ))
    }
}

/// Position attached to one dataset row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    /// Projected coordinates in metres
    pub planar: PlanarPoint,
}

/// A dataset whose rows may carry a projected position.
#[derive(Debug, Clone)]
pub struct GeoEnabledDataset {
    table: TimeSeriesTable,
    positions: Vec<Option<GeoPosition>>,
    crs: &'static str,
    track_bounds: Option<PlanarBounds>,
    scale_factor: f64,
}

impl GeoEnabledDataset {
    /// Assemble a dataset from already-projected positions.
    pub fn new(
        table: TimeSeriesTable,
        positions: Vec<Option<GeoPosition>>,
        crs: &'static str,
    ) -> Result<Self> {
        if positions.len() != table.len() {
            return Err(PipelineError::ShapeMismatch {
                column: "position".to_string(),
                expected: table.len(),
                found: positions.len(),
            });
        }
        let track_bounds = PlanarBounds::from_points(positions.iter().flatten().map(|p| p.planar));
        Ok(Self {
            table,
            positions,
            crs,
            track_bounds,
            scale_factor: 1.0,
        })
    }

    /// Set the planar-units-per-metre factor of the positions' CRS.
    pub fn with_scale_factor(mut self, scale_factor: f64) -> Self {
        self.scale_factor = scale_factor;
        self
    }

    pub fn table(&self) -> &TimeSeriesTable {
        &self.table
    }

    pub fn positions(&self) -> &[Option<GeoPosition>] {
        &self.positions
    }

    pub fn position(&self, row: usize) -> Option<&GeoPosition> {
        self.positions.get(row).and_then(Option::as_ref)
    }

    /// Coordinate reference of the planar positions.
    pub fn crs(&self) -> &'static str {
        self.crs
    }

    /// Planar units per ground metre over the track (1.0 for metric CRSs).
    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    /// Planar extent of the position track the rows were matched against.
    pub fn track_bounds(&self) -> Option<PlanarBounds> {
        self.track_bounds
    }

    /// Rows that carry a position.
    pub fn positioned_rows(&self) -> impl Iterator<Item = (usize, &GeoPosition)> + '_ {
        self.positions
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.as_ref().map(|p| (i, p)))
    }

    pub fn positioned_count(&self) -> usize {
        self.positions.iter().filter(|p| p.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Build the projection selected in the configuration for a given track.
pub fn projection_for(kind: ProjectionKind, track: &PositionTrack) -> Result<Box<dyn Projection + Send + Sync>> {
    match kind {
        ProjectionKind::WebMercator => Ok(Box::new(WebMercator)),
        ProjectionKind::LocalTangent => {
            let (lat, lon) = track.centroid().ok_or(PipelineError::NoPositionData)?;
            Ok(Box::new(LocalTangent::new(lat, lon)))
        }
    }
}

/// Attach projected GPS positions to every row of `dataset`.
pub fn spatially_enable(
    dataset: &TimeSeriesTable,
    track: &PositionTrack,
    config: &SpatialConfig,
) -> Result<Outcome<GeoEnabledDataset>> {
    if track.is_empty() {
        return Err(PipelineError::NoPositionData);
    }

    let projection = projection_for(config.projection, track)?;
    let max_gap = seconds_to_duration(config.max_gap_seconds);

    let projected: Vec<PlanarPoint> = track
        .latitudes
        .iter()
        .zip(track.longitudes.iter())
        .map(|(&lat, &lon)| projection.project(lat, lon))
        .collect();
    let track_bounds = PlanarBounds::from_points(projected.iter().copied());
    let scale_factor = track
        .centroid()
        .map_or(1.0, |(lat, _)| projection.scale_factor(lat));

    let positions: Vec<Option<GeoPosition>> = dataset
        .timestamps()
        .iter()
        .map(|&ts| {
            nearest_timestamp(&track.timestamps, ts, max_gap).map(|i| GeoPosition {
                latitude: track.latitudes[i],
                longitude: track.longitudes[i],
                planar: projected[i],
            })
        })
        .collect();

    debug_assert!(positions
        .iter()
        .flatten()
        .all(|p| track_bounds.map_or(false, |b| b.contains(p.planar))));

    let unmatched = positions.iter().filter(|p| p.is_none()).count();
    info!(
        "Spatially enabled {} of {} rows ({})",
        dataset.len() - unmatched,
        dataset.len(),
        projection.name()
    );

    let geo = GeoEnabledDataset {
        table: dataset.clone(),
        positions,
        crs: projection.name(),
        track_bounds,
        scale_factor,
    };

    if unmatched > 0 {
        warn!(
            "{} rows have no GPS sample within {} s",
            unmatched, config.max_gap_seconds
        );
        Ok(Outcome::with_warnings(
            geo,
            vec![PipelineWarning::UnmatchedPositions {
                rows: unmatched,
                total: dataset.len(),
            }],
        ))
    } else {
        Ok(Outcome::clean(geo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::table::test_support::{some, ts};
    use crate::core::table::Column;

    fn gps_table() -> TimeSeriesTable {
        TimeSeriesTable::new(
            vec![ts(0), ts(10), ts(20)],
            vec![
                Column::new("Latitude", some(&[40.0, 40.001, 40.002])),
                Column::new("Longitude", some(&[-83.0, -83.0, -83.001])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_web_mercator_known_values() {
        let p = WebMercator.project(0.0, 0.0);
        assert!(p.x.abs() < 1e-9 && p.y.abs() < 1e-9);

        let p = WebMercator.project(0.0, 180.0);
        assert!((p.x - 20_037_508.342_789_244).abs() < 1e-3);

        // y grows monotonically with latitude
        assert!(WebMercator.project(40.001, 0.0).y > WebMercator.project(40.0, 0.0).y);
    }

    #[test]
    fn test_local_tangent_scale() {
        let proj = LocalTangent::new(40.0, -83.0);
        let origin = proj.project(40.0, -83.0);
        assert!(origin.x.abs() < 1e-9 && origin.y.abs() < 1e-9);

        let north = proj.project(40.001, -83.0);
        assert!((north.y - 111.32).abs() < 0.1);

        let east = proj.project(40.0, -82.999);
        assert!((east.x - 111.32 * 40f64.to_radians().cos()).abs() < 0.1);
    }

    #[test]
    fn test_position_track_skips_invalid_fixes() {
        let table = TimeSeriesTable::new(
            vec![ts(0), ts(1), ts(2)],
            vec![
                Column::new("Latitude", vec![Some(40.0), None, Some(95.0)]),
                Column::new("Longitude", some(&[-83.0, -83.0, -83.0])),
            ],
        )
        .unwrap();
        let track = PositionTrack::from_table(&table, "Latitude", "Longitude").unwrap();
        assert_eq!(track.len(), 1);
    }

    #[test]
    fn test_position_track_missing_column() {
        let table = TimeSeriesTable::new(vec![ts(0)], vec![Column::new("Latitude", some(&[40.0]))])
            .unwrap();
        let err = PositionTrack::from_table(&table, "Latitude", "Longitude").unwrap_err();
        assert_eq!(err, PipelineError::MissingColumn("Longitude".to_string()));
    }

    #[test]
    fn test_rows_beyond_gap_are_left_unpositioned() {
        let track = PositionTrack::from_table(&gps_table(), "Latitude", "Longitude").unwrap();
        let sensors = TimeSeriesTable::new(
            vec![ts(1), ts(5), ts(19), ts(60)],
            vec![Column::new("1.8 ft (°F)", some(&[70.0, 71.0, 72.0, 73.0]))],
        )
        .unwrap();

        let config = SpatialConfig::default();
        let outcome = spatially_enable(&sensors, &track, &config).unwrap();
        let geo = outcome.value;

        assert_eq!(geo.len(), 4);
        assert_eq!(geo.position(0).unwrap().latitude, 40.0);
        assert!(geo.position(1).is_none());
        assert_eq!(geo.position(2).unwrap().latitude, 40.002);
        assert!(geo.position(3).is_none());
        assert_eq!(geo.positioned_count(), 2);
        // unmatched rows keep their sensor data
        assert_eq!(geo.table().value(3, "1.8 ft (°F)"), Some(73.0));
        assert_eq!(
            outcome.warnings,
            vec![PipelineWarning::UnmatchedPositions { rows: 2, total: 4 }]
        );
    }

    #[test]
    fn test_positions_lie_within_track_bounds() {
        let track = PositionTrack::from_table(&gps_table(), "Latitude", "Longitude").unwrap();
        let sensors = TimeSeriesTable::new((0..21).map(ts).collect(), vec![]).unwrap();
        let config = SpatialConfig {
            max_gap_seconds: 5.0,
            projection: ProjectionKind::LocalTangent,
            ..SpatialConfig::default()
        };

        let geo = spatially_enable(&sensors, &track, &config).unwrap().value;
        let bounds = geo.track_bounds().unwrap();
        assert_eq!(geo.crs(), "local-tangent");
        assert_eq!(geo.positioned_count(), 21);
        assert!(geo.positioned_rows().all(|(_, p)| bounds.contains(p.planar)));
    }

    #[test]
    fn test_empty_track_is_fatal() {
        let sensors = TimeSeriesTable::new(vec![ts(0)], vec![]).unwrap();
        let err = spatially_enable(&sensors, &PositionTrack::default(), &SpatialConfig::default())
            .unwrap_err();
        assert_eq!(err, PipelineError::NoPositionData);
    }
}
