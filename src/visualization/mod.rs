//! PNG rendering of time series, heatmaps and vertical profiles with plotters.
//!
//! Undefined heatmap cells are not drawn at all, so they show the background
//! rather than a colour that could be read as a value.

use std::fs;
use std::path::Path;

use chrono::{Duration, NaiveDateTime};
use plotters::prelude::*;
use plotters::series::DashedLineSeries;
use plotters_bitmap::BitMapBackend;
use thiserror::Error;

use crate::config::QuantitySelection;
use crate::core::table::TimeSeriesTable;
use crate::processors::grid::Grid;
use crate::processors::profile::{classify_label, is_secondary, parse_height, Quantity, VerticalProfile};

/// Errors that can occur during visualization.
#[derive(Error, Debug)]
pub enum VisualizationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Plotting error: {0}")]
    PlottingError(String),

    #[error("Nothing to plot: {0}")]
    NothingToPlot(String),
}

/// Result type for visualization operations.
pub type Result<T> = std::result::Result<T, VisualizationError>;

/// Default plot width in pixels.
const DEFAULT_WIDTH: u32 = 1600;

/// Default plot height in pixels.
const DEFAULT_HEIGHT: u32 = 1200;

/// Width of the time-series canvas; runs are long and thin.
const TIMESERIES_WIDTH: u32 = 2400;

/// Width reserved for the heatmap colour bar.
const COLOR_BAR_WIDTH: u32 = 180;

const COLOR_BAR_STEPS: usize = 100;

const CAPTION_FONT: (&str, u32) = ("sans-serif", 36);
const AXIS_FONT: (&str, u32) = ("sans-serif", 24);

/// Cold-to-hot colour ramp for heatmap values.
const HEAT_STOPS: &[(u8, u8, u8)] = &[
    (49, 54, 149),   // Dark blue
    (69, 117, 180),  // Blue
    (171, 217, 233), // Light blue
    (255, 255, 191), // Pale yellow
    (253, 174, 97),  // Orange
    (215, 48, 39),   // Red
    (165, 0, 38),    // Dark red
];

/// Primary sensor colours, lowest sensor first.
const SENSOR_COLORS: &[RGBColor] = &[
    RGBColor(128, 0, 0),     // Maroon
    RGBColor(255, 0, 0),     // Red
    RGBColor(255, 99, 71),   // Tomato
    RGBColor(30, 144, 255),  // Dodger blue
    RGBColor(65, 105, 225),  // Royal blue
    RGBColor(0, 0, 128),     // Navy
];

const HUMIDITY_COLORS: &[RGBColor] = &[
    RGBColor(0, 100, 0),
    RGBColor(34, 139, 34),
    RGBColor(60, 179, 113),
    RGBColor(102, 205, 170),
];

/// Line colour per profile quantity.
fn quantity_color(quantity: Quantity) -> RGBColor {
    match quantity {
        Quantity::Temperature => RGBColor(215, 48, 39),
        Quantity::Ir => RGBColor(255, 127, 0),
        Quantity::Humidity => RGBColor(55, 126, 184),
    }
}

/// Map `t` in [0, 1] onto the heat ramp.
pub fn heat_color(t: f64) -> RGBColor {
    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
    let scaled = t * (HEAT_STOPS.len() - 1) as f64;
    let i = (scaled.floor() as usize).min(HEAT_STOPS.len() - 2);
    let f = scaled - i as f64;
    let (a, b) = (HEAT_STOPS[i], HEAT_STOPS[i + 1]);
    let lerp = |x: u8, y: u8| (x as f64 + (y as f64 - x as f64) * f).round() as u8;
    RGBColor(lerp(a.0, b.0), lerp(a.1, b.1), lerp(a.2, b.2))
}

fn plot_err<E: std::fmt::Display>(e: E) -> VisualizationError {
    VisualizationError::PlottingError(e.to_string())
}

/// Creates the parent directory of an output image if needed.
fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Options for [`plot_timeseries`].
#[derive(Debug, Clone)]
pub struct TimeSeriesOptions {
    pub quantities: QuantitySelection,
    /// Draw the secondary ("b") sensors, dashed in their primary's colour
    pub include_secondary: bool,
    /// Fixed y-axis limits; fitted to the data when `None`
    pub y_range: Option<(f64, f64)>,
    /// Inclusive time window; the whole table when `None`
    pub window: Option<(NaiveDateTime, NaiveDateTime)>,
    pub title: String,
}

impl Default for TimeSeriesOptions {
    fn default() -> Self {
        Self {
            quantities: QuantitySelection::default(),
            include_secondary: true,
            y_range: None,
            window: None,
            title: "Time series".to_string(),
        }
    }
}

/// How one column is drawn in a time series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesStyle {
    pub label: String,
    pub color: RGBColor,
    pub dashed: bool,
}

/// Pick and style the columns a time series shows.
///
/// Primary temperature sensors come first in table order, then the secondary
/// sensors (dashed, coloured like the primary at the same height), then IR in
/// black, then humidity.
pub fn timeseries_series(table: &TimeSeriesTable, options: &TimeSeriesOptions) -> Vec<SeriesStyle> {
    let mut series = Vec::new();
    let mut primaries: Vec<(Option<f64>, RGBColor)> = Vec::new();
    let mut secondaries = Vec::new();
    let mut ir = Vec::new();
    let mut humidity = Vec::new();

    for label in table.labels() {
        match classify_label(label) {
            Some(Quantity::Temperature) if options.quantities.temperature => {
                if is_secondary(label) {
                    if options.include_secondary {
                        secondaries.push(label);
                    }
                } else {
                    let color = SENSOR_COLORS
                        .get(primaries.len())
                        .copied()
                        .unwrap_or(BLACK);
                    primaries.push((parse_height(label), color));
                    series.push(SeriesStyle {
                        label: label.to_string(),
                        color,
                        dashed: false,
                    });
                }
            }
            Some(Quantity::Ir) if options.quantities.ir => ir.push(label),
            Some(Quantity::Humidity) if options.quantities.humidity => humidity.push(label),
            _ => {}
        }
    }

    for label in secondaries {
        let height = parse_height(label);
        let color = primaries
            .iter()
            .find(|(h, _)| *h == height)
            .map_or(BLACK, |(_, c)| *c);
        series.push(SeriesStyle {
            label: label.to_string(),
            color,
            dashed: true,
        });
    }
    series.extend(ir.into_iter().map(|label| SeriesStyle {
        label: label.to_string(),
        color: BLACK,
        dashed: false,
    }));
    series.extend(humidity.into_iter().enumerate().map(|(i, label)| SeriesStyle {
        label: label.to_string(),
        color: HUMIDITY_COLORS[i % HUMIDITY_COLORS.len()],
        dashed: false,
    }));
    series
}

fn timeseries_axis_label(quantities: &QuantitySelection) -> &'static str {
    let temperature = quantities.temperature || quantities.ir;
    match (temperature, quantities.humidity) {
        (true, true) => "Temperature (°F) / Relative Humidity (%)",
        (false, true) => "Relative Humidity (%)",
        _ => "Temperature (°F)",
    }
}

/// Split a column into runs of consecutive present values, as
/// (seconds since `start`, value) points.
fn present_segments(
    timestamps: &[NaiveDateTime],
    values: &[Option<f64>],
    start: NaiveDateTime,
) -> Vec<Vec<(f64, f64)>> {
    let mut segments = Vec::new();
    let mut segment = Vec::new();
    for (ts, value) in timestamps.iter().zip(values) {
        match value {
            Some(v) => segment.push(((*ts - start).num_milliseconds() as f64 / 1000.0, *v)),
            None if !segment.is_empty() => segments.push(std::mem::take(&mut segment)),
            None => {}
        }
    }
    if !segment.is_empty() {
        segments.push(segment);
    }
    segments
}

/// Render the selected channels against time.
///
/// Missing values break a line instead of being bridged.
pub fn plot_timeseries(output_path: &Path, table: &TimeSeriesTable, options: &TimeSeriesOptions) -> Result<()> {
    let windowed;
    let table = match options.window {
        Some((start, end)) => {
            windowed = table.between(start, end);
            &windowed
        }
        None => table,
    };

    let (Some(&start), Some(&end)) = (table.timestamps().first(), table.timestamps().last()) else {
        return Err(VisualizationError::NothingToPlot("time series: no rows in range".to_string()));
    };

    let lines: Vec<(SeriesStyle, Vec<Vec<(f64, f64)>>)> = timeseries_series(table, options)
        .into_iter()
        .filter_map(|style| {
            let values = table.column(&style.label)?;
            let segments = present_segments(table.timestamps(), values, start);
            (!segments.is_empty()).then_some((style, segments))
        })
        .collect();
    if lines.is_empty() {
        return Err(VisualizationError::NothingToPlot(
            "time series: no selected channel has values".to_string(),
        ));
    }

    let (y_min, y_max) = match options.y_range {
        Some(range) => range,
        None => {
            let (lo, hi) = lines
                .iter()
                .flat_map(|(_, segs)| segs.iter().flatten())
                .fold((f64::MAX, f64::MIN), |(lo, hi), (_, v)| (lo.min(*v), hi.max(*v)));
            let pad = if (hi - lo).abs() < f64::EPSILON { 1.0 } else { (hi - lo) * 0.05 };
            (lo - pad, hi + pad)
        }
    };
    let span = ((end - start).num_milliseconds() as f64 / 1000.0).max(1.0);

    ensure_parent_dir(output_path)?;
    let root = BitMapBackend::new(output_path, (TIMESERIES_WIDTH, DEFAULT_HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(&options.title, CAPTION_FONT)
        .margin(20)
        .x_label_area_size(60)
        .y_label_area_size(90)
        .build_cartesian_2d(0.0..span, y_min..y_max)
        .map_err(plot_err)?;

    let time_label = |x: &f64| {
        (start + Duration::milliseconds((x * 1000.0).round() as i64))
            .format("%H:%M:%S")
            .to_string()
    };
    chart
        .configure_mesh()
        .x_desc("Time")
        .y_desc(timeseries_axis_label(&options.quantities))
        .x_label_formatter(&time_label)
        .axis_desc_style(AXIS_FONT)
        .draw()
        .map_err(plot_err)?;

    for (style, segments) in &lines {
        let line_style = style.color.stroke_width(2);
        for (i, seg) in segments.iter().enumerate() {
            let drawn = if style.dashed {
                chart.draw_series(DashedLineSeries::new(seg.iter().copied(), 10u32, 6u32, line_style))
            } else {
                chart.draw_series(LineSeries::new(seg.iter().copied(), line_style))
            };
            let anno = drawn.map_err(plot_err)?;

            if i == 0 {
                let color = style.color;
                anno.label(style.label.as_str())
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2)));
            }
        }
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()
        .map_err(plot_err)?;

    root.present().map_err(plot_err)?;
    Ok(())
}

/// Render a heatmap grid as coloured cells in planar coordinates, with a
/// colour bar on the right.
///
/// Interpolated cells are drawn like observed ones; a thin outline marks the
/// observed cells.
pub fn plot_heatmap(output_path: &Path, grid: &Grid) -> Result<()> {
    let (lo, hi) = grid
        .value_range()
        .ok_or_else(|| VisualizationError::NothingToPlot(format!("heatmap '{}'", grid.column())))?;
    let span = if (hi - lo).abs() < f64::EPSILON { 1.0 } else { hi - lo };

    let origin = grid.origin();
    let x_max = origin.x + grid.cols() as f64 * grid.cell_size();
    let y_max = origin.y + grid.rows() as f64 * grid.cell_size();
    let pad = grid.cell_size() * 0.5;

    ensure_parent_dir(output_path)?;
    let root = BitMapBackend::new(output_path, (DEFAULT_WIDTH, DEFAULT_HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let (map_area, bar_area) = root.split_horizontally(DEFAULT_WIDTH - COLOR_BAR_WIDTH);

    let mut chart = ChartBuilder::on(&map_area)
        .caption(
            format!("{} ({} m cells, {})", grid.column(), grid.cell_size_m(), grid.crs()),
            CAPTION_FONT,
        )
        .margin(10)
        .x_label_area_size(60)
        .y_label_area_size(100)
        .build_cartesian_2d((origin.x - pad)..(x_max + pad), (origin.y - pad)..(y_max + pad))
        .map_err(plot_err)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .disable_y_mesh()
        .x_desc("Easting")
        .y_desc("Northing")
        .axis_desc_style(AXIS_FONT)
        .draw()
        .map_err(plot_err)?;

    let mut cells = Vec::with_capacity(grid.defined_cells());
    for row in 0..grid.rows() {
        for col in 0..grid.cols() {
            if let Some(cell) = grid.cell(col, row) {
                cells.push((grid.cell_bounds(col, row), *cell));
            }
        }
    }

    chart
        .draw_series(cells.iter().map(|(b, cell)| {
            let color = heat_color((cell.value - lo) / span);
            Rectangle::new([(b.min_x, b.min_y), (b.max_x, b.max_y)], color.filled())
        }))
        .map_err(plot_err)?;

    chart
        .draw_series(
            cells
                .iter()
                .filter(|(_, cell)| !cell.interpolated)
                .map(|(b, _)| Rectangle::new([(b.min_x, b.min_y), (b.max_x, b.max_y)], BLACK.mix(0.25))),
        )
        .map_err(plot_err)?;

    // Colour bar
    let mut bar = ChartBuilder::on(&bar_area)
        .margin(10)
        .margin_top(60)
        .x_label_area_size(60)
        .y_label_area_size(80)
        .build_cartesian_2d(0.0..1.0, lo..(lo + span))
        .map_err(plot_err)?;

    bar.configure_mesh()
        .disable_x_mesh()
        .disable_y_mesh()
        .disable_x_axis()
        .y_desc(grid.column())
        .draw()
        .map_err(plot_err)?;

    let step = span / COLOR_BAR_STEPS as f64;
    bar.draw_series((0..COLOR_BAR_STEPS).map(|i| {
        let v0 = lo + i as f64 * step;
        let color = heat_color(i as f64 / (COLOR_BAR_STEPS - 1) as f64);
        Rectangle::new([(0.0, v0), (1.0, v0 + step)], color.filled())
    }))
    .map_err(plot_err)?;

    root.present().map_err(plot_err)?;
    Ok(())
}

/// Render vertical profiles as value-versus-height lines, one per quantity.
///
/// Bands without observations break the line instead of being drawn at zero.
pub fn plot_profiles(output_path: &Path, profiles: &[VerticalProfile]) -> Result<()> {
    let points: Vec<(f64, f64)> = profiles
        .iter()
        .flat_map(|p| p.bands.iter().filter_map(|b| b.mean.map(|m| (m, b.midpoint()))))
        .collect();
    if points.is_empty() {
        return Err(VisualizationError::NothingToPlot("vertical profile".to_string()));
    }

    let (mut v_min, mut v_max) = points
        .iter()
        .fold((f64::MAX, f64::MIN), |(lo, hi), (v, _)| (lo.min(*v), hi.max(*v)));
    if (v_max - v_min).abs() < f64::EPSILON {
        v_min -= 1.0;
        v_max += 1.0;
    }
    let v_pad = (v_max - v_min) * 0.05;
    let h_max = profiles.iter().map(|p| p.max_height_ft).fold(0.0, f64::max);

    let unit = match profiles.first().map(|p| p.quantity.unit()) {
        Some(u) if profiles.iter().all(|p| p.quantity.unit() == u) => u,
        _ => "mixed units",
    };

    ensure_parent_dir(output_path)?;
    let root = BitMapBackend::new(output_path, (DEFAULT_WIDTH, DEFAULT_HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Vertical profile", CAPTION_FONT)
        .margin(10)
        .x_label_area_size(60)
        .y_label_area_size(80)
        .build_cartesian_2d((v_min - v_pad)..(v_max + v_pad), 0.0..h_max)
        .map_err(plot_err)?;

    chart
        .configure_mesh()
        .x_desc(format!("Band mean ({})", unit))
        .y_desc("Height (ft)")
        .axis_desc_style(AXIS_FONT)
        .draw()
        .map_err(plot_err)?;

    for profile in profiles {
        let color = quantity_color(profile.quantity);

        // Split at empty bands
        let mut segment: Vec<(f64, f64)> = Vec::new();
        let mut segments = Vec::new();
        for band in &profile.bands {
            match band.mean {
                Some(m) => segment.push((m, band.midpoint())),
                None if !segment.is_empty() => segments.push(std::mem::take(&mut segment)),
                None => {}
            }
        }
        if !segment.is_empty() {
            segments.push(segment);
        }

        for (i, seg) in segments.iter().enumerate() {
            let anno = chart
                .draw_series(LineSeries::new(seg.iter().copied(), color.stroke_width(2)))
                .map_err(plot_err)?;
            if i == 0 {
                anno.label(profile.quantity.to_string())
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2)));
            }
            chart
                .draw_series(seg.iter().map(|&(v, h)| Circle::new((v, h), 4, color.filled())))
                .map_err(plot_err)?;
        }
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()
        .map_err(plot_err)?;

    root.present().map_err(plot_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::table::test_support::{some, ts};
    use crate::core::table::Column;

    fn mast_table() -> TimeSeriesTable {
        TimeSeriesTable::new(
            (0..6).map(ts).collect(),
            vec![
                Column::new("0.6 ft (°C)", some(&[15.0, 15.1, 15.2, 15.3, 15.4, 15.5])),
                Column::new("0.6 ft (°F)", some(&[59.0, 59.2, 59.4, 59.5, 59.7, 59.9])),
                Column::new("3.6 ft (°F)", vec![Some(60.0), None, Some(60.4), Some(60.5), None, Some(60.9)]),
                Column::new("3.6 ft b (°F)", some(&[60.1, 60.2, 60.3, 60.4, 60.5, 60.6])),
                Column::new("IR (°F)", some(&[70.0, 70.5, 71.0, 71.5, 72.0, 72.5])),
                Column::new("RH 1.8 ft (%)", some(&[40.0, 41.0, 42.0, 43.0, 44.0, 45.0])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_heat_color_endpoints() {
        let cold = heat_color(0.0);
        let hot = heat_color(1.0);
        assert_eq!((cold.0, cold.1, cold.2), HEAT_STOPS[0]);
        assert_eq!((hot.0, hot.1, hot.2), HEAT_STOPS[HEAT_STOPS.len() - 1]);
    }

    #[test]
    fn test_heat_color_clamps() {
        let below = heat_color(-3.0);
        let above = heat_color(7.0);
        let nan = heat_color(f64::NAN);
        assert_eq!((below.0, below.1, below.2), HEAT_STOPS[0]);
        assert_eq!((above.0, above.1, above.2), HEAT_STOPS[HEAT_STOPS.len() - 1]);
        assert_eq!((nan.0, nan.1, nan.2), HEAT_STOPS[0]);
    }

    #[test]
    fn test_plot_profiles_rejects_empty() {
        let dir = tempfile::tempdir().unwrap();
        let err = plot_profiles(&dir.path().join("p.png"), &[]).unwrap_err();
        assert!(matches!(err, VisualizationError::NothingToPlot(_)));
    }

    #[test]
    fn test_timeseries_series_selection() {
        let table = mast_table();

        let default = timeseries_series(&table, &TimeSeriesOptions::default());
        let labels: Vec<&str> = default.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["0.6 ft (°F)", "3.6 ft (°F)", "3.6 ft b (°F)"]);
        // secondary sensor is dashed in its primary's colour
        assert!(default[2].dashed);
        assert_eq!(default[2].color, default[1].color);
        assert!(!default[0].dashed);

        let options = TimeSeriesOptions {
            quantities: QuantitySelection {
                temperature: true,
                ir: true,
                humidity: true,
            },
            include_secondary: false,
            ..TimeSeriesOptions::default()
        };
        let labels: Vec<String> = timeseries_series(&table, &options)
            .into_iter()
            .map(|s| s.label)
            .collect();
        assert_eq!(labels, vec!["0.6 ft (°F)", "3.6 ft (°F)", "IR (°F)", "RH 1.8 ft (%)"]);
    }

    #[test]
    fn test_present_segments_break_at_missing() {
        let table = mast_table();
        let segments = present_segments(table.timestamps(), table.column("3.6 ft (°F)").unwrap(), ts(0));
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], vec![(0.0, 60.0)]);
        assert_eq!(segments[1], vec![(2.0, 60.4), (3.0, 60.5)]);
        assert_eq!(segments[2], vec![(5.0, 60.9)]);
    }

    #[test]
    fn test_plot_timeseries_rejects_empty_window() {
        let dir = tempfile::tempdir().unwrap();
        let options = TimeSeriesOptions {
            window: Some((ts(100), ts(200))),
            ..TimeSeriesOptions::default()
        };
        let err = plot_timeseries(&dir.path().join("ts.png"), &mast_table(), &options).unwrap_err();
        assert!(matches!(err, VisualizationError::NothingToPlot(_)));
    }

    #[test]
    fn test_plot_timeseries_rejects_unselected_channels() {
        let dir = tempfile::tempdir().unwrap();
        let table = TimeSeriesTable::new(vec![ts(0)], vec![Column::new("IR (°F)", some(&[70.0]))]).unwrap();
        let err = plot_timeseries(&dir.path().join("ts.png"), &table, &TimeSeriesOptions::default()).unwrap_err();
        assert!(matches!(err, VisualizationError::NothingToPlot(_)));
    }

    #[test]
    fn test_ensure_parent_dir_creates_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run1").join("plots").join("heatmap.png");
        ensure_parent_dir(&path).unwrap();
        assert!(path.parent().unwrap().is_dir());
    }
}
