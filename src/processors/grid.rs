//! Spatial heatmap aggregation.
//!
//! Positioned observations are binned into square cells laid out from the
//! south-west corner of their planar extent. A cell `(col, row)` covers the
//! half-open range `[x0 + col*size, x0 + (col+1)*size) × [y0 + row*size,
//! y0 + (row+1)*size)`, so the tiling depends only on the data extent and
//! the cell size. The cell size is given in ground metres and converted to
//! planar units with the dataset's scale factor, so Web Mercator grids cover
//! the same ground as metric ones.
//!
//! Empty cells stay undefined unless interpolation is requested, in which
//! case they receive an inverse-distance-weighted estimate from non-empty
//! cell centres. Neighbours are found with a `kiddo` KD-tree and the
//! per-cell fills run in parallel with Rayon; every fill is independent, so
//! the result does not depend on scheduling.

use kiddo::{ImmutableKdTree, SquaredEuclidean};
use log::{debug, info};
use rayon::prelude::*;

use crate::config::GridConfig;
use crate::error::{PipelineError, Result};
use crate::processors::spatial::{GeoEnabledDataset, PlanarBounds, PlanarPoint};

/// Upper bound on the number of cells in one grid.
pub const MAX_GRID_CELLS: usize = 16_000_000;

/// Relative tolerance for offsets that land on a cell edge after rounding.
const EDGE_TOLERANCE: f64 = 1e-9;

/// Cell index of a planar offset from the grid origin.
fn cell_index(offset: f64, size: f64) -> usize {
    ((offset / size) * (1.0 + EDGE_TOLERANCE)).floor() as usize
}

/// Compensated (Neumaier) sum.
pub fn neumaier_sum<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    let mut sum = 0.0;
    let mut compensation = 0.0;
    for v in values {
        let t = sum + v;
        if sum.abs() >= v.abs() {
            compensation += (sum - t) + v;
        } else {
            compensation += (v - t) + sum;
        }
        sum = t;
    }
    sum + compensation
}

/// Mean that does not depend on the order of `values`.
///
/// The slice is sorted in place before a compensated sum, so any permutation
/// of the same values yields bit-identical results.
pub fn stable_mean(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable_by(f64::total_cmp);
    Some(neumaier_sum(values.iter().copied()) / values.len() as f64)
}

/// One aggregated cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridCell {
    pub value: f64,
    /// Observations that fell in the cell (0 for interpolated cells)
    pub count: usize,
    pub interpolated: bool,
}

/// A heatmap over a regular square tiling.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    column: String,
    crs: &'static str,
    origin: PlanarPoint,
    cell_size: f64,
    cell_size_m: u32,
    cols: usize,
    rows: usize,
    /// Row-major, row 0 at the minimum y
    cells: Vec<Option<GridCell>>,
}

impl Grid {
    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn crs(&self) -> &'static str {
        self.crs
    }

    pub fn origin(&self) -> PlanarPoint {
        self.origin
    }

    /// Cell edge in planar units.
    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Cell edge on the ground, in metres.
    pub fn cell_size_m(&self) -> u32 {
        self.cell_size_m
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cells(&self) -> &[Option<GridCell>] {
        &self.cells
    }

    pub fn cell(&self, col: usize, row: usize) -> Option<&GridCell> {
        if col >= self.cols || row >= self.rows {
            return None;
        }
        self.cells[row * self.cols + col].as_ref()
    }

    /// Number of cells holding a value (observed or interpolated).
    pub fn defined_cells(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    pub fn observed_cells(&self) -> usize {
        self.cells
            .iter()
            .flatten()
            .filter(|c| !c.interpolated)
            .count()
    }

    pub fn cell_bounds(&self, col: usize, row: usize) -> PlanarBounds {
        let min_x = self.origin.x + col as f64 * self.cell_size;
        let min_y = self.origin.y + row as f64 * self.cell_size;
        PlanarBounds {
            min_x,
            min_y,
            max_x: min_x + self.cell_size,
            max_y: min_y + self.cell_size,
        }
    }

    pub fn cell_center(&self, col: usize, row: usize) -> PlanarPoint {
        PlanarPoint {
            x: self.origin.x + (col as f64 + 0.5) * self.cell_size,
            y: self.origin.y + (row as f64 + 0.5) * self.cell_size,
        }
    }

    /// Minimum and maximum of the defined cell values.
    pub fn value_range(&self) -> Option<(f64, f64)> {
        self.cells.iter().flatten().fold(None, |acc, c| {
            Some(match acc {
                None => (c.value, c.value),
                Some((lo, hi)) => (lo.min(c.value), hi.max(c.value)),
            })
        })
    }
}

/// Bin the positioned rows of `dataset` into a heatmap of `column`.
pub fn aggregate_heatmap(dataset: &GeoEnabledDataset, column: &str, config: &GridConfig) -> Result<Grid> {
    if config.cell_size_m == 0 {
        return Err(PipelineError::InvalidConfig(
            "cell size must be a positive integer".to_string(),
        ));
    }
    let values = dataset
        .table()
        .column(column)
        .ok_or_else(|| PipelineError::MissingColumn(column.to_string()))?;

    let bounds = PlanarBounds::from_points(dataset.positioned_rows().map(|(_, p)| p.planar))
        .ok_or_else(|| PipelineError::EmptyExtent("no row has a position".to_string()))?;

    let size = config.cell_size_m as f64 * dataset.scale_factor();
    let cols = cell_index(bounds.width(), size) + 1;
    let rows = cell_index(bounds.height(), size) + 1;
    let total = cols.checked_mul(rows).filter(|&n| n <= MAX_GRID_CELLS).ok_or_else(|| {
        PipelineError::InvalidConfig(format!(
            "a {} m cell size gives a {} x {} grid, above the {} cell limit",
            config.cell_size_m, cols, rows, MAX_GRID_CELLS
        ))
    })?;

    let mut buckets: Vec<Vec<f64>> = vec![Vec::new(); total];
    for (row_idx, pos) in dataset.positioned_rows() {
        let Some(v) = values[row_idx] else { continue };
        let c = cell_index(pos.planar.x - bounds.min_x, size).min(cols - 1);
        let r = cell_index(pos.planar.y - bounds.min_y, size).min(rows - 1);
        buckets[r * cols + c].push(v);
    }

    let mut cells: Vec<Option<GridCell>> = buckets
        .into_iter()
        .map(|mut bucket| {
            let count = bucket.len();
            stable_mean(&mut bucket).map(|value| GridCell {
                value,
                count,
                interpolated: false,
            })
        })
        .collect();

    let observed = cells.iter().filter(|c| c.is_some()).count();
    if observed == 0 {
        return Err(PipelineError::EmptyExtent(format!(
            "no positioned row has a value for '{}'",
            column
        )));
    }

    let mut grid = Grid {
        column: column.to_string(),
        crs: dataset.crs(),
        origin: PlanarPoint {
            x: bounds.min_x,
            y: bounds.min_y,
        },
        cell_size: size,
        cell_size_m: config.cell_size_m,
        cols,
        rows,
        cells: Vec::new(),
    };

    if config.interpolate && observed < total {
        fill_empty_cells(&grid, &mut cells, config);
    }
    grid.cells = cells;

    info!(
        "Heatmap '{}': {}x{} cells of {} m, {} observed, {} defined",
        column,
        cols,
        rows,
        config.cell_size_m,
        observed,
        grid.defined_cells()
    );

    Ok(grid)
}

/// Inverse-distance-weighted fill of every empty cell.
fn fill_empty_cells(grid: &Grid, cells: &mut [Option<GridCell>], config: &GridConfig) {
    let mut centers: Vec<[f64; 2]> = Vec::new();
    let mut known: Vec<f64> = Vec::new();
    for (idx, cell) in cells.iter().enumerate() {
        if let Some(cell) = cell {
            let p = grid.cell_center(idx % grid.cols, idx / grid.cols);
            centers.push([p.x, p.y]);
            known.push(cell.value);
        }
    }

    let tree: ImmutableKdTree<f64, 2> = ImmutableKdTree::new_from_slice(&centers);
    let radius = config.search_radius_cells.max(0.0) * grid.cell_size;
    let radius_sq = radius * radius;
    let power = config.idw_power;

    let empty: Vec<usize> = cells
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_none())
        .map(|(i, _)| i)
        .collect();

    let estimates: Vec<(usize, f64)> = empty
        .par_iter()
        .map(|&idx| {
            let p = grid.cell_center(idx % grid.cols, idx / grid.cols);
            let query = [p.x, p.y];

            let mut neighbours: Vec<(usize, f64)> = tree
                .within::<SquaredEuclidean>(&query, radius_sq)
                .iter()
                .map(|nn| (nn.item as usize, nn.distance))
                .collect();

            if neighbours.is_empty() {
                neighbours = centers
                    .iter()
                    .enumerate()
                    .map(|(i, c)| {
                        let dx = c[0] - query[0];
                        let dy = c[1] - query[1];
                        (i, dx * dx + dy * dy)
                    })
                    .collect();
            }

            // Fixed summation order regardless of tree traversal order
            neighbours.sort_unstable_by_key(|(i, _)| *i);

            let weights: Vec<f64> = neighbours
                .iter()
                .map(|(_, d_sq)| 1.0 / d_sq.sqrt().powf(power))
                .collect();
            let numerator = neumaier_sum(
                neighbours
                    .iter()
                    .zip(weights.iter())
                    .map(|((i, _), w)| w * known[*i]),
            );
            let denominator = neumaier_sum(weights.iter().copied());

            (idx, numerator / denominator)
        })
        .collect();

    debug!("Interpolated {} empty cells", estimates.len());

    for (idx, value) in estimates {
        cells[idx] = Some(GridCell {
            value,
            count: 0,
            interpolated: true,
        });
    }
}
