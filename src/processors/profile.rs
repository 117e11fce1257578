//! Vertical profiles: per-height-band means of the cart's mast channels.

use std::fmt;
use std::sync::LazyLock;

use log::{debug, info, warn};
use regex::Regex;

use crate::config::ProfileConfig;
use crate::core::table::TimeSeriesTable;
use crate::error::{PipelineError, Result};
use crate::processors::grid::stable_mean;
use crate::processors::units::{FAHRENHEIT_MARKER, OUT_OF_RANGE_SUFFIX};

static HEIGHT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*ft").expect("height regex"));
static SECONDARY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\sb\s").expect("secondary regex"));

/// Physical quantity a profile is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    Temperature,
    Ir,
    Humidity,
}

impl Quantity {
    pub fn unit(&self) -> &'static str {
        match self {
            Quantity::Temperature | Quantity::Ir => "°F",
            Quantity::Humidity => "%",
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Temperature => write!(f, "temperature"),
            Quantity::Ir => write!(f, "ir"),
            Quantity::Humidity => write!(f, "humidity"),
        }
    }
}

/// A channel that contributes to a profile.
#[derive(Debug, Clone, PartialEq)]
pub struct HeightChannel {
    pub label: String,
    pub height_ft: f64,
    pub quantity: Quantity,
}

/// One height band. `upper` is exclusive except for the top band.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileBand {
    pub lower: f64,
    pub upper: f64,
    pub mean: Option<f64>,
    pub count: usize,
}

impl ProfileBand {
    pub fn midpoint(&self) -> f64 {
        (self.lower + self.upper) / 2.0
    }
}

/// 1-D vertical grid for one quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct VerticalProfile {
    pub quantity: Quantity,
    pub max_height_ft: f64,
    pub channels: Vec<HeightChannel>,
    pub bands: Vec<ProfileBand>,
}

impl VerticalProfile {
    pub fn band_for(&self, height_ft: f64) -> Option<&ProfileBand> {
        band_index(height_ft, self.max_height_ft, self.bands.len()).map(|i| &self.bands[i])
    }
}

/// Parse the mounting height (feet) from a channel label.
pub fn parse_height(label: &str) -> Option<f64> {
    HEIGHT_RE
        .captures(label)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Whether a label names a secondary ("b") sensor, e.g. `5.4 ft b (°F)`.
pub fn is_secondary(label: &str) -> bool {
    SECONDARY_RE.is_match(label)
}

/// Quantity a column measures, judged from its label. Flag columns and
/// labels without a recognised unit yield `None`.
pub fn classify_label(label: &str) -> Option<Quantity> {
    if label.ends_with(OUT_OF_RANGE_SUFFIX) {
        None
    } else if label.starts_with("IR") && label.ends_with(FAHRENHEIT_MARKER) {
        Some(Quantity::Ir)
    } else if label.starts_with("RH") && label.ends_with("(%)") {
        Some(Quantity::Humidity)
    } else if label.ends_with(FAHRENHEIT_MARKER) && parse_height(label).is_some() {
        Some(Quantity::Temperature)
    } else {
        None
    }
}

/// Classify the table's columns into height channels.
pub fn height_channels(table: &TimeSeriesTable, config: &ProfileConfig) -> Vec<HeightChannel> {
    table
        .columns()
        .iter()
        .filter_map(|col| {
            let label = col.label.as_str();
            if !config.include_secondary && is_secondary(label) {
                return None;
            }

            let quantity = classify_label(label)?;
            let height_ft = match quantity {
                Quantity::Ir => parse_height(label).unwrap_or(config.ir_height_ft),
                _ => parse_height(label)?,
            };

            if !config.quantities.includes(quantity) || height_ft < 0.0 || height_ft > config.max_height_ft {
                return None;
            }
            Some(HeightChannel {
                label: label.to_string(),
                height_ft,
                quantity,
            })
        })
        .collect()
}

fn band_index(height_ft: f64, max_height_ft: f64, bands: usize) -> Option<usize> {
    if bands == 0 || height_ft < 0.0 || height_ft > max_height_ft {
        return None;
    }
    let width = max_height_ft / bands as f64;
    Some(((height_ft / width).floor() as usize).min(bands - 1))
}

/// Distinct heights, sorted.
fn distinct_heights(channels: &[&HeightChannel]) -> Vec<f64> {
    let mut heights: Vec<f64> = channels.iter().map(|c| c.height_ft).collect();
    heights.sort_unstable_by(f64::total_cmp);
    heights.dedup();
    heights
}

/// Compute one vertical profile per selected quantity.
///
/// Height is split into equal bands from 0 to `max_height_ft`, one band per
/// distinct sensor height present for that quantity. Each band's value is the
/// mean of every non-missing observation of its channels over all rows.
pub fn vertical_profile(table: &TimeSeriesTable, config: &ProfileConfig) -> Result<Vec<VerticalProfile>> {
    if !config.max_height_ft.is_finite() || config.max_height_ft <= 0.0 {
        return Err(PipelineError::InvalidConfig(
            "maximum profile height must be positive".to_string(),
        ));
    }

    let channels = height_channels(table, config);
    if channels.is_empty() {
        return Err(PipelineError::EmptyExtent(
            "no height-labelled channel for the selected quantities".to_string(),
        ));
    }

    let mut profiles = Vec::new();
    for quantity in config.quantities.selected() {
        let members: Vec<&HeightChannel> = channels.iter().filter(|c| c.quantity == quantity).collect();
        if members.is_empty() {
            warn!("No {} channels available for a vertical profile", quantity);
            continue;
        }

        let band_count = distinct_heights(&members).len();
        let width = config.max_height_ft / band_count as f64;
        let mut buckets: Vec<Vec<f64>> = vec![Vec::new(); band_count];

        for channel in &members {
            let Some(idx) = band_index(channel.height_ft, config.max_height_ft, band_count) else {
                continue;
            };
            if let Some(values) = table.column(&channel.label) {
                buckets[idx].extend(values.iter().flatten().copied());
            }
        }

        let bands: Vec<ProfileBand> = buckets
            .into_iter()
            .enumerate()
            .map(|(i, mut values)| ProfileBand {
                lower: i as f64 * width,
                upper: if i + 1 == band_count {
                    config.max_height_ft
                } else {
                    (i + 1) as f64 * width
                },
                count: values.len(),
                mean: stable_mean(&mut values),
            })
            .collect();

        debug!(
            "{} profile: {} channels in {} bands",
            quantity,
            members.len(),
            band_count
        );

        profiles.push(VerticalProfile {
            quantity,
            max_height_ft: config.max_height_ft,
            channels: members.into_iter().cloned().collect(),
            bands,
        });
    }

    info!("Computed {} vertical profiles", profiles.len());
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuantitySelection;
    use crate::core::table::test_support::{some, ts};
    use crate::core::table::Column;

    fn mast_table(order: &[usize]) -> TimeSeriesTable {
        let rows: Vec<(i64, [f64; 5])> = vec![
            (0, [60.0, 61.0, 62.5, 63.0, 40.0]),
            (1, [60.5, 61.5, 62.0, 63.5, 41.0]),
            (2, [59.9, 61.2, 62.1, 63.3, 42.0]),
            (3, [60.1, 61.9, 62.7, 63.1, 43.0]),
        ];
        let picked: Vec<&(i64, [f64; 5])> = order.iter().map(|&i| &rows[i]).collect();
        let labels = ["0.6 ft (°F)", "1.8 ft (°F)", "5.4 ft (°F)", "5.4 ft b (°F)", "RH 1.8 ft (%)"];

        // build() sorts, so feed timestamps shuffled with the rows
        TimeSeriesTable::build(
            picked.iter().map(|r| ts(r.0)).collect(),
            labels
                .iter()
                .enumerate()
                .map(|(c, label)| Column::new(*label, picked.iter().map(|r| Some(r.1[c])).collect()))
                .collect(),
        )
        .unwrap()
        .value
    }

    fn config() -> ProfileConfig {
        ProfileConfig {
            max_height_ft: 10.8,
            quantities: QuantitySelection {
                temperature: true,
                ir: false,
                humidity: true,
            },
            include_secondary: true,
            ir_height_ft: 0.0,
        }
    }

    #[test]
    fn test_parse_height() {
        assert_eq!(parse_height("1.8 ft (°F)"), Some(1.8));
        assert_eq!(parse_height("Raw RH 9.0ft"), Some(9.0));
        assert_eq!(parse_height("3.6 ft b (°C)"), Some(3.6));
        assert_eq!(parse_height("IR (°F)"), None);
    }

    #[test]
    fn test_classify_label() {
        assert_eq!(classify_label("1.8 ft (°F)"), Some(Quantity::Temperature));
        assert_eq!(classify_label("IR (°F)"), Some(Quantity::Ir));
        assert_eq!(classify_label("RH 7.2 ft (%)"), Some(Quantity::Humidity));
        assert_eq!(classify_label("RH 7.2 ft (%) out of range"), None);
        assert_eq!(classify_label("1.8 ft (°C)"), None);
        assert!(is_secondary("5.4 ft b (°F)"));
        assert!(!is_secondary("5.4 ft (°F)"));
    }

    #[test]
    fn test_band_count_follows_distinct_heights() {
        let profiles = vertical_profile(&mast_table(&[0, 1, 2, 3]), &config()).unwrap();
        let temp = profiles.iter().find(|p| p.quantity == Quantity::Temperature).unwrap();

        // heights 0.6, 1.8, 5.4 (primary and b share 5.4)
        assert_eq!(temp.bands.len(), 3);
        assert!((temp.bands[0].upper - 3.6).abs() < 1e-12);
        assert_eq!(temp.bands[2].upper, 10.8);
        // 0.6 and 1.8 share the first band, 5.4 and 5.4 b the second
        assert_eq!(temp.bands[0].count, 8);
        assert_eq!(temp.bands[1].count, 8);
        assert!(temp.bands[2].mean.is_none());

        let rh = profiles.iter().find(|p| p.quantity == Quantity::Humidity).unwrap();
        assert_eq!(rh.bands.len(), 1);
        assert_eq!(rh.bands[0].mean, Some(41.5));
    }

    #[test]
    fn test_row_order_does_not_change_means() {
        let a = vertical_profile(&mast_table(&[0, 1, 2, 3]), &config()).unwrap();
        let b = vertical_profile(&mast_table(&[3, 1, 0, 2]), &config()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_secondary_channels_can_be_excluded() {
        let cfg = ProfileConfig {
            include_secondary: false,
            ..config()
        };
        let profiles = vertical_profile(&mast_table(&[0, 1, 2, 3]), &cfg).unwrap();
        let temp = &profiles[0];
        assert!(temp.channels.iter().all(|c| !c.label.contains(" b ")));
        assert_eq!(temp.bands[1].count, 4);
    }

    #[test]
    fn test_ir_placed_at_configured_height() {
        let table = TimeSeriesTable::new(
            vec![ts(0), ts(1)],
            vec![
                Column::new("IR (°F)", some(&[70.0, 72.0])),
                Column::new("IR Raw (V)", some(&[3.0, 3.1])),
            ],
        )
        .unwrap();
        let cfg = ProfileConfig {
            quantities: QuantitySelection {
                temperature: false,
                ir: true,
                humidity: false,
            },
            ..config()
        };

        let profiles = vertical_profile(&table, &cfg).unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].channels[0].height_ft, 0.0);
        assert_eq!(profiles[0].band_for(0.0).unwrap().mean, Some(71.0));
    }

    #[test]
    fn test_heights_above_maximum_are_ignored() {
        let table = TimeSeriesTable::new(
            vec![ts(0)],
            vec![
                Column::new("1.8 ft (°F)", some(&[60.0])),
                Column::new("9.0 ft (°F)", some(&[65.0])),
            ],
        )
        .unwrap();
        let cfg = ProfileConfig {
            max_height_ft: 5.0,
            ..config()
        };
        let profiles = vertical_profile(&table, &cfg).unwrap();
        assert_eq!(profiles[0].bands.len(), 1);
        assert_eq!(profiles[0].bands[0].mean, Some(60.0));
    }

    #[test]
    fn test_empty_extent_without_height_channels() {
        let table = TimeSeriesTable::new(vec![ts(0)], vec![Column::new("IR Raw (V)", some(&[3.0]))]).unwrap();
        let err = vertical_profile(&table, &config()).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyExtent(_)));
    }
}
