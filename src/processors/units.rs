//! Raw channel readings to physical units.
//!
//! Every function here returns a new table that keeps the original columns
//! and appends the derived ones.

use chrono::Duration;
use log::{debug, warn};

use crate::config::{HumidityCalibration, HumidityChannel, IrCalibration};
use crate::core::table::TimeSeriesTable;
use crate::error::{Outcome, PipelineError, PipelineWarning, Result};

/// Marker carried by Celsius channel labels.
pub const CELSIUS_MARKER: &str = "(°C)";
/// Marker carried by Fahrenheit channel labels.
pub const FAHRENHEIT_MARKER: &str = "(°F)";
/// Suffix of the per-row range flag added next to each humidity column.
pub const OUT_OF_RANGE_SUFFIX: &str = " out of range";

#[inline]
pub fn celsius_to_fahrenheit(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

#[inline]
pub fn fahrenheit_to_celsius(f: f64) -> f64 {
    (f - 32.0) * 5.0 / 9.0
}

/// Label of the Fahrenheit sibling of a Celsius label.
pub fn fahrenheit_label(celsius_label: &str) -> Option<String> {
    celsius_label
        .contains(CELSIUS_MARKER)
        .then(|| celsius_label.replace(CELSIUS_MARKER, FAHRENHEIT_MARKER))
}

/// Add a `(°F)` column for every `(°C)` column.
pub fn convert_celsius_columns(table: &TimeSeriesTable) -> Result<TimeSeriesTable> {
    let mut out = table.clone();
    let mut converted = 0usize;

    for column in table.columns() {
        if let Some(label) = fahrenheit_label(&column.label) {
            let values = column
                .values
                .iter()
                .map(|v| v.map(celsius_to_fahrenheit))
                .collect();
            out = out.with_column(label, values)?;
            converted += 1;
        }
    }

    debug!("Converted {} Celsius columns to Fahrenheit", converted);
    Ok(out)
}

/// Evaluate the calibration polynomial (Horner's method).
pub fn ir_voltage_to_fahrenheit(volts: f64, coefficients: &[f64]) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, &c| acc * volts + c)
}

/// Add the IR temperature column derived from the raw IR voltage.
pub fn ir_from_voltage(table: &TimeSeriesTable, calibration: &IrCalibration) -> Result<TimeSeriesTable> {
    let raw = table
        .column(&calibration.raw_label)
        .ok_or_else(|| PipelineError::MissingDependency {
            column: calibration.raw_label.clone(),
        })?;

    let values = raw
        .iter()
        .map(|v| v.map(|volts| ir_voltage_to_fahrenheit(volts, &calibration.coefficients)))
        .collect();

    table.with_column(calibration.output_label.clone(), values)
}

/// Temperature-compensated relative humidity from sensor voltage.
pub fn relative_humidity(volts: f64, temperature_c: f64, calibration: &HumidityCalibration) -> f64 {
    let sensor_rh = (volts / calibration.supply_voltage - calibration.zero_offset) / calibration.slope;
    sensor_rh / (calibration.temp_comp_intercept - calibration.temp_comp_slope * temperature_c)
}

/// Add %RH columns for every configured humidity channel present in `table`.
///
/// The paired temperature is read from `table` when it has the column, else
/// from `reference` at the nearest timestamp within `pairing_gap`. A channel
/// whose paired column exists in neither fails with `MissingDependency`.
/// Channels whose raw voltage column is absent are skipped.
///
/// Results outside [0, 100] are kept as computed; a companion
/// `"<output> out of range"` column holds 1.0 for those rows and 0.0 for the
/// others.
pub fn humidity_from_voltage(
    table: &TimeSeriesTable,
    reference: Option<&TimeSeriesTable>,
    channels: &[HumidityChannel],
    calibration: &HumidityCalibration,
    pairing_gap: Duration,
) -> Result<Outcome<TimeSeriesTable>> {
    let mut out = table.clone();
    let mut warnings = Vec::new();

    for channel in channels {
        let Some(raw) = table.column(&channel.raw) else {
            continue;
        };

        let temperatures: Vec<Option<f64>> = if let Some(own) = table.column(&channel.temperature) {
            own.to_vec()
        } else if let Some(other) = reference.filter(|r| r.has_column(&channel.temperature)) {
            table
                .timestamps()
                .iter()
                .map(|&ts| {
                    other
                        .nearest_index(ts, pairing_gap)
                        .and_then(|i| other.value(i, &channel.temperature))
                })
                .collect()
        } else {
            return Err(PipelineError::MissingDependency {
                column: channel.temperature.clone(),
            });
        };

        let mut flagged = 0usize;
        let mut rh = Vec::with_capacity(raw.len());
        let mut flags = Vec::with_capacity(raw.len());

        for (volts, temp) in raw.iter().zip(temperatures.iter()) {
            match (volts, temp) {
                (Some(v), Some(t)) => {
                    let value = relative_humidity(*v, *t, calibration);
                    let out_of_range = !(0.0..=100.0).contains(&value);
                    if out_of_range {
                        flagged += 1;
                    }
                    rh.push(Some(value));
                    flags.push(Some(if out_of_range { 1.0 } else { 0.0 }));
                }
                _ => {
                    rh.push(None);
                    flags.push(None);
                }
            }
        }

        out = out.with_column(channel.output.clone(), rh)?;
        out = out.with_column(format!("{}{}", channel.output, OUT_OF_RANGE_SUFFIX), flags)?;

        if flagged > 0 {
            warn!("{} rows of '{}' outside 0-100 %RH", flagged, channel.output);
            warnings.push(PipelineWarning::HumidityOutOfRange {
                column: channel.output.clone(),
                rows: flagged,
            });
        }
    }

    Ok(Outcome::with_warnings(out, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::table::test_support::{some, ts};
    use crate::core::table::Column;

    #[test]
    fn test_fahrenheit_formula_and_inverse() {
        assert_eq!(celsius_to_fahrenheit(0.0), 32.0);
        assert_eq!(celsius_to_fahrenheit(100.0), 212.0);
        assert_eq!(celsius_to_fahrenheit(-40.0), -40.0);

        for c in [-30.0, -1.25, 0.0, 12.3, 37.0, 55.5] {
            assert_eq!(celsius_to_fahrenheit(c), c * 9.0 / 5.0 + 32.0);
            assert!((fahrenheit_to_celsius(celsius_to_fahrenheit(c)) - c).abs() < 1e-9);
        }
    }

    #[test]
    fn test_convert_celsius_columns_keeps_originals() {
        let table = TimeSeriesTable::new(
            vec![ts(0), ts(1)],
            vec![
                Column::new("1.8 ft (°C)", vec![Some(20.0), None]),
                Column::new("IR Raw (V)", some(&[1.0, 2.0])),
            ],
        )
        .unwrap();

        let converted = convert_celsius_columns(&table).unwrap();
        assert_eq!(
            converted.labels(),
            vec!["1.8 ft (°C)", "IR Raw (V)", "1.8 ft (°F)"]
        );
        assert_eq!(converted.value(0, "1.8 ft (°F)"), Some(68.0));
        assert_eq!(converted.value(1, "1.8 ft (°F)"), None);
        assert_eq!(converted.value(0, "1.8 ft (°C)"), Some(20.0));
    }

    #[test]
    fn test_ir_polynomial() {
        let cal = IrCalibration::default();
        assert_eq!(ir_voltage_to_fahrenheit(0.0, &cal.coefficients), -40.0);
        assert_eq!(ir_voltage_to_fahrenheit(5.0, &cal.coefficients), 140.0);
        assert_eq!(ir_voltage_to_fahrenheit(2.0, &[1.0, 2.0, 3.0]), 17.0);
    }

    #[test]
    fn test_ir_from_voltage_requires_raw_column() {
        let table = TimeSeriesTable::new(vec![ts(0)], vec![]).unwrap();
        let err = ir_from_voltage(&table, &IrCalibration::default()).unwrap_err();
        assert_eq!(
            err,
            PipelineError::MissingDependency {
                column: "IR Raw (V)".to_string()
            }
        );
    }

    #[test]
    fn test_humidity_uses_own_temperature_column() {
        let cal = HumidityCalibration::default();
        let channels = vec![HumidityChannel::new("Raw RH 1.8ft", "1.8 ft (°C)", "RH 1.8 ft (%)")];
        let table = TimeSeriesTable::new(
            vec![ts(0)],
            vec![
                Column::new("Raw RH 1.8ft", some(&[2.5])),
                Column::new("1.8 ft (°C)", some(&[25.0])),
            ],
        )
        .unwrap();

        let outcome =
            humidity_from_voltage(&table, None, &channels, &cal, Duration::seconds(2)).unwrap();
        let expected = relative_humidity(2.5, 25.0, &cal);
        assert!(expected > 0.0 && expected < 100.0);
        assert_eq!(outcome.value.value(0, "RH 1.8 ft (%)"), Some(expected));
        assert_eq!(outcome.value.value(0, "RH 1.8 ft (%) out of range"), Some(0.0));
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_humidity_pairs_with_reference_by_nearest_time() {
        let cal = HumidityCalibration::default();
        let channels = vec![HumidityChannel::new("Raw RH 1.8ft", "1.8 ft (°C)", "RH 1.8 ft (%)")];
        let irrh = TimeSeriesTable::new(
            vec![ts(0), ts(10)],
            vec![Column::new("Raw RH 1.8ft", some(&[2.0, 2.0]))],
        )
        .unwrap();
        let temps = TimeSeriesTable::new(
            vec![ts(1)],
            vec![Column::new("1.8 ft (°C)", some(&[20.0]))],
        )
        .unwrap();

        let outcome =
            humidity_from_voltage(&irrh, Some(&temps), &channels, &cal, Duration::seconds(2))
                .unwrap();
        let rh = outcome.value.column("RH 1.8 ft (%)").unwrap();
        assert_eq!(rh[0], Some(relative_humidity(2.0, 20.0, &cal)));
        // no temperature sample within 2 s of t=10
        assert_eq!(rh[1], None);
    }

    #[test]
    fn test_humidity_missing_dependency() {
        let cal = HumidityCalibration::default();
        let channels = vec![HumidityChannel::new("Raw RH 7.2ft", "7.2 ft (°C)", "RH 7.2 ft (%)")];
        let table = TimeSeriesTable::new(
            vec![ts(0)],
            vec![Column::new("Raw RH 7.2ft", some(&[2.0]))],
        )
        .unwrap();

        let err = humidity_from_voltage(&table, None, &channels, &cal, Duration::seconds(2))
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::MissingDependency {
                column: "7.2 ft (°C)".to_string()
            }
        );
    }

    #[test]
    fn test_humidity_out_of_range_is_flagged_not_clipped() {
        let cal = HumidityCalibration::default();
        let channels = vec![HumidityChannel::new("Raw RH 1.8ft", "1.8 ft (°C)", "RH 1.8 ft (%)")];
        // 5 V saturates the sensor well above 100 %RH
        let table = TimeSeriesTable::new(
            vec![ts(0), ts(1)],
            vec![
                Column::new("Raw RH 1.8ft", some(&[5.0, 2.0])),
                Column::new("1.8 ft (°C)", some(&[20.0, 20.0])),
            ],
        )
        .unwrap();

        let outcome =
            humidity_from_voltage(&table, None, &channels, &cal, Duration::seconds(2)).unwrap();
        let rh = outcome.value.value(0, "RH 1.8 ft (%)").unwrap();
        assert!(rh > 100.0);
        assert_eq!(outcome.value.value(0, "RH 1.8 ft (%) out of range"), Some(1.0));
        assert_eq!(outcome.value.value(1, "RH 1.8 ft (%) out of range"), Some(0.0));
        assert_eq!(
            outcome.warnings,
            vec![PipelineWarning::HumidityOutOfRange {
                column: "RH 1.8 ft (%)".to_string(),
                rows: 1
            }]
        );
    }

    #[test]
    fn test_humidity_skips_absent_raw_channels() {
        let table = TimeSeriesTable::new(vec![ts(0)], vec![Column::new("IR Raw (V)", some(&[1.0]))])
            .unwrap();
        let outcome = humidity_from_voltage(
            &table,
            None,
            &[HumidityChannel::new("Raw RH 1.8ft", "1.8 ft (°C)", "RH 1.8 ft (%)")],
            &HumidityCalibration::default(),
            Duration::seconds(2),
        )
        .unwrap();
        assert_eq!(outcome.value, table);
    }
}
