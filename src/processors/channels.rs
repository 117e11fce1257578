//! Cart channel profiles and raw-to-semantic column renaming.
//!
//! Each cart wires its sensors to DAQ inputs differently, so the same raw
//! channel (e.g. `AI0 (°C)`) means a different height on each cart. The
//! mapping is data: new carts are added as profile entries in the YAML
//! configuration, not as code.

use std::collections::BTreeMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::core::table::{Column, TimeSeriesTable};
use crate::error::{Outcome, PipelineError, PipelineWarning, Result};

/// One raw channel and the label it receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub raw: String,
    pub label: String,
}

impl ChannelEntry {
    pub fn new(raw: &str, label: &str) -> Self {
        Self {
            raw: raw.to_string(),
            label: label.to_string(),
        }
    }
}

/// Ordered raw-id → label mapping for one profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelMap {
    entries: Vec<ChannelEntry>,
}

impl ChannelMap {
    pub fn new(entries: Vec<ChannelEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ChannelEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All known cart profiles plus the DAQ serial table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartProfiles {
    /// Profile name (e.g. "Cart 2 IR") → channel map.
    #[serde(default = "default_profiles")]
    pub profiles: BTreeMap<String, ChannelMap>,

    /// DAQ serial number → cart name.
    #[serde(default = "default_serials")]
    pub serials: BTreeMap<String, String>,

    /// Legacy label → current label, applied when a mapped raw channel is
    /// absent but an older export already carries the legacy label.
    #[serde(default = "default_aliases")]
    pub aliases: BTreeMap<String, String>,
}

fn temp_map(pairs: &[(&str, &str)]) -> ChannelMap {
    ChannelMap::new(pairs.iter().map(|(r, l)| ChannelEntry::new(r, l)).collect())
}

fn default_profiles() -> BTreeMap<String, ChannelMap> {
    let mut profiles = BTreeMap::new();
    // Output order follows sensor height.
    profiles.insert(
        "Cart 1 Temp".to_string(),
        temp_map(&[
            ("AI2 (°C)", "0.6 ft (°C)"),
            ("AI0 (°C)", "1.8 ft (°C)"),
            ("AI3 (°C)", "3.6 ft (°C)"),
            ("AI6 (°C)", "3.6 ft b (°C)"),
            ("AI1 (°C)", "5.4 ft (°C)"),
            ("AI7 (°C)", "5.4 ft b (°C)"),
            ("AI4 (°C)", "7.2 ft (°C)"),
            ("AI5 (°C)", "9.0 ft (°C)"),
        ]),
    );
    profiles.insert(
        "Cart 1 IR".to_string(),
        temp_map(&[("AI0 (V)", "IR Raw (V)")]),
    );
    profiles.insert(
        "Cart 2 Temp".to_string(),
        temp_map(&[
            ("AI1 (°C)", "0.6 ft (°C)"),
            ("AI2 (°C)", "1.8 ft (°C)"),
            ("AI3 (°C)", "3.6 ft (°C)"),
            ("AI4 (°C)", "3.6 ft b (°C)"),
            ("AI0 (°C)", "5.4 ft (°C)"),
            ("AI5 (°C)", "5.4 ft b (°C)"),
            ("AI6 (°C)", "7.2 ft (°C)"),
            ("AI7 (°C)", "9.0 ft (°C)"),
        ]),
    );
    profiles.insert(
        "Cart 2 IR".to_string(),
        temp_map(&[
            ("AI0 (V)", "IR Raw (V)"),
            ("AI1 (V)", "Raw RH 0.0ft"),
            ("AI3 (V)", "Raw RH 1.8ft"),
            ("AI2 (V)", "Raw RH 7.2ft"),
            ("AI4 (V)", "Raw RH 9.0ft"),
        ]),
    );
    profiles
}

fn default_serials() -> BTreeMap<String, String> {
    let mut serials = BTreeMap::new();
    serials.insert("21AD4B7".to_string(), "Cart 1".to_string());
    serials.insert("2082107".to_string(), "Cart 1".to_string());
    serials.insert("1DE5504".to_string(), "Cart 2".to_string());
    serials
}

fn default_aliases() -> BTreeMap<String, String> {
    let mut aliases = BTreeMap::new();
    aliases.insert("0.0 ft (°C)".to_string(), "0.6 ft (°C)".to_string());
    aliases
}

impl Default for CartProfiles {
    fn default() -> Self {
        Self {
            profiles: default_profiles(),
            serials: default_serials(),
            aliases: default_aliases(),
        }
    }
}

impl CartProfiles {
    /// Look up a profile by name.
    pub fn profile(&self, name: &str) -> Result<&ChannelMap> {
        self.profiles
            .get(name)
            .ok_or_else(|| PipelineError::UnknownCartConfig(name.to_string()))
    }

    /// Cart name for a DAQ serial number.
    pub fn cart_for_serial(&self, serial: &str) -> Option<&str> {
        self.serials.get(serial.trim()).map(String::as_str)
    }

    fn legacy_labels_for<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.aliases
            .iter()
            .filter(move |(_, current)| current.as_str() == label)
            .map(|(legacy, _)| legacy.as_str())
    }
}

/// Rename and select the columns of `table` according to `profile_name`.
///
/// The result has exactly the profile's labels that could be resolved, in
/// profile order. A raw channel is resolved by its raw id first, then by the
/// label itself (files already renamed by the DAQ), then by legacy aliases.
/// Unresolved entries produce a single `ChannelMismatch` warning.
pub fn rename_channels(
    table: &TimeSeriesTable,
    profiles: &CartProfiles,
    profile_name: &str,
) -> Result<Outcome<TimeSeriesTable>> {
    let map = profiles.profile(profile_name)?;

    let mut columns = Vec::with_capacity(map.len());
    let mut missing = Vec::new();

    for entry in map.entries() {
        let source = table
            .column(&entry.raw)
            .or_else(|| table.column(&entry.label))
            .or_else(|| {
                profiles
                    .legacy_labels_for(&entry.label)
                    .find_map(|legacy| table.column(legacy))
            });

        match source {
            Some(values) => {
                if columns.iter().any(|c: &Column| c.label == entry.label) {
                    return Err(PipelineError::DuplicateColumn(entry.label.clone()));
                }
                columns.push(Column::new(entry.label.clone(), values.to_vec()));
            }
            None => missing.push(entry.raw.clone()),
        }
    }

    debug!(
        "Profile '{}': {} of {} channels resolved",
        profile_name,
        columns.len(),
        map.len()
    );

    let renamed = TimeSeriesTable::from_sorted(table.timestamps().to_vec(), columns);

    if missing.is_empty() {
        Ok(Outcome::clean(renamed))
    } else {
        warn!(
            "Profile '{}' channels missing from input: {}",
            profile_name,
            missing.join(", ")
        );
        Ok(Outcome::with_warnings(
            renamed,
            vec![PipelineWarning::ChannelMismatch {
                profile: profile_name.to_string(),
                missing,
            }],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::table::test_support::{some, ts};

    fn raw_cart2_table() -> TimeSeriesTable {
        let cols = (0..8)
            .map(|i| Column::new(format!("AI{} (°C)", i), some(&[i as f64, i as f64 + 0.5])))
            .chain(std::iter::once(Column::new("Sample", some(&[1.0, 2.0]))))
            .collect();
        TimeSeriesTable::new(vec![ts(0), ts(1)], cols).unwrap()
    }

    #[test]
    fn test_rename_selects_only_mapped_labels() {
        let profiles = CartProfiles::default();
        let outcome = rename_channels(&raw_cart2_table(), &profiles, "Cart 2 Temp").unwrap();

        assert!(outcome.warnings.is_empty());
        let table = outcome.value;
        assert_eq!(
            table.labels(),
            vec![
                "0.6 ft (°C)",
                "1.8 ft (°C)",
                "3.6 ft (°C)",
                "3.6 ft b (°C)",
                "5.4 ft (°C)",
                "5.4 ft b (°C)",
                "7.2 ft (°C)",
                "9.0 ft (°C)",
            ]
        );
        // AI0 is the 5.4 ft sensor on cart 2
        assert_eq!(table.value(1, "5.4 ft (°C)"), Some(0.5));
        assert_eq!(table.timestamps(), &[ts(0), ts(1)]);
        assert!(!table.has_column("Sample"));
    }

    #[test]
    fn test_unknown_profile() {
        let err = rename_channels(&raw_cart2_table(), &CartProfiles::default(), "Cart 9 Temp")
            .unwrap_err();
        assert_eq!(err, PipelineError::UnknownCartConfig("Cart 9 Temp".to_string()));
    }

    #[test]
    fn test_channel_mismatch_is_recoverable() {
        let table = TimeSeriesTable::new(
            vec![ts(0)],
            vec![
                Column::new("AI0 (°C)", some(&[20.0])),
                Column::new("AI1 (°C)", some(&[21.0])),
            ],
        )
        .unwrap();

        let outcome = rename_channels(&table, &CartProfiles::default(), "Cart 1 Temp").unwrap();
        assert_eq!(outcome.value.labels(), vec!["1.8 ft (°C)", "5.4 ft (°C)"]);
        match &outcome.warnings[0] {
            PipelineWarning::ChannelMismatch { profile, missing } => {
                assert_eq!(profile, "Cart 1 Temp");
                assert_eq!(missing.len(), 6);
                assert!(missing.contains(&"AI7 (°C)".to_string()));
            }
            other => panic!("unexpected warning: {:?}", other),
        }
    }

    #[test]
    fn test_already_labelled_and_legacy_columns() {
        let table = TimeSeriesTable::new(
            vec![ts(0)],
            vec![
                Column::new("0.0 ft (°C)", some(&[18.0])),
                Column::new("1.8 ft (°C)", some(&[19.0])),
            ],
        )
        .unwrap();

        let outcome = rename_channels(&table, &CartProfiles::default(), "Cart 1 Temp").unwrap();
        assert_eq!(outcome.value.value(0, "0.6 ft (°C)"), Some(18.0));
        assert_eq!(outcome.value.value(0, "1.8 ft (°C)"), Some(19.0));
    }

    #[test]
    fn test_cart_for_serial() {
        let profiles = CartProfiles::default();
        assert_eq!(profiles.cart_for_serial("1DE5504"), Some("Cart 2"));
        assert_eq!(profiles.cart_for_serial(" 21AD4B7 "), Some("Cart 1"));
        assert_eq!(profiles.cart_for_serial("FFFF"), None);
    }

    #[test]
    fn test_profiles_yaml_round_trip() {
        let profiles = CartProfiles::default();
        let yaml = serde_yaml::to_string(&profiles).unwrap();
        let parsed: CartProfiles = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.profiles, profiles.profiles);
    }
}
