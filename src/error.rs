//! Failure and warning taxonomy shared by every pipeline stage.
//!
//! Conditions that prevent a stage from producing a well-defined output are
//! [`PipelineError`]s. Conditions that still yield a usable (if sparse)
//! result are [`PipelineWarning`]s and travel next to the value in an
//! [`Outcome`].

use std::fmt;

use chrono::NaiveDateTime;
use thiserror::Error;

/// Stage failures surfaced to the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// A companion column needed by a derived quantity is absent.
    #[error("missing dependency: column '{column}' is required but not present")]
    MissingDependency { column: String },

    /// The requested channel profile does not exist in the configuration.
    #[error("unknown cart configuration: '{0}'")]
    UnknownCartConfig(String),

    /// Two merge sources report a value for the same column at the same instant.
    #[error("ambiguous column '{column}': more than one source has a value at {timestamp}")]
    AmbiguousColumn {
        column: String,
        timestamp: NaiveDateTime,
    },

    /// The position track has no usable samples.
    #[error("no position data available")]
    NoPositionData,

    /// Nothing to aggregate.
    #[error("empty extent: {0}")]
    EmptyExtent(String),

    /// `merge_tables` was called without any input table.
    #[error("no source tables to merge")]
    NoSources,

    /// A column the caller asked for by name does not exist.
    #[error("column not found: '{0}'")]
    MissingColumn(String),

    /// A column's length differs from the table's timestamp axis.
    #[error("column '{column}' has {found} values, expected {expected}")]
    ShapeMismatch {
        column: String,
        expected: usize,
        found: usize,
    },

    /// The same label appears twice in one table.
    #[error("duplicate column label: '{0}'")]
    DuplicateColumn(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for pipeline stages.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Recoverable conditions reported alongside a stage output.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineWarning {
    /// Raw channels named by the profile were not found in the input table.
    ChannelMismatch {
        profile: String,
        missing: Vec<String>,
    },
    /// Rows left without a position because no GPS sample was close enough.
    UnmatchedPositions { rows: usize, total: usize },
    /// Humidity results outside [0, 100] (flagged, not clipped).
    HumidityOutOfRange { column: String, rows: usize },
    /// Duplicate timestamps dropped while building a table.
    DuplicateTimestamps { dropped: usize },
}

impl fmt::Display for PipelineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineWarning::ChannelMismatch { profile, missing } => write!(
                f,
                "channel mismatch for '{}': missing {}",
                profile,
                missing.join(", ")
            ),
            PipelineWarning::UnmatchedPositions { rows, total } => write!(
                f,
                "{} of {} rows have no position within the allowed gap",
                rows, total
            ),
            PipelineWarning::HumidityOutOfRange { column, rows } => {
                write!(f, "{} rows of '{}' fall outside 0-100 %RH", rows, column)
            }
            PipelineWarning::DuplicateTimestamps { dropped } => {
                write!(f, "{} duplicate timestamps dropped", dropped)
            }
        }
    }
}

/// A stage output together with the warnings raised while producing it.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub warnings: Vec<PipelineWarning>,
}

impl<T> Outcome<T> {
    /// Wrap a value that was produced without warnings.
    pub fn clean(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(value: T, warnings: Vec<PipelineWarning>) -> Self {
        Self { value, warnings }
    }

    /// Transform the value, keeping the warnings.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            warnings: self.warnings,
        }
    }

    pub fn into_parts(self) -> (T, Vec<PipelineWarning>) {
        (self.value, self.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_display() {
        let w = PipelineWarning::ChannelMismatch {
            profile: "Cart 1 Temp".to_string(),
            missing: vec!["AI6 (°C)".to_string(), "AI7 (°C)".to_string()],
        };
        assert_eq!(
            w.to_string(),
            "channel mismatch for 'Cart 1 Temp': missing AI6 (°C), AI7 (°C)"
        );
    }

    #[test]
    fn test_outcome_map_keeps_warnings() {
        let outcome = Outcome::with_warnings(2, vec![PipelineWarning::DuplicateTimestamps { dropped: 1 }]);
        let mapped = outcome.map(|v| v * 10);
        assert_eq!(mapped.value, 20);
        assert_eq!(mapped.warnings.len(), 1);
    }
}
