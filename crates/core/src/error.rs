//! Error types for schedules, configuration and sync planning

use thiserror::Error;

/// A thinning schedule could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Rule is not of the form `<amount><unit><amount><unit>`
    #[error("invalid schedule rule: '{rule}'")]
    InvalidRule { rule: String },

    /// Rule uses a unit that is not one of y, m, w, d, h, min, s
    #[error("invalid time unit '{unit}' in schedule rule '{rule}'")]
    InvalidUnit { rule: String, unit: String },

    /// Period is longer than the time to live
    #[error("period can't be longer than ttl in schedule rule '{rule}'")]
    PeriodExceedsTtl { rule: String },

    /// Leading keep count is negative
    #[error("number of snapshots to keep must be positive, got {count}")]
    NegativeKeep { count: i64 },
}

/// Invalid or contradictory configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Selection property lookups that don't make sense
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("{dataset}: selection property has illegal value '{value}'")]
    IllegalValue { dataset: String, value: String },

    #[error("{dataset}: selection property has illegal source '{source_name}'")]
    IllegalSource { dataset: String, source_name: String },

    #[error("{dataset}: inherits from unknown dataset '{ancestor}'")]
    UnknownAncestor { dataset: String, ancestor: String },

    #[error("malformed selection line: {line:?}")]
    MalformedLine { line: Vec<String> },
}

/// The planner could not reconcile the two histories
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// Target has snapshots but none of them can be linked to the source
    #[error(
        "{target}: can't find common snapshot or bookmark with source {source_dataset}, target must be recreated"
    )]
    NoCommonPoint {
        source_dataset: String,
        target: String,
    },

    /// Two source datasets map onto the same target after stripping
    #[error("target collision: {target} is reached from both {first} and {second}")]
    TargetCollision {
        target: String,
        first: String,
        second: String,
    },

    /// `strip_path` removes more components than the dataset has
    #[error("can't strip {count} path components from {dataset}")]
    StripTooMuch { dataset: String, count: usize },

    /// Target holds snapshots that diverge from the common point
    #[error(
        "{target}: {count} incompatible snapshot(s) after the common point, destroy them or enable destroy_incompatible"
    )]
    Incompatible { target: String, count: usize },
}
