//! zbackup-core: snapshot replication logic
//!
//! Provides the point-in-time model, snapshot naming, the thinning engine,
//! dataset selection and the sync planner. Nothing in here runs a command.

pub mod clock;
pub mod config;
pub mod error;
pub mod missing;
pub mod naming;
pub mod paths;
pub mod plan;
pub mod properties;
pub mod selection;
pub mod snapshot;
pub mod thinner;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::BackupConfig;
pub use error::{ConfigError, PlanError, ScheduleError, SelectionError};
pub use missing::{MissingPlan, MissingVerdict, judge_missing};
pub use naming::SnapshotNaming;
pub use plan::{CommonPoint, PlanOptions, ResumeVerdict, SyncPlan, plan_sync};
pub use properties::{DatasetKind, DatasetProperties};
pub use snapshot::{Bookmark, DatasetHistory, PitObject, PointInTime, Snapshot};
pub use thinner::{Thinned, Thinner, ThinnerRule, Timestamped};
