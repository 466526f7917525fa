//! Destroying target datasets that disappeared from the source
//!
//! A missing dataset is only removed once the newest snapshot we made on it
//! is older than the grace period, and never while someone else still uses it.

use serde::Serialize;

use crate::error::ScheduleError;
use crate::snapshot::{DatasetHistory, PitObject, Snapshot};
use crate::thinner::ThinnerRule;

/// Grace period in seconds from a duration like `30d` or `0s`
///
/// # Errors
/// Returns an error if `grace` is not an amount followed by a unit
pub fn grace_period(grace: &str) -> Result<i64, ScheduleError> {
    Ok(ThinnerRule::parse(&format!("0s{grace}"))?.ttl)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MissingVerdict {
    /// No snapshots of ours, but children that might be ours
    Ignore,
    /// No snapshots of ours on a leaf dataset
    DestroyManually,
    /// Grace period not over yet
    Waiting { deadline: i64 },
    /// Foreign snapshots or holds remain after removing ours
    StillInUse,
    /// Child datasets remain after removing our snapshots
    StillHasChildren,
    Destroy,
}

/// What to do with one missing target dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingPlan {
    pub verdict: MissingVerdict,
    /// Snapshots to destroy, oldest first
    pub destroy_snapshots: Vec<Snapshot>,
    pub destroy_dataset: bool,
}

impl MissingPlan {
    fn keep(verdict: MissingVerdict) -> Self {
        Self {
            verdict,
            destroy_snapshots: Vec::new(),
            destroy_dataset: false,
        }
    }
}

/// Decide the fate of a target dataset that no longer has a source.
///
/// `held` lists the suffixes of snapshots carrying a hold that isn't ours;
/// those are never destroyed.
#[must_use]
pub fn judge_missing(
    history: &DatasetHistory,
    has_children: bool,
    held: &[String],
    grace: i64,
    now: i64,
) -> MissingPlan {
    let ours: Vec<&Snapshot> = history.our_snapshots().collect();
    let Some(last) = ours.last() else {
        return MissingPlan::keep(if has_children {
            MissingVerdict::Ignore
        } else {
            MissingVerdict::DestroyManually
        });
    };

    let deadline = last.timestamp().unwrap_or_default().saturating_add(grace);
    if deadline > now {
        return MissingPlan::keep(MissingVerdict::Waiting { deadline });
    }

    let all_but_last: Vec<Snapshot> = ours[..ours.len() - 1]
        .iter()
        .filter(|s| !held.contains(&s.suffix))
        .map(|s| (*s).clone())
        .collect();
    let has_foreign = history.snapshots.iter().any(|s| !s.is_ours());

    if has_foreign || !held.is_empty() {
        return MissingPlan {
            verdict: MissingVerdict::StillInUse,
            destroy_snapshots: all_but_last,
            destroy_dataset: false,
        };
    }
    if has_children {
        return MissingPlan {
            verdict: MissingVerdict::StillHasChildren,
            destroy_snapshots: all_but_last,
            destroy_dataset: false,
        };
    }

    MissingPlan {
        verdict: MissingVerdict::Destroy,
        destroy_snapshots: ours.into_iter().cloned().collect(),
        destroy_dataset: true,
    }
}
