//! Sync planner: reconcile a source and a target history
//!
//! Planning is pure. Given both histories, the thinning schedules and the
//! current time it decides the common point, what is incompatible, what to
//! transfer and what can be destroyed before the first transfer. Executing
//! the plan is up to the caller.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::PlanError;
use crate::snapshot::{Bookmark, DatasetHistory, PitObject, PointInTime, Snapshot};
use crate::thinner::Thinner;

/// Knobs that change how histories are matched and what gets sent
#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// Also transfer snapshots that were not made by us
    pub also_other_snapshots: bool,
    /// Reject name matches whose guids differ
    pub guid_check: bool,
    /// Raw sends can't be received on top of any later snapshot
    pub raw: bool,
    /// Source snapshots matching any of these are never transferred
    pub exclude: Vec<Regex>,
    /// Tag of bookmarks made for this target
    pub bookmark_tag: Option<String>,
}

impl PlanOptions {
    #[must_use]
    pub fn new() -> Self {
        Self {
            also_other_snapshots: false,
            guid_check: true,
            raw: false,
            exclude: Vec::new(),
            bookmark_tag: None,
        }
    }

    fn is_excluded(&self, suffix: &str) -> bool {
        self.exclude.iter().any(|pattern| pattern.is_match(suffix))
    }

    fn guid_matches(&self, source: Option<u64>, target: Option<u64>) -> bool {
        if !self.guid_check {
            return true;
        }
        match (source, target) {
            (Some(source), Some(target)) => source == target,
            _ => true,
        }
    }
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// The newest point both sides share
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommonPoint {
    /// Snapshot or bookmark on the source, the first incremental base
    pub source: PointInTime,
    pub target: Snapshot,
}

/// Everything that has to happen to bring one target up to date
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub common: Option<CommonPoint>,
    /// Source snapshots the source schedule no longer wants
    pub source_obsoletes: Vec<Snapshot>,
    /// Target snapshots (existing or still to be received) the target
    /// schedule no longer wants
    pub target_obsoletes: Vec<Snapshot>,
    pub target_keeps: Vec<Snapshot>,
    /// Source snapshots to send, in creation order
    pub transfers: Vec<Snapshot>,
    /// Target snapshots that diverge from the common point
    pub incompatible: Vec<Snapshot>,
    /// Source snapshots that can go before the first transfer
    pub pre_clean_source: Vec<Snapshot>,
    /// Existing target snapshots that can go before the first transfer
    pub pre_clean_target: Vec<Snapshot>,
}

impl SyncPlan {
    /// Nothing to send and nothing to destroy
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.transfers.is_empty()
            && self.incompatible.is_empty()
            && self.pre_clean_source.is_empty()
            && self.pre_clean_target.is_empty()
    }

    #[must_use]
    pub fn is_source_obsolete(&self, suffix: &str) -> bool {
        self.source_obsoletes.iter().any(|s| s.suffix == suffix)
    }

    #[must_use]
    pub fn is_target_obsolete(&self, suffix: &str) -> bool {
        self.target_obsoletes.iter().any(|s| s.suffix == suffix)
    }
}

/// Plan the sync of `source` onto `target`.
///
/// A schedule of `None` keeps everything on that side. `target` may be empty
/// when the target dataset doesn't exist yet.
///
/// # Errors
/// Returns [`PlanError::NoCommonPoint`] if the target has snapshots but none
/// of them can be linked to the source.
pub fn plan_sync(
    source: &DatasetHistory,
    target: &DatasetHistory,
    source_thinner: Option<&Thinner>,
    target_thinner: Option<&Thinner>,
    now: i64,
    options: &PlanOptions,
) -> Result<SyncPlan, PlanError> {
    let common = find_common_point(source, target, options)?;
    let incompatible = incompatible_snapshots(target, common.as_ref(), options.raw);

    let source_obsoletes = match source_thinner {
        Some(thinner) => {
            let ours: Vec<Snapshot> = source.our_snapshots().cloned().collect();
            match ours.last() {
                Some(last) => thinner.thin(&ours, std::slice::from_ref(last), now).removes,
                None => Vec::new(),
            }
        }
        None => Vec::new(),
    };

    // Compatible target snapshots that already carry the name stay as they are
    let on_target = |suffix: &str| {
        target
            .find_snapshot(suffix)
            .is_some_and(|existing| !incompatible.contains(existing))
    };
    let wanted: Vec<&Snapshot> = source_after_common(source, common.as_ref())
        .into_iter()
        .filter(|snapshot| options.also_other_snapshots || snapshot.is_ours())
        .filter(|snapshot| !on_target(&snapshot.suffix))
        .filter(|snapshot| {
            let excluded = options.is_excluded(&snapshot.suffix);
            if excluded {
                debug!("{}: excluded by pattern", snapshot.name());
            }
            !excluded
        })
        .collect();

    // Thin the target as it would look after every wanted snapshot arrived
    let mut candidates: Vec<Snapshot> = target
        .our_snapshots()
        .filter(|snapshot| !incompatible.contains(snapshot))
        .cloned()
        .collect();
    candidates.extend(
        wanted
            .iter()
            .filter(|snapshot| snapshot.is_ours())
            .map(|snapshot| snapshot.mirrored_on(&target.name)),
    );

    let newest = candidates.last().cloned();
    let (target_keeps, target_obsoletes) = match (target_thinner, newest) {
        (Some(thinner), Some(newest)) => {
            let thinned = thinner.thin(&candidates, &[newest], now);
            (thinned.keeps, thinned.removes)
        }
        _ => (candidates, Vec::new()),
    };

    let transfers: Vec<Snapshot> = wanted
        .into_iter()
        .filter(|snapshot| !target_obsoletes.iter().any(|o| o.suffix == snapshot.suffix))
        .cloned()
        .collect();

    let common_source_suffix = common
        .as_ref()
        .and_then(|c| c.source.as_snapshot())
        .map(|s| s.suffix.as_str());
    let pre_clean_source = source_obsoletes
        .iter()
        .filter(|s| Some(s.suffix.as_str()) != common_source_suffix)
        .filter(|s| !transfers.iter().any(|t| t.suffix == s.suffix))
        .cloned()
        .collect();

    let common_target_suffix = common.as_ref().map(|c| c.target.suffix.as_str());
    let pre_clean_target = target_obsoletes
        .iter()
        .filter(|s| target.find_snapshot(&s.suffix).is_some())
        .filter(|s| Some(s.suffix.as_str()) != common_target_suffix)
        .cloned()
        .collect();

    Ok(SyncPlan {
        common,
        source_obsoletes,
        target_obsoletes,
        target_keeps,
        transfers,
        incompatible,
        pre_clean_source,
        pre_clean_target,
    })
}

/// Source snapshots newer than the common point, all of them without one
fn source_after_common<'a>(
    source: &'a DatasetHistory,
    common: Option<&CommonPoint>,
) -> Vec<&'a Snapshot> {
    let Some(common) = common else {
        return source.snapshots.iter().collect();
    };

    match &common.source {
        PointInTime::Snapshot(snapshot) => match source.snapshots.iter().position(|s| s == snapshot) {
            Some(index) => source.snapshots[index + 1..].iter().collect(),
            None => source.snapshots_after(snapshot.createtxg).collect(),
        },
        PointInTime::Bookmark(bookmark) => source.snapshots_after(bookmark.createtxg).collect(),
    }
}

/// Walk the target newest to oldest and find the first snapshot the source
/// can send incrementally from.
///
/// # Errors
/// Returns [`PlanError::NoCommonPoint`] if the target has snapshots but none
/// match.
pub fn find_common_point(
    source: &DatasetHistory,
    target: &DatasetHistory,
    options: &PlanOptions,
) -> Result<Option<CommonPoint>, PlanError> {
    if target.snapshots.is_empty() {
        return Ok(None);
    }

    for target_snapshot in target.snapshots.iter().rev() {
        let found = match_bookmark(source, target_snapshot, options)
            .or_else(|| match_name(source, target_snapshot, options))
            .or_else(|| match_guid(source, target_snapshot));

        if let Some(point) = found {
            debug!("{}: common point {}", target.name, point.name());
            return Ok(Some(CommonPoint {
                source: point,
                target: target_snapshot.clone(),
            }));
        }
    }

    Err(PlanError::NoCommonPoint {
        source_dataset: source.name.clone(),
        target: target.name.clone(),
    })
}

fn match_bookmark(
    source: &DatasetHistory,
    target_snapshot: &Snapshot,
    options: &PlanOptions,
) -> Option<PointInTime> {
    let mut bookmarks: Vec<&Bookmark> = source
        .bookmarks
        .iter()
        .filter(|b| b.base == target_snapshot.base)
        .collect();
    // Our own tag first, then untagged, then bookmarks of other targets
    bookmarks.sort_by_key(|b| match (&b.tag, &options.bookmark_tag) {
        (Some(tag), Some(ours)) if tag == ours => 0,
        (None, _) => 1,
        _ => 2,
    });

    for bookmark in bookmarks {
        if options.guid_matches(bookmark.guid, target_snapshot.guid) {
            return Some(bookmark.clone().into());
        }
        warn!("{}: bookmark has a different guid than {}, ignoring", bookmark.name(), target_snapshot.name());
    }
    None
}

fn match_name(
    source: &DatasetHistory,
    target_snapshot: &Snapshot,
    options: &PlanOptions,
) -> Option<PointInTime> {
    let snapshot = source.find_snapshot(&target_snapshot.suffix)?;
    if options.guid_matches(snapshot.guid, target_snapshot.guid) {
        Some(snapshot.clone().into())
    } else {
        warn!("{}: common snapshot has invalid guid, ignoring", snapshot.name());
        None
    }
}

fn match_guid(source: &DatasetHistory, target_snapshot: &Snapshot) -> Option<PointInTime> {
    let guid = target_snapshot.guid?;
    if let Some(snapshot) = source.snapshots.iter().find(|s| s.guid == Some(guid)) {
        return Some(snapshot.clone().into());
    }
    source
        .bookmarks
        .iter()
        .find(|b| b.guid == Some(guid))
        .map(|b| b.clone().into())
}

/// Target snapshots after the common point that a receive would clobber.
///
/// Without raw sends a snapshot only counts once it or an earlier one after
/// the common point has data written; unknown sizes count as written.
#[must_use]
pub fn incompatible_snapshots(
    target: &DatasetHistory,
    common: Option<&CommonPoint>,
    raw: bool,
) -> Vec<Snapshot> {
    let Some(common) = common else {
        return Vec::new();
    };
    let Some(index) = target
        .snapshots
        .iter()
        .position(|s| s.suffix == common.target.suffix)
    else {
        return Vec::new();
    };

    let after = &target.snapshots[index + 1..];
    if raw {
        return after.to_vec();
    }
    match after.iter().position(|s| s.written != Some(0)) {
        Some(first) => after[first..].to_vec(),
        None => Vec::new(),
    }
}

/// What a resume token points at, from `zfs send -n -v -t <token>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeTarget {
    pub suffix: String,
    pub guid: Option<u64>,
}

/// Parse the dry-run replay of a resume token
#[must_use]
pub fn parse_resume_replay(output: &str) -> Option<ResumeTarget> {
    static TONAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"toname = .*@(.*)").expect("valid regex"));
    static TOGUID: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"toguid = (?:0x)?([0-9a-fA-F]+)").expect("valid regex"));

    let mut suffix = None;
    let mut guid = None;
    for line in output.lines() {
        if suffix.is_none()
            && let Some(captures) = TONAME.captures(line)
        {
            suffix = Some(captures[1].trim().to_string());
        }
        if guid.is_none()
            && let Some(captures) = TOGUID.captures(line)
        {
            guid = u64::from_str_radix(&captures[1], 16).ok();
        }
    }

    suffix.map(|suffix| ResumeTarget { suffix, guid })
}

/// Decision about an existing resume token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeVerdict {
    /// Token continues the first planned transfer
    Resume,
    /// Nothing left to transfer, abort it
    Obsolete,
    /// Token points at something else, abort it
    Stale,
}

/// Check a replayed token against the first planned transfer
#[must_use]
pub fn check_resume(replayed: Option<&ResumeTarget>, start: Option<&Snapshot>) -> ResumeVerdict {
    let Some(start) = start else {
        return ResumeVerdict::Obsolete;
    };
    let Some(replayed) = replayed else {
        return ResumeVerdict::Stale;
    };

    let guid_ok = match (replayed.guid, start.guid) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    };
    if replayed.suffix == start.suffix && guid_ok {
        ResumeVerdict::Resume
    } else {
        ResumeVerdict::Stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::SnapshotNaming;

    const DAY: i64 = 86_400;

    fn naming() -> SnapshotNaming {
        SnapshotNaming::new("test", "{}-%Y%m%d%H%M%S", "_", true).unwrap()
    }

    /// Our snapshot taken on `day`, guid and createtxg derived from it
    fn snap(dataset: &str, day: i64) -> Snapshot {
        let naming = naming();
        Snapshot::new(dataset, &naming.suffix_at(day * DAY), &naming)
            .with_guid(day as u64)
            .with_createtxg(day as u64 * 10)
            .with_written(4096)
    }

    fn history(name: &str, days: &[i64]) -> DatasetHistory {
        let mut history = DatasetHistory::new(name);
        history.snapshots = days.iter().map(|day| snap(name, *day)).collect();
        history
    }

    fn suffixes(snapshots: &[Snapshot]) -> Vec<String> {
        snapshots.iter().map(|s| s.suffix.clone()).collect()
    }

    fn suffix(day: i64) -> String {
        naming().suffix_at(day * DAY)
    }

    #[test]
    fn test_initial_transfer() {
        let source = history("src/a", &[1]);
        let target = DatasetHistory::new("dst/a");
        let plan = plan_sync(&source, &target, None, None, 2 * DAY, &PlanOptions::new()).unwrap();
        assert!(plan.common.is_none());
        assert_eq!(suffixes(&plan.transfers), vec![suffix(1)]);
        assert!(plan.incompatible.is_empty());
    }

    #[test]
    fn test_incremental_from_common() {
        let source = history("src/a", &[1, 2, 3]);
        let target = history("dst/a", &[1]);
        let plan = plan_sync(&source, &target, None, None, 4 * DAY, &PlanOptions::new()).unwrap();
        let common = plan.common.unwrap();
        assert_eq!(common.source.suffix(), suffix(1));
        assert_eq!(common.target.dataset, "dst/a");
        assert_eq!(suffixes(&plan.transfers), vec![suffix(2), suffix(3)]);
    }

    #[test]
    fn test_replan_after_sync_is_empty() {
        let source = history("src/a", &[1, 2, 3]);
        let target = history("dst/a", &[1, 2, 3]);
        let thinner = Thinner::parse("10,1d1w").unwrap();
        let plan = plan_sync(
            &source,
            &target,
            Some(&thinner),
            Some(&thinner),
            4 * DAY,
            &PlanOptions::new(),
        )
        .unwrap();
        assert!(plan.transfers.is_empty());
        assert!(plan.is_noop());
        assert_eq!(plan.common.unwrap().target.suffix, suffix(3));
    }

    #[test]
    fn test_name_match_with_wrong_guid_is_skipped() {
        let source = history("src/a", &[1, 2]);
        let mut target = history("dst/a", &[1, 2]);
        target.snapshots[1].guid = Some(99);

        let plan = plan_sync(&source, &target, None, None, 3 * DAY, &PlanOptions::new()).unwrap();
        assert_eq!(plan.common.unwrap().source.suffix(), suffix(1));
        assert_eq!(suffixes(&plan.incompatible), vec![suffix(2)]);

        let options = PlanOptions {
            guid_check: false,
            ..PlanOptions::new()
        };
        let plan = plan_sync(&source, &target, None, None, 3 * DAY, &options).unwrap();
        assert_eq!(plan.common.unwrap().source.suffix(), suffix(2));
    }

    #[test]
    fn test_bookmark_with_wrong_guid_falls_back() {
        let naming = naming();
        let mut source = history("src/a", &[1, 3]);
        let bookmark = Bookmark::of(&snap("src/a", 2), Some("nas"), &naming);
        source.bookmarks.push(bookmark);

        let mut target = history("dst/a", &[1, 2]);
        target.snapshots[1].guid = Some(77);

        let options = PlanOptions {
            bookmark_tag: Some("nas".to_string()),
            ..PlanOptions::new()
        };
        let plan = plan_sync(&source, &target, None, None, 4 * DAY, &options).unwrap();
        let common = plan.common.unwrap();
        assert!(!common.source.is_bookmark());
        assert_eq!(common.source.suffix(), suffix(1));
    }

    #[test]
    fn test_bookmark_with_wrong_guid_and_no_fallback_fails() {
        let naming = naming();
        let mut source = history("src/a", &[3]);
        source
            .bookmarks
            .push(Bookmark::of(&snap("src/a", 2), None, &naming));

        let mut target = history("dst/a", &[2]);
        target.snapshots[0].guid = Some(77);

        let err = plan_sync(&source, &target, None, None, 4 * DAY, &PlanOptions::new()).unwrap_err();
        assert_eq!(
            err,
            PlanError::NoCommonPoint {
                source_dataset: "src/a".to_string(),
                target: "dst/a".to_string(),
            }
        );
    }

    #[test]
    fn test_prefers_bookmark_tagged_for_target() {
        let naming = naming();
        let mut source = history("src/a", &[3]);
        let base = snap("src/a", 2);
        source.bookmarks.push(Bookmark::of(&base, None, &naming));
        source.bookmarks.push(Bookmark::of(&base, Some("other"), &naming));
        source.bookmarks.push(Bookmark::of(&base, Some("nas"), &naming));
        let target = history("dst/a", &[2]);

        let options = PlanOptions {
            bookmark_tag: Some("nas".to_string()),
            ..PlanOptions::new()
        };
        let plan = plan_sync(&source, &target, None, None, 4 * DAY, &options).unwrap();
        let common = plan.common.unwrap();
        assert!(common.source.is_bookmark());
        assert_eq!(common.source.tag(), Some("nas"));
        assert_eq!(suffixes(&plan.transfers), vec![suffix(3)]);
    }

    #[test]
    fn test_guid_search_finds_renamed_snapshot() {
        let naming = naming();
        let source = history("src/a", &[1, 2]);
        let mut target = DatasetHistory::new("dst/a");
        target
            .snapshots
            .push(Snapshot::new("dst/a", "renamed", &naming).with_guid(1));

        let plan = plan_sync(&source, &target, None, None, 3 * DAY, &PlanOptions::new()).unwrap();
        assert_eq!(plan.common.unwrap().source.suffix(), suffix(1));
        assert_eq!(suffixes(&plan.transfers), vec![suffix(2)]);
    }

    #[test]
    fn test_snapshots_already_on_target_are_not_sent() {
        let source = history("src/a", &[1, 2, 3]);
        let mut target = history("dst/a", &[1, 2]);
        target.snapshots[1].guid = Some(200);
        target.snapshots[1].written = Some(0);

        let thinner = Thinner::parse("10,1d1w").unwrap();
        let plan = plan_sync(&source, &target, None, Some(&thinner), 4 * DAY, &PlanOptions::new()).unwrap();
        assert_eq!(plan.common.unwrap().source.suffix(), suffix(1));
        assert!(plan.incompatible.is_empty());
        assert_eq!(suffixes(&plan.transfers), vec![suffix(3)]);
        assert_eq!(suffixes(&plan.target_keeps), vec![suffix(1), suffix(2), suffix(3)]);
    }

    #[test]
    fn test_unchanged_snapshots_after_common_are_compatible() {
        let source = history("src/a", &[1]);
        let mut target = history("dst/a", &[1, 2, 3]);
        target.snapshots[1].guid = Some(200);
        target.snapshots[1].written = Some(0);
        target.snapshots[2].guid = Some(300);
        target.snapshots[2].written = Some(0);

        let plan = plan_sync(&source, &target, None, None, 4 * DAY, &PlanOptions::new()).unwrap();
        assert!(plan.incompatible.is_empty());

        let raw = PlanOptions {
            raw: true,
            ..PlanOptions::new()
        };
        let plan = plan_sync(&source, &target, None, None, 4 * DAY, &raw).unwrap();
        assert_eq!(plan.incompatible.len(), 2);

        // Everything after the first changed snapshot is incompatible
        target.snapshots[1].written = Some(10);
        let plan = plan_sync(&source, &target, None, None, 4 * DAY, &PlanOptions::new()).unwrap();
        assert_eq!(suffixes(&plan.incompatible), vec![suffix(2), suffix(3)]);
    }

    #[test]
    fn test_thinning_and_pre_clean() {
        let source = history("src/a", &[1, 2, 3, 4]);
        let target = history("dst/a", &[1]);
        let keep_one = Thinner::parse("1").unwrap();
        let keep_two = Thinner::parse("2").unwrap();

        let plan = plan_sync(
            &source,
            &target,
            Some(&keep_one),
            Some(&keep_two),
            5 * DAY,
            &PlanOptions::new(),
        )
        .unwrap();

        assert_eq!(
            suffixes(&plan.source_obsoletes),
            vec![suffix(1), suffix(2), suffix(3)]
        );
        assert_eq!(suffixes(&plan.target_obsoletes), vec![suffix(1), suffix(2)]);
        assert_eq!(suffixes(&plan.target_keeps), vec![suffix(3), suffix(4)]);
        assert_eq!(suffixes(&plan.transfers), vec![suffix(3), suffix(4)]);
        // 1 is the common point, 3 is still to be sent
        assert_eq!(suffixes(&plan.pre_clean_source), vec![suffix(2)]);
        // 1 is the common point, 2 was never received
        assert!(plan.pre_clean_target.is_empty());
    }

    #[test]
    fn test_pre_clean_target_spares_common() {
        let source = history("src/a", &[1, 2, 3]);
        let target = history("dst/a", &[1, 2]);
        let keep_one = Thinner::parse("1").unwrap();

        let plan = plan_sync(&source, &target, None, Some(&keep_one), 4 * DAY, &PlanOptions::new()).unwrap();
        assert_eq!(suffixes(&plan.transfers), vec![suffix(3)]);
        assert_eq!(suffixes(&plan.target_obsoletes), vec![suffix(1), suffix(2)]);
        assert_eq!(suffixes(&plan.pre_clean_target), vec![suffix(1)]);
        assert!(plan.is_target_obsolete(&suffix(2)));
    }

    #[test]
    fn test_foreign_snapshots_only_on_request() {
        let naming = naming();
        let mut source = history("src/a", &[1]);
        source
            .snapshots
            .push(Snapshot::new("src/a", "manual", &naming).with_guid(50).with_createtxg(15));
        source.snapshots.push(snap("src/a", 2));
        let target = history("dst/a", &[1]);
        let thin_all = Thinner::parse("").unwrap();

        let plan = plan_sync(&source, &target, None, Some(&thin_all), 3 * DAY, &PlanOptions::new()).unwrap();
        assert_eq!(suffixes(&plan.transfers), vec![suffix(2)]);

        let options = PlanOptions {
            also_other_snapshots: true,
            ..PlanOptions::new()
        };
        let plan = plan_sync(&source, &target, None, Some(&thin_all), 3 * DAY, &options).unwrap();
        assert_eq!(suffixes(&plan.transfers), vec!["manual".to_string(), suffix(2)]);
        assert!(!plan.target_obsoletes.iter().any(|s| s.suffix == "manual"));
    }

    #[test]
    fn test_excluded_snapshots_are_not_sent() {
        let source = history("src/a", &[1, 2, 3]);
        let target = history("dst/a", &[1]);
        let options = PlanOptions {
            exclude: vec![Regex::new(&format!("^{}$", suffix(2))).unwrap()],
            ..PlanOptions::new()
        };
        let plan = plan_sync(&source, &target, None, None, 4 * DAY, &options).unwrap();
        assert_eq!(suffixes(&plan.transfers), vec![suffix(3)]);
    }

    #[test]
    fn test_parse_resume_replay() {
        let output = "resume token contents:\nnvlist version: 0\n\tobject = 0x6\n\ttoguid = 0xb748a92129d8ec8b\n\ttoname = pool/fs@test-19700102000000\nsend from @ to pool/fs@test-19700102000000 estimated size is 1.2M\n";
        let replayed = parse_resume_replay(output).unwrap();
        assert_eq!(replayed.suffix, "test-19700102000000");
        assert_eq!(replayed.guid, Some(0xb748_a921_29d8_ec8b));
        assert_eq!(parse_resume_replay("cannot resume send: token is corrupt"), None);
    }

    #[test]
    fn test_check_resume() {
        let start = snap("src/a", 2);
        let matching = ResumeTarget {
            suffix: start.suffix.clone(),
            guid: start.guid,
        };
        assert_eq!(check_resume(Some(&matching), Some(&start)), ResumeVerdict::Resume);
        assert_eq!(check_resume(Some(&matching), None), ResumeVerdict::Obsolete);
        assert_eq!(check_resume(None, Some(&start)), ResumeVerdict::Stale);

        let other_guid = ResumeTarget {
            guid: Some(12345),
            ..matching.clone()
        };
        assert_eq!(check_resume(Some(&other_guid), Some(&start)), ResumeVerdict::Stale);

        let other_name = ResumeTarget {
            suffix: suffix(3),
            guid: None,
        };
        assert_eq!(check_resume(Some(&other_name), Some(&start)), ResumeVerdict::Stale);
    }
}
