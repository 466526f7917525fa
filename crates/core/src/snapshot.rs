//! Point-in-time objects: snapshots and bookmarks
//!
//! Both are identified by `<dataset><separator><suffix>` and share the
//! [`PitObject`] accessors. Order within a dataset is creation order
//! (`createtxg`), never timestamp order.

use serde::Serialize;

use crate::naming::SnapshotNaming;
use crate::thinner::Timestamped;

/// Shared accessors for snapshots and bookmarks
pub trait PitObject {
    fn dataset(&self) -> &str;
    fn suffix(&self) -> &str;
    /// Suffix without the tag
    fn base(&self) -> &str;
    fn tag(&self) -> Option<&str>;
    fn guid(&self) -> Option<u64>;
    fn createtxg(&self) -> u64;
    fn timestamp(&self) -> Option<i64>;
    /// `@` for snapshots, `#` for bookmarks
    fn separator(&self) -> char;

    /// Full zfs name
    fn name(&self) -> String {
        format!("{}{}{}", self.dataset(), self.separator(), self.suffix())
    }

    /// Made by us, i.e. the suffix carries one of our timestamps
    fn is_ours(&self) -> bool {
        self.timestamp().is_some()
    }
}

/// A full point-in-time reference that can be sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub dataset: String,
    pub suffix: String,
    pub base: String,
    pub tag: Option<String>,
    pub timestamp: Option<i64>,
    pub guid: Option<u64>,
    /// Creation transaction group, 0 when unknown
    pub createtxg: u64,
    /// Bytes written since the previous snapshot
    pub written: Option<u64>,
}

impl Snapshot {
    #[must_use]
    pub fn new(dataset: &str, suffix: &str, naming: &SnapshotNaming) -> Self {
        let classified = naming.classify(suffix);
        Self {
            dataset: dataset.to_string(),
            suffix: suffix.to_string(),
            base: classified.base,
            tag: classified.tag,
            timestamp: classified.timestamp,
            guid: None,
            createtxg: 0,
            written: None,
        }
    }

    #[must_use]
    pub fn with_guid(mut self, guid: u64) -> Self {
        self.guid = Some(guid);
        self
    }

    #[must_use]
    pub fn with_createtxg(mut self, createtxg: u64) -> Self {
        self.createtxg = createtxg;
        self
    }

    #[must_use]
    pub fn with_written(mut self, written: u64) -> Self {
        self.written = Some(written);
        self
    }

    /// The same snapshot as it will look on another dataset after a transfer.
    ///
    /// A received snapshot keeps its guid; local bookkeeping like `createtxg`
    /// and `written` is unknown until it exists.
    #[must_use]
    pub fn mirrored_on(&self, dataset: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            createtxg: 0,
            written: None,
            ..self.clone()
        }
    }
}

impl PitObject for Snapshot {
    fn dataset(&self) -> &str {
        &self.dataset
    }
    fn suffix(&self) -> &str {
        &self.suffix
    }
    fn base(&self) -> &str {
        &self.base
    }
    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
    fn guid(&self) -> Option<u64> {
        self.guid
    }
    fn createtxg(&self) -> u64 {
        self.createtxg
    }
    fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }
    fn separator(&self) -> char {
        '@'
    }
}

/// Thinning only ever sees our own snapshots, which all have a timestamp
impl Timestamped for Snapshot {
    fn created_at(&self) -> i64 {
        self.timestamp.unwrap_or_default()
    }
}

/// Lightweight lineage marker, usable as incremental source but not sendable
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bookmark {
    pub dataset: String,
    pub suffix: String,
    pub base: String,
    pub tag: Option<String>,
    pub timestamp: Option<i64>,
    pub guid: Option<u64>,
    pub createtxg: u64,
}

impl Bookmark {
    #[must_use]
    pub fn new(dataset: &str, suffix: &str, naming: &SnapshotNaming) -> Self {
        let classified = naming.classify(suffix);
        Self {
            dataset: dataset.to_string(),
            suffix: suffix.to_string(),
            base: classified.base,
            tag: classified.tag,
            timestamp: classified.timestamp,
            guid: None,
            createtxg: 0,
        }
    }

    /// Bookmark of `snapshot`, optionally tagged for one target
    #[must_use]
    pub fn of(snapshot: &Snapshot, tag: Option<&str>, naming: &SnapshotNaming) -> Self {
        let suffix = match tag {
            Some(tag) => naming.tagged(&snapshot.base, tag),
            None => snapshot.base.clone(),
        };
        Self {
            dataset: snapshot.dataset.clone(),
            base: snapshot.base.clone(),
            tag: tag.map(str::to_string),
            timestamp: snapshot.timestamp,
            guid: snapshot.guid,
            createtxg: snapshot.createtxg,
            suffix,
        }
    }

    #[must_use]
    pub fn with_guid(mut self, guid: u64) -> Self {
        self.guid = Some(guid);
        self
    }

    #[must_use]
    pub fn with_createtxg(mut self, createtxg: u64) -> Self {
        self.createtxg = createtxg;
        self
    }
}

impl PitObject for Bookmark {
    fn dataset(&self) -> &str {
        &self.dataset
    }
    fn suffix(&self) -> &str {
        &self.suffix
    }
    fn base(&self) -> &str {
        &self.base
    }
    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
    fn guid(&self) -> Option<u64> {
        self.guid
    }
    fn createtxg(&self) -> u64 {
        self.createtxg
    }
    fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }
    fn separator(&self) -> char {
        '#'
    }
}

/// Either kind of point-in-time object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PointInTime {
    Snapshot(Snapshot),
    Bookmark(Bookmark),
}

impl PointInTime {
    #[must_use]
    pub fn as_snapshot(&self) -> Option<&Snapshot> {
        match self {
            Self::Snapshot(snapshot) => Some(snapshot),
            Self::Bookmark(_) => None,
        }
    }

    #[must_use]
    pub fn is_bookmark(&self) -> bool {
        matches!(self, Self::Bookmark(_))
    }

    fn inner(&self) -> &dyn PitObject {
        match self {
            Self::Snapshot(snapshot) => snapshot,
            Self::Bookmark(bookmark) => bookmark,
        }
    }
}

impl PitObject for PointInTime {
    fn dataset(&self) -> &str {
        self.inner().dataset()
    }
    fn suffix(&self) -> &str {
        self.inner().suffix()
    }
    fn base(&self) -> &str {
        self.inner().base()
    }
    fn tag(&self) -> Option<&str> {
        self.inner().tag()
    }
    fn guid(&self) -> Option<u64> {
        self.inner().guid()
    }
    fn createtxg(&self) -> u64 {
        self.inner().createtxg()
    }
    fn timestamp(&self) -> Option<i64> {
        PitObject::timestamp(self.inner())
    }
    fn separator(&self) -> char {
        self.inner().separator()
    }
}

impl From<Snapshot> for PointInTime {
    fn from(snapshot: Snapshot) -> Self {
        Self::Snapshot(snapshot)
    }
}

impl From<Bookmark> for PointInTime {
    fn from(bookmark: Bookmark) -> Self {
        Self::Bookmark(bookmark)
    }
}

/// Split `pool/fs@suffix` or `pool/fs#suffix` into dataset and suffix
#[must_use]
pub fn split_name(name: &str) -> Option<(&str, &str)> {
    name.split_once('@').or_else(|| name.split_once('#'))
}

/// Point-in-time history of one dataset, in creation order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatasetHistory {
    pub name: String,
    pub snapshots: Vec<Snapshot>,
    pub bookmarks: Vec<Bookmark>,
}

impl DatasetHistory {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Snapshots made by us
    pub fn our_snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter().filter(|snapshot| snapshot.is_ours())
    }

    #[must_use]
    pub fn find_snapshot(&self, suffix: &str) -> Option<&Snapshot> {
        self.snapshots.iter().find(|snapshot| snapshot.suffix == suffix)
    }

    /// Snapshots created after `createtxg`, oldest first
    pub fn snapshots_after(&self, createtxg: u64) -> impl Iterator<Item = &Snapshot> {
        self.snapshots
            .iter()
            .filter(move |snapshot| snapshot.createtxg > createtxg)
    }
}
