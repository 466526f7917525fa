//! Dataset queries and mutations with per-dataset caching
//!
//! Every query result is memoized in a [`DatasetCache`]. A mutation that ran
//! invalidates the cache of the dataset it touched; a mutation skipped in
//! readonly mode patches the cache instead, so later steps see the state as
//! if it had run.

use tracing::{debug, info};
use zbackup_core::snapshot::split_name;
use zbackup_core::{Bookmark, DatasetHistory, DatasetProperties, PitObject, Snapshot, SnapshotNaming};
use zbackup_transport::{CmdLine, ExitCodes, RunOptions};

use crate::error::{Result, ZfsError};
use crate::node::ZfsNode;

/// Memoized metadata of one dataset
#[derive(Debug, Clone, Default)]
pub struct DatasetCache {
    pub exists: Option<bool>,
    pub properties: Option<DatasetProperties>,
    pub history: Option<DatasetHistory>,
}

impl DatasetCache {
    /// Forget everything
    pub fn invalidate(&mut self) {
        *self = Self::default();
    }
}

/// Build a history from `name guid createtxg written` rows in creation order
///
/// # Errors
/// Returns [`ZfsError::UnexpectedOutput`] for rows that don't have four
/// columns or don't name a snapshot or bookmark
pub fn parse_history(dataset: &str, rows: &[Vec<String>], naming: &SnapshotNaming) -> Result<DatasetHistory> {
    let mut history = DatasetHistory::new(dataset);

    for row in rows {
        let unexpected = || ZfsError::UnexpectedOutput {
            command: "zfs list".to_string(),
            line: row.join("\t"),
        };
        let [name, guid, createtxg, written] = row.as_slice() else {
            return Err(unexpected());
        };
        let (owner, suffix) = split_name(name).ok_or_else(unexpected)?;
        if owner != dataset {
            continue;
        }

        let guid = guid.parse::<u64>().ok();
        let createtxg = createtxg.parse::<u64>().unwrap_or_default();

        if name.contains('@') {
            let mut snapshot = Snapshot::new(dataset, suffix, naming).with_createtxg(createtxg);
            snapshot.guid = guid;
            snapshot.written = written.parse::<u64>().ok();
            history.snapshots.push(snapshot);
        } else {
            let mut bookmark = Bookmark::new(dataset, suffix, naming).with_createtxg(createtxg);
            bookmark.guid = guid;
            history.bookmarks.push(bookmark);
        }
    }

    Ok(history)
}

/// Names from a `zfs list -o name` listing, without `root` itself
fn listed_names(output: impl IntoIterator<Item = String>, root: &str) -> Vec<String> {
    output
        .into_iter()
        .map(|line| line.trim_end().to_string())
        .filter(|name| !name.is_empty() && name != root)
        .collect()
}

impl ZfsNode {
    fn cached<T>(&self, dataset: &str, get: impl FnOnce(&DatasetCache) -> Option<T>) -> Option<T> {
        self.lock_datasets().get(dataset).and_then(get)
    }

    fn update(&self, dataset: &str, change: impl FnOnce(&mut DatasetCache)) {
        change(self.lock_datasets().entry(dataset.to_string()).or_default());
    }

    /// Drop cached metadata of `dataset`
    pub fn invalidate(&self, dataset: &str) {
        debug!("[{}] {dataset}: invalidating cache", self.label());
        self.lock_datasets().remove(dataset);
    }

    /// After a mutation: invalidate if it ran, patch the cache if skipped
    fn settle(&self, dataset: &str, ran: bool, simulate: impl FnOnce(&mut DatasetCache)) {
        if ran {
            self.invalidate(dataset);
        } else {
            self.update(dataset, simulate);
        }
    }

    /// # Errors
    /// Returns an error if zfs can't be run
    pub async fn exists(&self, dataset: &str) -> Result<bool> {
        if let Some(exists) = self.cached(dataset, |c| c.exists) {
            return Ok(exists);
        }
        let cmd = CmdLine::new(["zfs", "list", "-H", "-o", "name", dataset]);
        let output = self
            .query(&cmd, RunOptions::new().valid_exit_codes(ExitCodes::new([0, 1])).hide_errors())
            .await?;
        let exists = output.exit_code == 0 && output.lines().any(|line| line == dataset);
        self.update(dataset, |c| c.exists = Some(exists));
        Ok(exists)
    }

    /// # Errors
    /// Returns an error if the properties can't be listed
    pub async fn properties(&self, dataset: &str) -> Result<DatasetProperties> {
        if let Some(properties) = self.cached(dataset, |c| c.properties.clone()) {
            return Ok(properties);
        }
        let cmd = CmdLine::new(["zfs", "get", "-H", "-p", "-o", "property,value", "all", dataset]);
        let rows = self.query(&cmd, RunOptions::new()).await?.rows();
        let properties = DatasetProperties::from_rows(
            rows.iter()
                .filter_map(|row| Some((row.first()?.as_str(), row.get(1)?.as_str()))),
        );
        self.update(dataset, |c| c.properties = Some(properties.clone()));
        Ok(properties)
    }

    /// Snapshots and bookmarks of `dataset` in creation order
    ///
    /// # Errors
    /// Returns an error if the dataset can't be listed
    pub async fn history(&self, dataset: &str) -> Result<DatasetHistory> {
        if let Some(history) = self.cached(dataset, |c| c.history.clone()) {
            return Ok(history);
        }
        debug!("[{}] {dataset}: listing snapshots and bookmarks", self.label());
        let cmd = CmdLine::new([
            "zfs",
            "list",
            "-H",
            "-p",
            "-d",
            "1",
            "-t",
            "snapshot,bookmark",
            "-o",
            "name,guid,createtxg,written",
            "-s",
            "createtxg",
            dataset,
        ]);
        let rows = self.query(&cmd, RunOptions::new()).await?.rows();
        let history = parse_history(dataset, &rows, self.naming())?;
        self.update(dataset, |c| c.history = Some(history.clone()));
        Ok(history)
    }

    /// Filesystems and volumes below `root`; direct children only unless
    /// `recursive`
    ///
    /// # Errors
    /// Returns an error if `root` can't be listed
    pub async fn descendants(&self, root: &str, recursive: bool) -> Result<Vec<String>> {
        let mut cmd = CmdLine::new(["zfs", "list", "-H", "-o", "name", "-t", "filesystem,volume", "-r"]);
        if !recursive {
            cmd = cmd.args(["-d", "1"]);
        }
        let output = self.query(&cmd.arg(root), RunOptions::new()).await?;
        Ok(listed_names(output.stdout, root))
    }

    /// Bytes `dataset` wrote since its snapshot `suffix`
    ///
    /// # Errors
    /// Returns an error if the property can't be read
    pub async fn written_since(&self, dataset: &str, suffix: &str) -> Result<Option<u64>> {
        let property = format!("written@{suffix}");
        let cmd = CmdLine::new(["zfs", "get", "-H", "-p", "-o", "value", property.as_str(), dataset]);
        let output = self.query(&cmd, RunOptions::new()).await?;
        Ok(output.lines().next().and_then(|line| line.parse().ok()))
    }

    /// Hold tags on a snapshot
    ///
    /// # Errors
    /// Returns an error if holds can't be listed
    pub async fn holds(&self, snapshot: &str) -> Result<Vec<String>> {
        let cmd = CmdLine::new(["zfs", "holds", "-H", snapshot]);
        let rows = self.query(&cmd, RunOptions::new()).await?.rows();
        Ok(rows.into_iter().filter_map(|row| row.get(1).cloned()).collect())
    }

    pub(crate) fn record_snapshot(&self, dataset: &str, suffix: &str, ran: bool) {
        let naming = self.naming().clone();
        self.settle(dataset, ran, |cache| {
            if let Some(history) = cache.history.as_mut() {
                let createtxg = history.snapshots.last().map_or(1, |s| s.createtxg + 1);
                history
                    .snapshots
                    .push(Snapshot::new(dataset, suffix, &naming).with_createtxg(createtxg));
            }
        });
    }

    /// Destroy a snapshot or bookmark
    ///
    /// # Errors
    /// Returns an error if zfs refuses
    pub async fn destroy<P: PitObject>(&self, pit: &P) -> Result<()> {
        let name = pit.name();
        info!("[{}] Destroying {name}", self.label());
        let ran = self.mutate(&CmdLine::new(["zfs", "destroy", name.as_str()]), RunOptions::new()).await?;

        let suffix = pit.suffix().to_string();
        let is_bookmark = pit.separator() == '#';
        self.settle(pit.dataset(), ran, |cache| {
            if let Some(history) = cache.history.as_mut() {
                if is_bookmark {
                    history.bookmarks.retain(|b| b.suffix != suffix);
                } else {
                    history.snapshots.retain(|s| s.suffix != suffix);
                }
            }
        });
        Ok(())
    }

    /// Destroy a dataset without snapshots
    ///
    /// # Errors
    /// Returns an error if zfs refuses
    pub async fn destroy_dataset(&self, dataset: &str) -> Result<()> {
        info!("[{}] Destroying dataset {dataset}", self.label());
        let ran = self.mutate(&CmdLine::new(["zfs", "destroy", dataset]), RunOptions::new()).await?;
        self.settle(dataset, ran, |cache| {
            cache.invalidate();
            cache.exists = Some(false);
        });
        Ok(())
    }

    /// Create `dataset` and missing parents, all unmountable
    ///
    /// # Errors
    /// Returns an error if zfs refuses
    pub async fn create_filesystem(&self, dataset: &str) -> Result<()> {
        info!("[{}] Creating unmountable {dataset}", self.label());
        let cmd = CmdLine::new(["zfs", "create", "-p", "-o", "canmount=off", dataset]);
        let ran = self.mutate(&cmd, RunOptions::new()).await?;
        self.settle(dataset, ran, |cache| {
            cache.exists = Some(true);
            cache.history = Some(DatasetHistory::new(dataset));
        });
        Ok(())
    }

    /// # Errors
    /// Returns an error if zfs refuses
    pub async fn hold(&self, snapshot: &Snapshot, tag: &str) -> Result<()> {
        debug!("[{}] Holding {} as {tag}", self.label(), snapshot.name());
        let cmd = CmdLine::new(["zfs", "hold", tag, snapshot.name().as_str()]);
        self.mutate(&cmd, RunOptions::new()).await?;
        Ok(())
    }

    /// Release our hold; a missing hold is fine
    ///
    /// # Errors
    /// Returns an error if zfs can't be run
    pub async fn release(&self, snapshot: &Snapshot, tag: &str) -> Result<()> {
        debug!("[{}] Releasing {} from {tag}", self.label(), snapshot.name());
        let cmd = CmdLine::new(["zfs", "release", tag, snapshot.name().as_str()]);
        self.mutate(
            &cmd,
            RunOptions::new().valid_exit_codes(ExitCodes::new([0, 1])).hide_errors(),
        )
        .await?;
        Ok(())
    }

    /// Bookmark `snapshot` as `bookmark`
    ///
    /// # Errors
    /// Returns an error if zfs refuses
    pub async fn bookmark(&self, snapshot: &Snapshot, bookmark: &Bookmark) -> Result<()> {
        info!("[{}] Bookmarking {} as {}", self.label(), snapshot.name(), bookmark.name());
        let cmd = CmdLine::new(["zfs", "bookmark", snapshot.name().as_str(), bookmark.name().as_str()]);
        let ran = self.mutate(&cmd, RunOptions::new()).await?;
        let bookmark = bookmark.clone();
        self.settle(&snapshot.dataset, ran, |cache| {
            if let Some(history) = cache.history.as_mut() {
                history.bookmarks.push(bookmark);
            }
        });
        Ok(())
    }

    /// Discard changes made after `snapshot`, which must be the newest
    ///
    /// # Errors
    /// Returns an error if zfs refuses
    pub async fn rollback(&self, snapshot: &Snapshot) -> Result<()> {
        info!("[{}] Rolling back to {}", self.label(), snapshot.name());
        let cmd = CmdLine::new(["zfs", "rollback", snapshot.name().as_str()]);
        let ran = self.mutate(&cmd, RunOptions::new()).await?;
        if ran {
            self.invalidate(&snapshot.dataset);
        }
        Ok(())
    }

    /// Abort a partially received stream
    ///
    /// # Errors
    /// Returns an error if zfs refuses
    pub async fn abort_resume(&self, dataset: &str) -> Result<()> {
        info!("[{}] {dataset}: aborting resumable receive", self.label());
        let ran = self
            .mutate(&CmdLine::new(["zfs", "recv", "-A", dataset]), RunOptions::new())
            .await?;
        self.settle(dataset, ran, |cache| {
            if let Some(properties) = cache.properties.as_mut() {
                properties.receive_resume_token = None;
            }
        });
        Ok(())
    }

    /// Patch the cache after a receive that was skipped, or invalidate it
    pub(crate) fn record_receive(&self, dataset: &str, snapshot: &Snapshot, ran: bool) {
        let received = snapshot.mirrored_on(dataset);
        self.settle(dataset, ran, |cache| {
            cache.exists = Some(true);
            let history = cache.history.get_or_insert_with(|| DatasetHistory::new(dataset));
            let createtxg = history.snapshots.last().map_or(1, |s| s.createtxg + 1);
            history.snapshots.push(received.with_createtxg(createtxg));
            if let Some(properties) = cache.properties.as_mut() {
                properties.receive_resume_token = None;
            }
        });
    }
}
