//! Host node: zfs operations on one machine
//!
//! A [`ZfsNode`] wraps a [`Runner`] with caches for everything it learned
//! about datasets, pools and supported command options. Queries always run,
//! even in readonly mode; mutations are skipped there and the caches are
//! updated as if they had succeeded.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};
use zbackup_core::paths::pool_of;
use zbackup_core::selection::{SelectionFilter, is_changed, resolve_rows};
use zbackup_core::{Clock, PitObject, SnapshotNaming, Thinner};
use zbackup_transport::{CmdLine, ExitCodes, RunOptions, RunOutput, Runner};

use crate::dataset::DatasetCache;
use crate::error::Result;

/// Send flags probed on every node
pub const SEND_PROBES: [&str; 3] = ["-L", "-e", "-c"];

/// Receive flags probed on every node
pub const RECV_PROBES: [&str; 1] = ["-s"];

/// Operand that never exists, so probes fail after option parsing
const PROBE_OPERAND: &str = "zbackup_option_test";

/// Exit code of zfs for usage errors, including unknown flags
const USAGE_EXIT_CODE: i32 = 2;

pub struct ZfsNode {
    runner: Arc<dyn Runner>,
    clock: Arc<dyn Clock>,
    naming: SnapshotNaming,
    pub(crate) datasets: Mutex<HashMap<String, DatasetCache>>,
    pub(crate) pools: Mutex<HashMap<String, Vec<String>>>,
    send_options: Mutex<Option<Vec<String>>>,
    recv_options: Mutex<Option<Vec<String>>>,
}

impl ZfsNode {
    #[must_use]
    pub fn new(runner: Arc<dyn Runner>, clock: Arc<dyn Clock>, naming: SnapshotNaming) -> Self {
        Self {
            runner,
            clock,
            naming,
            datasets: Mutex::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
            send_options: Mutex::new(None),
            recv_options: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        self.runner.label()
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.runner.is_readonly()
    }

    #[must_use]
    pub fn naming(&self) -> &SnapshotNaming {
        &self.naming
    }

    #[must_use]
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub(crate) fn runner(&self) -> &dyn Runner {
        self.runner.as_ref()
    }

    /// Run a command that changes nothing
    pub(crate) async fn query(&self, cmd: &CmdLine, options: RunOptions) -> Result<RunOutput> {
        let output = self.runner.run(cmd, options.readonly()).await?;
        Ok(output.unwrap_or_default())
    }

    /// Run a command that changes something; false when skipped
    pub(crate) async fn mutate(&self, cmd: &CmdLine, options: RunOptions) -> Result<bool> {
        Ok(self.runner.run(cmd, options).await?.is_some())
    }

    pub(crate) fn lock_datasets(&self) -> MutexGuard<'_, HashMap<String, DatasetCache>> {
        self.datasets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send flags this node's zfs understands
    ///
    /// # Errors
    /// Returns an error if a probe can't be run at all
    pub async fn supported_send_options(&self) -> Result<Vec<String>> {
        self.probe_cached(&self.send_options, "send", &SEND_PROBES).await
    }

    /// Receive flags this node's zfs understands
    ///
    /// # Errors
    /// Returns an error if a probe can't be run at all
    pub async fn supported_recv_options(&self) -> Result<Vec<String>> {
        self.probe_cached(&self.recv_options, "recv", &RECV_PROBES).await
    }

    async fn probe_cached(
        &self,
        cache: &Mutex<Option<Vec<String>>>,
        verb: &str,
        flags: &[&str],
    ) -> Result<Vec<String>> {
        let cached = cache.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let mut supported = Vec::new();
        for &flag in flags {
            let cmd = CmdLine::new(["zfs", verb, flag, PROBE_OPERAND]);
            let output = self
                .query(&cmd, RunOptions::new().valid_exit_codes(ExitCodes::any()).hide_errors())
                .await?;
            if output.exit_code == USAGE_EXIT_CODE {
                debug!("[{}] zfs {verb} {flag}: not supported", self.label());
            } else {
                supported.push(flag.to_string());
            }
        }

        *cache.lock().unwrap_or_else(PoisonError::into_inner) = Some(supported.clone());
        Ok(supported)
    }

    /// Datasets selected by `property`, in tree order.
    ///
    /// With `exclude_unchanged` above zero, datasets that wrote fewer bytes
    /// since their last snapshot are dropped too.
    ///
    /// # Errors
    /// Returns an error if the property can't be listed or has bad values
    pub async fn selected_datasets(
        &self,
        property: &str,
        filter: &SelectionFilter,
        exclude_unchanged: u64,
    ) -> Result<Vec<String>> {
        debug!("[{}] Getting selected datasets", self.label());
        let cmd = CmdLine::new([
            "zfs",
            "get",
            "-t",
            "volume,filesystem",
            "-o",
            "name,value,source",
            "-H",
            property,
        ]);
        let output = self.query(&cmd, RunOptions::new()).await?;
        let candidates = resolve_rows(&output.rows())?;

        let mut selected = Vec::new();
        for candidate in candidates {
            let verdict = candidate.verdict(filter);
            if !verdict.is_selected() {
                debug!("[{}] {}: {verdict:?}", self.label(), candidate.name);
                continue;
            }
            if exclude_unchanged > 0 {
                let written = self.properties(&candidate.name).await?.written;
                if !is_changed(written, exclude_unchanged) {
                    info!("[{}] {}: excluded, unchanged", self.label(), candidate.name);
                    continue;
                }
            }
            info!("[{}] {}: selected", self.label(), candidate.name);
            selected.push(candidate.name);
        }
        Ok(selected)
    }

    /// Snapshot all changed `datasets` with one command per pool.
    ///
    /// A dataset counts as changed if it wrote at least `min_change` bytes
    /// since our newest snapshot of it. Returns the new suffix, or `None` if
    /// nothing changed anywhere.
    ///
    /// # Errors
    /// Returns an error if listing or snapshotting fails
    pub async fn atomic_snapshot(&self, datasets: &[String], min_change: u64) -> Result<Option<String>> {
        let suffix = self.naming.suffix_at(self.now());
        let mut pools: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for dataset in datasets {
            let history = self.history(dataset).await?;
            if history.find_snapshot(&suffix).is_some() {
                warn!("[{}] {dataset}@{suffix} already exists", self.label());
                continue;
            }
            if min_change > 0
                && let Some(last) = history.our_snapshots().last()
            {
                let written = self.written_since(dataset, &last.suffix).await?;
                if !is_changed(written, min_change) {
                    info!("[{}] {dataset}: no changes since {}", self.label(), last.suffix);
                    continue;
                }
            }
            pools.entry(pool_of(dataset)).or_default().push(dataset);
        }

        if pools.is_empty() {
            info!("[{}] No changes anywhere: not creating snapshots", self.label());
            return Ok(None);
        }

        for (pool, members) in pools {
            info!("[{}] Creating snapshots {suffix} in pool {pool}", self.label());
            let cmd = CmdLine::new(["zfs", "snapshot"])
                .args(members.iter().map(|dataset| format!("{dataset}@{suffix}")));
            let ran = self.mutate(&cmd, RunOptions::new()).await?;
            for dataset in members {
                self.record_snapshot(dataset, &suffix, ran);
            }
        }
        Ok(Some(suffix))
    }

    /// Destroy our snapshots of `dataset` that `thinner` doesn't keep.
    ///
    /// The newest one always stays. With `skip_holds`, held snapshots are
    /// left alone. Returns how many were destroyed.
    ///
    /// # Errors
    /// Returns an error if listing or destroying fails
    pub async fn thin_dataset(&self, dataset: &str, thinner: &Thinner, skip_holds: bool) -> Result<usize> {
        let history = self.history(dataset).await?;
        let ours: Vec<_> = history.our_snapshots().cloned().collect();
        let Some(last) = ours.last() else {
            return Ok(0);
        };

        let thinned = thinner.thin(&ours, std::slice::from_ref(last), self.now());
        let mut destroyed = 0;
        for obsolete in &thinned.removes {
            if skip_holds && !self.holds(&obsolete.name()).await?.is_empty() {
                debug!("[{}] {}: keeping, held", self.label(), obsolete.name());
                continue;
            }
            self.destroy(obsolete).await?;
            destroyed += 1;
        }
        Ok(destroyed)
    }
}
