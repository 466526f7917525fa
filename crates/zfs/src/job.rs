//! One backup run: select, snapshot, sync, clean up
//!
//! Dataset failures are logged and counted and the run continues with the
//! next dataset, unless `debug` asks to stop at the first one. Selection,
//! snapshot and target naming errors abort the whole run.

use serde::Serialize;
use tracing::{debug, error, info, warn};
use zbackup_core::paths::target_names;
use zbackup_core::selection::{SelectionFilter, is_below};
use zbackup_core::{BackupConfig, MissingPlan, MissingVerdict, PitObject, Thinner, judge_missing};

use crate::error::{Result, ZfsError};
use crate::node::ZfsNode;
use crate::sync::{DatasetSync, SyncReport};

/// Outcome of the destroy-missing check for one target dataset
#[derive(Debug, Clone, Serialize)]
pub struct MissingReport {
    pub dataset: String,
    #[serde(flatten)]
    pub plan: MissingPlan,
}

/// Everything a run did, for summaries and `plan` output
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobReport {
    /// Suffix of the snapshots taken, if any
    pub snapshot: Option<String>,
    pub selected: Vec<String>,
    pub synced: Vec<SyncReport>,
    pub missing: Vec<MissingReport>,
    pub failures: usize,
}

pub struct BackupJob {
    config: BackupConfig,
    source: ZfsNode,
    target: Option<ZfsNode>,
    source_thinner: Option<Thinner>,
    target_thinner: Option<Thinner>,
}

impl BackupJob {
    /// # Errors
    /// Returns an error if the config doesn't validate
    pub fn new(config: BackupConfig, source: ZfsNode, target: Option<ZfsNode>) -> Result<Self> {
        config.validate()?;
        let source_thinner = config.source_thinner()?;
        let target_thinner = config.target_thinner()?;
        Ok(Self {
            config,
            source,
            target,
            source_thinner,
            target_thinner,
        })
    }

    #[must_use]
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Count a dataset failure, or stop the run in debug mode
    fn fail(&self, report: &mut JobReport, dataset: &str, err: ZfsError) -> Result<()> {
        error!("{dataset}: FAILED: {err}");
        report.failures += 1;
        if self.config.debug { Err(err) } else { Ok(()) }
    }

    /// # Errors
    /// Returns an error if nothing is selected, selection or snapshotting
    /// fails, target names collide, or in debug mode on any failure
    pub async fn run(&self) -> Result<JobReport> {
        let property = self.config.property_name();
        let filter = SelectionFilter {
            exclude_paths: self.config.exclude_paths.clone(),
            exclude_received: self.config.exclude_received,
        };
        let selected = self
            .source
            .selected_datasets(&property, &filter, self.config.exclude_unchanged)
            .await?;
        if selected.is_empty() {
            return Err(ZfsError::NothingSelected { property });
        }

        let mut report = JobReport {
            selected: selected.clone(),
            ..JobReport::default()
        };

        if self.config.no_snapshot {
            debug!("Not taking snapshots");
        } else {
            report.snapshot = self
                .source
                .atomic_snapshot(&selected, self.config.effective_min_change())
                .await?;
        }

        match (&self.target, &self.config.target_path) {
            (Some(target), Some(target_path)) => {
                self.sync_all(target, target_path, &selected, &mut report).await?;
            }
            _ => self.thin_sources(&selected, &mut report).await?,
        }

        if report.failures > 0 {
            warn!("{} dataset(s) failed", report.failures);
        }
        Ok(report)
    }

    async fn thin_sources(&self, selected: &[String], report: &mut JobReport) -> Result<()> {
        let Some(thinner) = &self.source_thinner else {
            return Ok(());
        };
        for dataset in selected {
            if let Err(err) = self.source.thin_dataset(dataset, thinner, true).await {
                self.fail(report, dataset, err)?;
            }
        }
        Ok(())
    }

    async fn sync_all(
        &self,
        target: &ZfsNode,
        target_path: &str,
        selected: &[String],
        report: &mut JobReport,
    ) -> Result<()> {
        let pairs = target_names(selected, target_path, self.config.strip_path)?;
        let sync = DatasetSync::new(
            &self.source,
            target,
            &self.config,
            self.source_thinner.as_ref(),
            self.target_thinner.as_ref(),
        );

        for (source_name, target_name) in &pairs {
            info!("{source_name} -> {target_name}");
            match sync.sync(source_name, target_name).await {
                Ok(synced) => report.synced.push(synced),
                Err(err) => self.fail(report, source_name, err)?,
            }
        }

        if !target.exists(target_path).await? {
            return Ok(());
        }
        let used: Vec<&str> = pairs.iter().map(|(_, target)| target.as_str()).collect();
        let missing: Vec<String> = target
            .descendants(target_path, true)
            .await?
            .into_iter()
            .filter(|dataset| !used.iter().any(|used| is_below(used, dataset)))
            .collect();

        if let Some(thinner) = &self.target_thinner {
            for dataset in &missing {
                debug!("{dataset}: missing on source, thinning");
                if let Err(err) = target.thin_dataset(dataset, thinner, false).await {
                    self.fail(report, dataset, err)?;
                }
            }
        }

        if let Some(grace) = self.config.grace_period()? {
            // Deepest first, so parents may lose their last child
            for dataset in missing.iter().rev() {
                match self.destroy_missing(target, dataset, grace).await {
                    Ok(plan) => report.missing.push(MissingReport {
                        dataset: dataset.clone(),
                        plan,
                    }),
                    Err(err) => self.fail(report, dataset, err)?,
                }
            }
        }
        Ok(())
    }

    async fn destroy_missing(&self, target: &ZfsNode, dataset: &str, grace: i64) -> Result<MissingPlan> {
        let history = target.history(dataset).await?;
        let has_children = !target.descendants(dataset, false).await?.is_empty();
        let hold_tag = self.config.hold_tag();

        let mut held = Vec::new();
        if history.our_snapshots().next().is_some() {
            for snapshot in &history.snapshots {
                if target.holds(&snapshot.name()).await?.iter().any(|tag| *tag != hold_tag) {
                    held.push(snapshot.suffix.clone());
                }
            }
        }

        let plan = judge_missing(&history, has_children, &held, grace, target.now());
        match plan.verdict {
            MissingVerdict::Ignore => debug!("{dataset}: missing on source, no snapshots of ours"),
            MissingVerdict::DestroyManually => {
                warn!("{dataset}: missing on source and has no snapshots of ours, destroy it manually");
            }
            MissingVerdict::Waiting { deadline } => {
                debug!("{dataset}: missing on source, destroying after {deadline}");
            }
            MissingVerdict::StillInUse => {
                warn!("{dataset}: missing on source, but still in use by other snapshots or holds");
            }
            MissingVerdict::StillHasChildren => {
                warn!("{dataset}: missing on source, but still has children");
            }
            MissingVerdict::Destroy => info!("{dataset}: missing on source, destroying"),
        }

        for snapshot in &plan.destroy_snapshots {
            if !self.config.no_holds {
                target.release(snapshot, &hold_tag).await?;
            }
            target.destroy(snapshot).await?;
        }
        if plan.destroy_dataset {
            target.destroy_dataset(dataset).await?;
        }
        Ok(plan)
    }
}
