//! Sync driver: carries out a plan for one dataset pair
//!
//! Order of events: plan, deal with incompatible target snapshots, pre-clean
//! obsoletes, validate any resume token, then transfer snapshot by snapshot.
//! After every transfer the new common snapshot is held (or bookmarked)
//! before the previous one is released or destroyed.

use serde::Serialize;
use tracing::{debug, info, warn};
use zbackup_core::paths::{parent_of, pool_of};
use zbackup_core::plan::{ResumeVerdict, check_resume, parse_resume_replay};
use zbackup_core::properties::receive_properties;
use zbackup_core::{
    BackupConfig, Bookmark, DatasetHistory, DatasetProperties, PitObject, PlanError, PointInTime, Snapshot,
    SyncPlan, Thinner, plan_sync,
};
use zbackup_transport::{CmdLine, ExitCodes, RunOptions};

use crate::error::{Result, ZfsError};
use crate::node::ZfsNode;
use crate::pool::common_features;

/// Exit codes of `zfs send -n -v -t` for valid and invalid tokens
const REPLAY_EXIT_CODES: [i32; 2] = [0, 255];

/// Flags for the send and receive sides of every transfer of one dataset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferFlags {
    /// Send flags that apply to full, incremental and resumed sends
    pub send: Vec<String>,
    /// Send properties with the stream
    pub properties: bool,
    /// Commands piped after `zfs send`, in order
    pub send_pipes: Vec<Vec<String>>,
    /// Commands piped before `zfs recv`, in order
    pub recv_pipes: Vec<Vec<String>>,
    /// Receive flags before the target name
    pub recv: Vec<String>,
}

fn mbuffer(args: &[&str], extra: String) -> Vec<String> {
    let mut argv: Vec<String> = ["mbuffer", "-q", "-s128k"].iter().map(ToString::to_string).collect();
    argv.extend(args.iter().map(ToString::to_string));
    argv.push(extra);
    argv
}

fn words(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

impl TransferFlags {
    /// Work out the flags from settings and what both sides support.
    ///
    /// `features` are the pool features both sides share.
    #[must_use]
    pub fn new(
        config: &BackupConfig,
        raw: bool,
        features: &[String],
        send_options: &[String],
        recv_options: &[String],
        filter: &[String],
        set: &[String],
    ) -> Self {
        let has = |list: &[String], item: &str| list.iter().any(|i| i == item);

        let mut send = Vec::new();
        if has(features, "large_blocks") && has(send_options, "-L") {
            send.push("-L".to_string());
        }
        if !config.encrypt && has(features, "embedded_data") && has(send_options, "-e") {
            send.push("-e".to_string());
        }
        if config.zfs_compressed && has(send_options, "-c") {
            send.push("-c".to_string());
        }
        if raw {
            send.push("-w".to_string());
        }
        if config.progress {
            send.push("-v".to_string());
            send.push("-P".to_string());
        }

        let mut send_pipes = Vec::new();
        if let Some(buffer) = &config.buffer {
            send_pipes.push(mbuffer(&[], format!("-m{buffer}")));
        }
        send_pipes.extend(config.send_pipe.iter().map(|cmd| words(cmd)));
        if let Some(rate) = &config.rate {
            send_pipes.push(mbuffer(&["-m16M"], format!("-R{rate}")));
        }

        let mut recv_pipes: Vec<Vec<String>> = config.recv_pipe.iter().map(|cmd| words(cmd)).collect();
        if let Some(buffer) = &config.buffer {
            recv_pipes.push(mbuffer(&[], format!("-m{buffer}")));
        }

        let mut recv = vec!["-u".to_string()];
        for property in filter {
            recv.push("-x".to_string());
            recv.push(property.clone());
        }
        for assignment in set {
            recv.push("-o".to_string());
            recv.push(assignment.clone());
        }
        recv.push("-v".to_string());
        if has(features, "extensible_dataset") && has(recv_options, "-s") {
            recv.push("-s".to_string());
        }
        if config.force {
            recv.push("-F".to_string());
        }

        Self {
            send,
            properties: !config.decrypt,
            send_pipes,
            recv_pipes,
            recv,
        }
    }

    /// `zfs send` with its pipes; a resume token replaces everything else
    #[must_use]
    pub fn send_command(&self, snapshot: &Snapshot, base: Option<&PointInTime>, token: Option<&str>) -> CmdLine {
        let mut cmd = CmdLine::new(["zfs", "send"]).args(self.send.iter().cloned());
        match token {
            Some(token) => cmd = cmd.args(["-t", token]),
            None => {
                if self.properties {
                    cmd.push("-p");
                }
                if let Some(base) = base {
                    cmd = cmd.arg("-i").arg(base.name());
                }
                cmd.push(snapshot.name());
            }
        }
        for stage in &self.send_pipes {
            cmd = cmd.pipe().args(stage.iter().cloned());
        }
        cmd
    }

    /// `zfs recv` into `target`, after the receive pipes
    #[must_use]
    pub fn recv_command(&self, target: &str) -> CmdLine {
        let mut cmd = CmdLine::default();
        for stage in &self.recv_pipes {
            cmd = cmd.args(stage.iter().cloned()).pipe();
        }
        cmd.args(["zfs", "recv"]).args(self.recv.iter().cloned()).arg(target)
    }
}

/// What happened to one dataset pair
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub source: String,
    pub target: String,
    pub plan: SyncPlan,
    pub transferred: usize,
    pub resumed: bool,
}

impl SyncReport {
    fn new(source: &str, target: &str, plan: SyncPlan) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            plan,
            transferred: 0,
            resumed: false,
        }
    }
}

/// Syncs dataset pairs from one node to another with fixed settings
pub struct DatasetSync<'a> {
    source: &'a ZfsNode,
    target: &'a ZfsNode,
    config: &'a BackupConfig,
    source_thinner: Option<&'a Thinner>,
    target_thinner: Option<&'a Thinner>,
    hold_tag: String,
}

impl<'a> DatasetSync<'a> {
    #[must_use]
    pub fn new(
        source: &'a ZfsNode,
        target: &'a ZfsNode,
        config: &'a BackupConfig,
        source_thinner: Option<&'a Thinner>,
        target_thinner: Option<&'a Thinner>,
    ) -> Self {
        Self {
            source,
            target,
            config,
            source_thinner,
            target_thinner,
            hold_tag: config.hold_tag(),
        }
    }

    fn holds(&self) -> bool {
        !self.config.no_holds
    }

    /// Plan and carry out the sync of `source_name` to `target_name`.
    ///
    /// # Errors
    /// Returns the first error; earlier transfers stay done
    pub async fn sync(&self, source_name: &str, target_name: &str) -> Result<SyncReport> {
        let source_history = self.source.history(source_name).await?;
        let source_props = self.source.properties(source_name).await?;
        let target_exists = self.target.exists(target_name).await?;
        let target_history = if target_exists {
            self.target.history(target_name).await?
        } else {
            DatasetHistory::new(target_name)
        };

        let raw = source_props.is_encrypted() && !self.config.decrypt;
        let options = self.config.plan_options(raw)?;
        let plan = plan_sync(
            &source_history,
            &target_history,
            self.source_thinner,
            self.target_thinner,
            self.source.now(),
            &options,
        )?;
        self.log_plan(target_name, &plan);

        let done = |plan: SyncPlan| SyncReport::new(source_name, target_name, plan);

        if !plan.incompatible.is_empty() && !self.config.no_send {
            if !self.config.destroy_incompatible {
                for snapshot in &plan.incompatible {
                    warn!("[{}] Incompatible snapshot {}", self.target.label(), snapshot.name());
                }
                return Err(PlanError::Incompatible {
                    target: target_name.to_string(),
                    count: plan.incompatible.len(),
                }
                .into());
            }
            for snapshot in &plan.incompatible {
                self.target.destroy(snapshot).await?;
            }
        }

        for snapshot in &plan.pre_clean_source {
            self.source.destroy(snapshot).await?;
        }
        for snapshot in &plan.pre_clean_target {
            self.target.destroy(snapshot).await?;
        }

        if self.config.no_send {
            debug!("[{}] {target_name}: not sending", self.target.label());
            return Ok(done(plan));
        }

        let token = if target_exists {
            self.validate_resume(target_name, plan.transfers.first()).await?
        } else {
            None
        };
        let resumed = token.is_some();

        if plan.transfers.is_empty() {
            info!("[{}] {target_name}: up to date", self.target.label());
            return Ok(done(plan));
        }

        if !target_exists
            && let Some(parent) = parent_of(target_name)
            && !self.target.exists(parent).await?
        {
            self.target.create_filesystem(parent).await?;
        }

        let flags = self
            .transfer_flags(source_name, target_name, &source_props, raw)
            .await?;
        let transferred = self
            .transfer_all(source_name, target_name, &source_history, &plan, &flags, token, target_exists)
            .await?;

        let mut report = done(plan);
        report.transferred = transferred;
        report.resumed = resumed;
        Ok(report)
    }

    fn log_plan(&self, target_name: &str, plan: &SyncPlan) {
        let label = self.target.label();
        match &plan.common {
            Some(common) => debug!("[{label}] {target_name}: common point {}", common.source.name()),
            None => debug!("[{label}] {target_name}: no common point, full transfer"),
        }
        for snapshot in &plan.source_obsoletes {
            debug!("[{}] {}: obsolete", self.source.label(), snapshot.name());
        }
        for snapshot in &plan.target_obsoletes {
            debug!("[{label}] {target_name}@{}: obsolete", snapshot.suffix);
        }
        for snapshot in &plan.transfers {
            debug!("[{label}] {target_name}@{}: to transfer", snapshot.suffix);
        }
    }

    /// Keep a resume token that continues the first transfer, abort others
    async fn validate_resume(&self, target_name: &str, start: Option<&Snapshot>) -> Result<Option<String>> {
        let Some(token) = self.target.properties(target_name).await?.receive_resume_token else {
            return Ok(None);
        };

        let cmd = CmdLine::new(["zfs", "send", "-t", token.as_str(), "-n", "-v"]);
        let output = self
            .source
            .query(
                &cmd,
                RunOptions::new()
                    .valid_exit_codes(ExitCodes::new(REPLAY_EXIT_CODES))
                    .hide_errors(),
            )
            .await?;
        let lines = if output.stdout.is_empty() {
            &output.stderr
        } else {
            &output.stdout
        };
        let replayed = parse_resume_replay(&lines.join("\n"));

        match check_resume(replayed.as_ref(), start) {
            ResumeVerdict::Resume => {
                info!("[{}] {target_name}: resuming interrupted transfer", self.target.label());
                Ok(Some(token))
            }
            verdict => {
                warn!("[{}] {target_name}: resume token is {verdict:?}", self.target.label());
                self.target.abort_resume(target_name).await?;
                Ok(None)
            }
        }
    }

    async fn transfer_flags(
        &self,
        source_name: &str,
        target_name: &str,
        source_props: &DatasetProperties,
        raw: bool,
    ) -> Result<TransferFlags> {
        let source_features = self.source.pool_features(pool_of(source_name)).await?;
        let target_features = self.target.pool_features(pool_of(target_name)).await?;
        let features = common_features(&source_features, &target_features);
        let send_options = self.source.supported_send_options().await?;
        let recv_options = self.target.supported_recv_options().await?;
        let (filter, set) = receive_properties(
            source_props.kind,
            &self.config.receive_filter(),
            &self.config.receive_set(),
            self.config.encrypt,
        );
        Ok(TransferFlags::new(
            self.config,
            raw,
            &features,
            &send_options,
            &recv_options,
            &filter,
            &set,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn transfer_all(
        &self,
        source_name: &str,
        target_name: &str,
        source_history: &DatasetHistory,
        plan: &SyncPlan,
        flags: &TransferFlags,
        mut token: Option<String>,
        target_exists: bool,
    ) -> Result<usize> {
        let mut base: Option<PointInTime> = plan.common.as_ref().map(|c| c.source.clone());
        let mut prev_source: Option<Snapshot> = base.as_ref().and_then(|b| b.as_snapshot().cloned());
        let mut prev_target: Option<Snapshot> = plan.common.as_ref().map(|c| c.target.clone());
        let tag = self.config.tag.as_deref();
        let mut stale_bookmarks: Vec<Bookmark> = source_history
            .bookmarks
            .iter()
            .filter(|b| b.is_ours() && b.tag() == tag)
            .cloned()
            .collect();
        let mut rollback = self.config.rollback && target_exists;
        let mut transferred = 0;

        for snapshot in &plan.transfers {
            if rollback {
                let history = self.target.history(target_name).await?;
                if let Some(newest) = history.snapshots.last() {
                    self.target.rollback(newest).await?;
                }
                rollback = false;
            }

            self.receive(snapshot, target_name, base.as_ref(), token.take(), flags)
                .await?;
            transferred += 1;
            let received = snapshot.mirrored_on(target_name);

            if self.holds() {
                self.target.hold(&received, &self.hold_tag).await?;
            }
            if self.config.use_bookmarks {
                let bookmark = Bookmark::of(snapshot, tag, self.source.naming());
                self.source.bookmark(snapshot, &bookmark).await?;
                for stale in stale_bookmarks.drain(..) {
                    if stale.suffix != bookmark.suffix {
                        self.source.destroy(&stale).await?;
                    }
                }
                stale_bookmarks.push(bookmark);
            } else if self.holds() {
                self.source.hold(snapshot, &self.hold_tag).await?;
            }

            if let Some(prev) = prev_source.take() {
                if self.holds() && !self.config.use_bookmarks {
                    self.source.release(&prev, &self.hold_tag).await?;
                }
                if plan.is_source_obsolete(&prev.suffix) {
                    self.source.destroy(&prev).await?;
                }
            }
            if let Some(prev) = prev_target.take() {
                if self.holds() {
                    self.target.release(&prev, &self.hold_tag).await?;
                }
                if plan.is_target_obsolete(&prev.suffix) {
                    self.target.destroy(&prev).await?;
                }
            }

            base = Some(snapshot.clone().into());
            prev_source = Some(snapshot.clone());
            prev_target = Some(received);
        }

        debug!("[{}] {source_name}: {transferred} snapshot(s) sent", self.source.label());
        Ok(transferred)
    }

    /// One `zfs send | zfs recv`, then check the target really exists
    async fn receive(
        &self,
        snapshot: &Snapshot,
        target_name: &str,
        base: Option<&PointInTime>,
        token: Option<String>,
        flags: &TransferFlags,
    ) -> Result<()> {
        let label = self.target.label();
        match (&token, base) {
            (Some(_), _) => info!("[{label}] {target_name}@{}: resuming", snapshot.suffix),
            (None, Some(base)) => info!(
                "[{label}] {target_name}@{}: incremental from {}",
                snapshot.suffix,
                base.suffix()
            ),
            (None, None) => info!("[{label}] {target_name}@{}: full transfer", snapshot.suffix),
        }

        let send = flags.send_command(snapshot, base, token.as_deref());
        let mut send_options = RunOptions::new().readonly();
        if !self.config.progress {
            send_options = send_options.hide_errors();
        }
        let pipe = self.source.runner().pipe(&send, send_options);

        let codes = if self.config.ignore_transfer_errors {
            ExitCodes::any()
        } else {
            ExitCodes::default()
        };
        let recv = flags.recv_command(target_name);
        let ran = self
            .target
            .mutate(&recv, RunOptions::new().input_pipe(pipe).valid_exit_codes(codes))
            .await?;

        self.target.record_receive(target_name, snapshot, ran);
        if !self.target.exists(target_name).await? {
            return Err(ZfsError::MissingAfterReceive {
                dataset: target_name.to_string(),
            });
        }
        Ok(())
    }
}
