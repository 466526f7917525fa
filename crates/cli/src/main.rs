//! zbackup: snapshot-based ZFS backup and replication
//!
//! Selects datasets by a user property, snapshots them atomically per pool,
//! sends them incrementally to a target (locally or over ssh) and thins
//! old snapshots on both sides according to a retention schedule.

mod debug_log;
mod progress;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Args, Parser, Subcommand, builder::Styles};
use color_eyre::Result;
use tracing::{debug, error, info, warn};

use zbackup_core::{BackupConfig, SystemClock, Thinner};
use zbackup_transport::{ExecuteNode, SshTarget};
use zbackup_zfs::{BackupJob, JobReport, ZfsNode};

use crate::progress::RunProgress;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

/// Exit status for configuration errors, fatal errors and interrupts
const EXIT_FATAL: u8 = 255;

#[derive(Parser)]
#[command(name = "zbackup")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Snapshot-based ZFS backup and replication")]
#[command(long_about = r#"
zbackup snapshots the datasets selected by a user property and replicates
them to another pool, locally or over ssh.

Select datasets with:
  zfs set autobackup:<name>=true pool/dataset

Examples:
  zbackup run offsite tank/backups --ssh-target root@nas   Snapshot and send
  zbackup run daily                                        Snapshot and thin only
  zbackup plan offsite tank/backups --format json          Show what would happen
  zbackup schedule 10,1d1w,1w1m,1m1y                       Explain a schedule
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory for the session log
    #[arg(long, global = true, env = "ZBACKUP_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot, replicate and thin
    Run(JobArgs),

    /// Show what a run would do without changing anything
    Plan {
        #[command(flatten)]
        job: JobArgs,

        /// Output format (summary, json)
        #[arg(short, long, default_value = "summary")]
        format: String,
    },

    /// Explain a thinning schedule
    Schedule {
        /// Schedule like `10,1d1w,1w1m,1m1y`
        schedule: String,
    },

    /// Show version and build info
    Version,
}

/// Job settings; flags override the config file
#[derive(Args, Debug, Default)]
struct JobArgs {
    /// Backup name, selects datasets with `autobackup:<name>`
    backup_name: Option<String>,

    /// Dataset to receive into; only snapshot and thin when omitted
    target_path: Option<String>,

    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source host as [user@]host[:port]
    #[arg(long)]
    ssh_source: Option<String>,

    /// Target host as [user@]host[:port]
    #[arg(long)]
    ssh_target: Option<String>,

    /// Source retention schedule
    #[arg(long)]
    keep_source: Option<String>,

    /// Target retention schedule
    #[arg(long)]
    keep_target: Option<String>,

    /// Leading source path components to drop on the target
    #[arg(long)]
    strip_path: Option<usize>,

    /// Destroy targets missing on the source after this grace period, e.g. 30d
    #[arg(long)]
    destroy_missing: Option<String>,

    /// Don't change anything
    #[arg(long)]
    test: bool,

    /// Stop at the first failure
    #[arg(long)]
    debug: bool,

    #[arg(long)]
    no_snapshot: bool,

    #[arg(long)]
    no_send: bool,

    #[arg(long)]
    no_thinning: bool,

    #[arg(long)]
    no_holds: bool,

    /// Keep a bookmark of the last sent snapshot instead of holding it
    #[arg(long)]
    use_bookmarks: bool,

    /// Show zfs send progress
    #[arg(long)]
    progress: bool,
}

impl JobArgs {
    /// Config file (or defaults) with the flags applied on top
    fn config(&self) -> Result<BackupConfig> {
        let mut config = match &self.config {
            Some(path) => BackupConfig::load(path)?,
            None => BackupConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(&self, config: &mut BackupConfig) {
        if let Some(name) = &self.backup_name {
            config.backup_name.clone_from(name);
        }
        if self.target_path.is_some() {
            config.target_path.clone_from(&self.target_path);
        }
        if self.ssh_source.is_some() {
            config.ssh_source.clone_from(&self.ssh_source);
        }
        if self.ssh_target.is_some() {
            config.ssh_target.clone_from(&self.ssh_target);
        }
        if let Some(keep) = &self.keep_source {
            config.keep_source.clone_from(keep);
        }
        if let Some(keep) = &self.keep_target {
            config.keep_target.clone_from(keep);
        }
        if let Some(strip) = self.strip_path {
            config.strip_path = strip;
        }
        if self.destroy_missing.is_some() {
            config.destroy_missing.clone_from(&self.destroy_missing);
        }
        config.test |= self.test;
        config.debug |= self.debug;
        config.no_snapshot |= self.no_snapshot;
        config.no_send |= self.no_send;
        config.no_thinning |= self.no_thinning;
        config.no_holds |= self.no_holds;
        config.use_bookmarks |= self.use_bookmarks;
        config.progress |= self.progress;
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let backup_name = match &cli.command {
        Commands::Run(job) | Commands::Plan { job, .. } => job.backup_name.as_deref(),
        _ => None,
    };
    let session = debug_log::init(&debug_log::LogOptions {
        verbose: cli.verbose,
        dir: cli.log_dir.as_deref(),
        backup_name,
    });
    debug!("Session {} logging to {}", session.session_id, session.log_path.display());

    let status = match cli.command {
        Commands::Version => {
            eprintln!("zbackup {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
            Ok(0)
        }
        Commands::Schedule { schedule } => schedule_command(&schedule),
        Commands::Run(job) => run_command(&job).await,
        Commands::Plan { job, format } => plan_command(&job, &format).await,
    };

    let code = status.unwrap_or_else(|err| {
        error!("{err:#}");
        EXIT_FATAL
    });
    Ok(ExitCode::from(code))
}

/// Failed dataset count as exit status
fn exit_status(failures: usize) -> u8 {
    u8::try_from(failures).unwrap_or(EXIT_FATAL)
}

fn schedule_command(schedule: &str) -> Result<u8> {
    let thinner = Thinner::parse(schedule)?;
    let lines = thinner.describe();
    if lines.is_empty() {
        eprintln!("Keep nothing but the newest snapshot.");
    }
    for line in lines {
        eprintln!("{line}");
    }
    Ok(0)
}

/// Host node for `ssh` (local if `None`) with the job's naming and mode
fn zfs_node(label: &str, ssh: Option<&str>, config: &BackupConfig) -> Result<ZfsNode> {
    let ssh = match ssh {
        Some(destination) => {
            let target: SshTarget = destination.parse()?;
            Some(match &config.ssh_config {
                Some(path) => target.with_config(path),
                None => target,
            })
        }
        None => None,
    };
    let runner = ExecuteNode::new(label, ssh, config.test);
    debug!("[{label}] {}", runner.description());
    Ok(ZfsNode::new(Arc::new(runner), Arc::new(SystemClock), config.naming()?))
}

fn build_job(config: BackupConfig) -> Result<BackupJob> {
    let source = zfs_node("Source", config.ssh_source.as_deref(), &config)?;
    let target = match &config.target_path {
        Some(_) => Some(zfs_node("Target", config.ssh_target.as_deref(), &config)?),
        None => None,
    };
    Ok(BackupJob::new(config, source, target)?)
}

/// Run the job until it finishes or ctrl-c; `None` when interrupted
async fn run_job(job: &BackupJob) -> Result<Option<JobReport>> {
    tokio::select! {
        report = job.run() => Ok(Some(report?)),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping");
            Ok(None)
        }
    }
}

async fn run_command(args: &JobArgs) -> Result<u8> {
    let config = args.config()?;
    if config.test {
        info!("Test mode: not changing anything");
    }
    let job = build_job(config)?;
    let progress = RunProgress::new();

    let Some(report) = run_job(&job).await? else {
        return Ok(EXIT_FATAL);
    };
    progress.finish(&report);
    Ok(exit_status(report.failures))
}

async fn plan_command(args: &JobArgs, format: &str) -> Result<u8> {
    let mut config = args.config()?;
    config.test = true;
    let job = build_job(config)?;

    let Some(report) = run_job(&job).await? else {
        return Ok(EXIT_FATAL);
    };
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => progress::print_plan(&report),
    }
    Ok(exit_status(report.failures))
}
