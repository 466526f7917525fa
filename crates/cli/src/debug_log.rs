//! Session log for zbackup runs
//!
//! Every invocation writes a trace log to
//! `<log dir>/zbackup-<backup name>-<session id>.log` with every zfs command
//! line, exit code and cache decision. The console only shows `info` (or
//! `debug` with `--verbose`), so cron mail stays short while the file keeps
//! the whole story.

use std::path::{Path, PathBuf};

use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Overrides the file filter, `RUST_LOG` syntax
const FILTER_ENV: &str = "ZBACKUP_LOG";

/// Transport logs every command it runs at trace; the planners log their
/// decisions at debug.
const DEFAULT_FILTER: &str =
    "warn,zbackup=debug,zbackup_core=debug,zbackup_zfs=debug,zbackup_transport=trace";

/// Keeps the file logger flushing until dropped
pub struct DebugLogGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

pub struct SessionInfo {
    pub session_id: uuid::Uuid,
    pub log_path: PathBuf,
    pub guard: DebugLogGuard,
}

pub struct LogOptions<'a> {
    pub verbose: bool,
    /// Defaults to the system temp dir
    pub dir: Option<&'a Path>,
    /// Backup name, so logs of different jobs are easy to tell apart
    pub backup_name: Option<&'a str>,
}

fn log_filename(backup_name: Option<&str>, session_id: &uuid::Uuid) -> String {
    match backup_name.filter(|name| !name.is_empty()) {
        Some(name) => {
            let name: String = name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
                .collect();
            format!("zbackup-{name}-{session_id}.log")
        }
        None => format!("zbackup-{session_id}.log"),
    }
}

/// Install the file and console layers.
///
/// Keep the returned guard alive for the whole run.
pub fn init(options: &LogOptions<'_>) -> SessionInfo {
    let session_id = uuid::Uuid::new_v4();
    let dir = options.dir.map_or_else(std::env::temp_dir, Path::to_path_buf);
    let log_filename = log_filename(options.backup_name, &session_id);
    let log_path = dir.join(&log_filename);

    let file_appender = tracing_appender::rolling::never(&dir, &log_filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_filter = tracing_subscriber::EnvFilter::try_from_env(FILTER_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .with_filter(file_filter);

    let console_level = if options.verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    };
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(console::Term::stderr)
        .with_ansi(console::colors_enabled_stderr())
        .with_target(false)
        .without_time()
        .with_filter(console_level);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    SessionInfo {
        session_id,
        log_path,
        guard: DebugLogGuard { _guard: guard },
    }
}
