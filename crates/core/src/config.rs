//! Backup job configuration (zbackup.toml)

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::missing::grace_period;
use crate::naming::SnapshotNaming;
use crate::plan::PlanOptions;
use crate::thinner::Thinner;

/// Default retention on both sides
pub const DEFAULT_SCHEDULE: &str = "10,1d1w,1w1m,1m1y";

/// One backup job. Every field has a default so a config file only needs
/// to name what differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Name used in the selection property, snapshot names and hold tags
    pub backup_name: String,

    /// `[user@]host[:port]` to reach the source, local if unset
    pub ssh_source: Option<String>,
    /// `[user@]host[:port]` to reach the target, local if unset
    pub ssh_target: Option<String>,
    /// Custom ssh config file
    pub ssh_config: Option<String>,

    /// Where to receive; only snapshot and thin the source when unset
    pub target_path: Option<String>,

    pub keep_source: String,
    pub keep_target: String,

    /// Selection property, `{}` is the backup name
    pub property_format: String,
    /// Snapshot name, `{}` is the backup name, the rest is strftime
    pub snapshot_format: String,
    /// Hold tag, `{}` is the backup name
    pub hold_format: String,
    /// Tag appended to bookmarks made for this target
    pub tag: Option<String>,
    pub tag_separator: String,
    pub utc: bool,

    /// Number of leading source path components to drop on the target
    pub strip_path: usize,
    /// Also transfer snapshots we didn't make
    pub other_snapshots: bool,
    pub no_snapshot: bool,
    pub no_send: bool,
    pub no_thinning: bool,
    pub no_holds: bool,
    /// Keep a bookmark of the last transferred snapshot on the source
    pub use_bookmarks: bool,

    /// Only snapshot datasets with at least this many bytes written
    pub min_change: u64,
    /// Snapshot even when nothing changed
    pub allow_empty: bool,
    pub exclude_received: bool,
    /// Skip datasets with fewer bytes written since their last snapshot, 0 disables
    pub exclude_unchanged: u64,
    /// Datasets below these paths are never selected
    pub exclude_paths: Vec<String>,
    /// Regexes of snapshot names never transferred
    pub exclude_snapshots: Vec<String>,

    pub destroy_incompatible: bool,
    /// Grace period like `30d` before destroying targets missing on the source
    pub destroy_missing: Option<String>,
    /// Roll back the target to its latest snapshot before receiving
    pub rollback: bool,
    /// Receive with `-F`
    pub force: bool,
    pub ignore_transfer_errors: bool,

    /// Send decrypted data
    pub decrypt: bool,
    /// Encrypt on the target under its encryption root
    pub encrypt: bool,
    /// Send compressed blocks as is
    pub zfs_compressed: bool,

    /// Properties to filter on receive (`-x`)
    pub filter_properties: Vec<String>,
    /// Properties to set on receive (`-o name=value`)
    pub set_properties: Vec<String>,
    pub clear_refreservation: bool,
    pub clear_mountpoint: bool,

    /// Shell commands the send stream passes through on the source
    pub send_pipe: Vec<String>,
    /// Shell commands the stream passes through on the target
    pub recv_pipe: Vec<String>,
    /// mbuffer size like `1G`
    pub buffer: Option<String>,
    /// Rate limit like `10M`
    pub rate: Option<String>,
    pub progress: bool,

    pub no_guid_check: bool,
    /// Don't change anything, just show what would happen
    pub test: bool,
    /// Stop at the first failure
    pub debug: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_name: String::new(),
            ssh_source: None,
            ssh_target: None,
            ssh_config: None,
            target_path: None,
            keep_source: DEFAULT_SCHEDULE.to_string(),
            keep_target: DEFAULT_SCHEDULE.to_string(),
            property_format: "autobackup:{}".to_string(),
            snapshot_format: "{}-%Y%m%d%H%M%S".to_string(),
            hold_format: "zbackup:{}".to_string(),
            tag: None,
            tag_separator: "_".to_string(),
            utc: false,
            strip_path: 0,
            other_snapshots: false,
            no_snapshot: false,
            no_send: false,
            no_thinning: false,
            no_holds: false,
            use_bookmarks: false,
            min_change: 1,
            allow_empty: false,
            exclude_received: false,
            exclude_unchanged: 0,
            exclude_paths: Vec::new(),
            exclude_snapshots: Vec::new(),
            destroy_incompatible: false,
            destroy_missing: None,
            rollback: false,
            force: false,
            ignore_transfer_errors: false,
            decrypt: false,
            encrypt: false,
            zfs_compressed: false,
            filter_properties: Vec::new(),
            set_properties: Vec::new(),
            clear_refreservation: false,
            clear_mountpoint: false,
            send_pipe: Vec::new(),
            recv_pipe: Vec::new(),
            buffer: None,
            rate: None,
            progress: false,
            no_guid_check: false,
            test: false,
            debug: false,
        }
    }
}

fn format_with_name(format: &str, name: &str) -> String {
    format.replace("{}", name)
}

impl BackupConfig {
    /// Load config from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file can't be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    /// Check everything that can be checked without touching a pool.
    ///
    /// # Errors
    /// Returns the first invalid or contradictory setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backup_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "backup_name",
                message: "must not be empty".to_string(),
            });
        }
        if self.backup_name.contains(['/', '@', '#', ' ']) {
            return Err(ConfigError::Invalid {
                field: "backup_name",
                message: format!("'{}' contains characters not allowed in snapshot names", self.backup_name),
            });
        }
        if self.encrypt && self.decrypt {
            return Err(ConfigError::Invalid {
                field: "encrypt",
                message: "can't be combined with decrypt".to_string(),
            });
        }
        for (field, format) in [
            ("property_format", &self.property_format),
            ("hold_format", &self.hold_format),
        ] {
            if !format.contains("{}") {
                return Err(ConfigError::Invalid {
                    field,
                    message: format!("'{format}' has no {{}} placeholder for the backup name"),
                });
            }
        }
        if let Some(tag) = &self.tag
            && (tag.is_empty() || tag.contains(&self.tag_separator))
        {
            return Err(ConfigError::Invalid {
                field: "tag",
                message: format!("'{tag}' must be non-empty and must not contain '{}'", self.tag_separator),
            });
        }

        self.naming()?;
        Thinner::parse(&self.keep_source)?;
        Thinner::parse(&self.keep_target)?;
        self.grace_period()?;
        self.exclude_patterns()?;
        Ok(())
    }

    /// Name of the zfs user property that selects datasets
    #[must_use]
    pub fn property_name(&self) -> String {
        format_with_name(&self.property_format, &self.backup_name)
    }

    #[must_use]
    pub fn hold_tag(&self) -> String {
        format_with_name(&self.hold_format, &self.backup_name)
    }

    /// # Errors
    /// Returns an error for an invalid snapshot format or tag separator.
    pub fn naming(&self) -> Result<SnapshotNaming, ConfigError> {
        SnapshotNaming::new(
            &self.backup_name,
            &self.snapshot_format,
            &self.tag_separator,
            self.utc,
        )
    }

    /// Source schedule, `None` when thinning is disabled
    ///
    /// # Errors
    /// Returns an error for an invalid schedule.
    pub fn source_thinner(&self) -> Result<Option<Thinner>, ConfigError> {
        self.thinner(&self.keep_source)
    }

    /// Target schedule, `None` when thinning is disabled
    ///
    /// # Errors
    /// Returns an error for an invalid schedule.
    pub fn target_thinner(&self) -> Result<Option<Thinner>, ConfigError> {
        self.thinner(&self.keep_target)
    }

    fn thinner(&self, schedule: &str) -> Result<Option<Thinner>, ConfigError> {
        if self.no_thinning {
            return Ok(None);
        }
        Ok(Some(Thinner::parse(schedule)?))
    }

    /// Bytes a dataset must have written before it gets a new snapshot
    #[must_use]
    pub fn effective_min_change(&self) -> u64 {
        if self.allow_empty { 0 } else { self.min_change }
    }

    /// Grace period for destroying missing targets, `None` when disabled
    ///
    /// # Errors
    /// Returns an error if the duration can't be parsed.
    pub fn grace_period(&self) -> Result<Option<i64>, ConfigError> {
        match &self.destroy_missing {
            Some(grace) => Ok(Some(grace_period(grace)?)),
            None => Ok(None),
        }
    }

    fn exclude_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        self.exclude_snapshots
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| ConfigError::Invalid {
                    field: "exclude_snapshots",
                    message: format!("'{pattern}': {e}"),
                })
            })
            .collect()
    }

    /// Planner options for a transfer; `raw` depends on the source dataset.
    ///
    /// # Errors
    /// Returns an error for invalid exclude patterns.
    pub fn plan_options(&self, raw: bool) -> Result<PlanOptions, ConfigError> {
        Ok(PlanOptions {
            also_other_snapshots: self.other_snapshots,
            guid_check: !self.no_guid_check,
            raw,
            exclude: self.exclude_patterns()?,
            bookmark_tag: self.tag.clone(),
        })
    }

    /// Properties to filter on receive, including the shortcuts
    #[must_use]
    pub fn receive_filter(&self) -> Vec<String> {
        let mut filter = self.filter_properties.clone();
        if self.clear_refreservation && !filter.iter().any(|p| p == "refreservation") {
            filter.push("refreservation".to_string());
        }
        filter
    }

    /// Properties to set on receive, including the shortcuts
    #[must_use]
    pub fn receive_set(&self) -> Vec<String> {
        let mut set = self.set_properties.clone();
        if self.clear_mountpoint && !set.iter().any(|p| p.starts_with("canmount=")) {
            set.push("canmount=noauto".to_string());
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config(name: &str) -> BackupConfig {
        BackupConfig {
            backup_name: name.to_string(),
            ..BackupConfig::default()
        }
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
backup_name = "offsite"
ssh_target = "backup@nas"
target_path = "tank/backups"
keep_target = "10,1d1m"
strip_path = 1
exclude_paths = ["rpool/tmp"]
use_bookmarks = true
tag = "nas"
"#;

        let config: BackupConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.backup_name, "offsite");
        assert_eq!(config.ssh_target.as_deref(), Some("backup@nas"));
        assert_eq!(config.ssh_source, None);
        assert_eq!(config.strip_path, 1);
        assert_eq!(config.keep_source, DEFAULT_SCHEDULE);
        assert_eq!(config.keep_target, "10,1d1m");
        assert!(config.use_bookmarks);
        assert_eq!(config.property_name(), "autobackup:offsite");
        assert_eq!(config.hold_tag(), "zbackup:offsite");
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_empty_config() {
        let config: BackupConfig = toml::from_str("").unwrap();
        assert_eq!(config, BackupConfig::default());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "backup_name", .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "backup_name = \"daily\"\nallow_empty = true").unwrap();

        let config = BackupConfig::load(file.path()).unwrap();
        assert_eq!(config.backup_name, "daily");
        assert_eq!(config.effective_min_change(), 0);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            BackupConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));

        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "strip_path = \"one\"").unwrap();
        assert!(matches!(BackupConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validate_rejects_contradictions() {
        let mut bad = config("x");
        bad.encrypt = true;
        bad.decrypt = true;
        assert!(matches!(bad.validate(), Err(ConfigError::Invalid { field: "encrypt", .. })));

        let mut bad = config("x");
        bad.keep_source = "1w1d".to_string();
        assert!(matches!(bad.validate(), Err(ConfigError::Schedule(_))));

        let mut bad = config("x");
        bad.exclude_snapshots = vec!["(".to_string()];
        assert!(bad.validate().is_err());

        let mut bad = config("x");
        bad.destroy_missing = Some("later".to_string());
        assert!(bad.validate().is_err());

        let mut bad = config("x");
        bad.hold_format = "static".to_string();
        assert!(bad.validate().is_err());

        assert!(config("a/b").validate().is_err());
    }

    #[test]
    fn test_thinning_disabled() {
        let mut config = config("x");
        assert!(config.source_thinner().unwrap().is_some());
        config.no_thinning = true;
        assert!(config.source_thinner().unwrap().is_none());
        assert!(config.target_thinner().unwrap().is_none());
    }

    #[test]
    fn test_receive_shortcuts() {
        let mut config = config("x");
        config.clear_refreservation = true;
        config.clear_mountpoint = true;
        assert_eq!(config.receive_filter(), vec!["refreservation".to_string()]);
        assert_eq!(config.receive_set(), vec!["canmount=noauto".to_string()]);
    }
}
