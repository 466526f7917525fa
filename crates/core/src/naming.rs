//! Snapshot naming: `<backup-name>-<strftime>[<separator><tag>]`
//!
//! A suffix whose timestamp parses against the configured format was made by
//! us; anything else is foreign and never thinned.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::ConfigError;

/// What a suffix tells us about its origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    /// Suffix without the tag
    pub base: String,
    pub tag: Option<String>,
    /// Parsed creation time, `None` for foreign objects
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SnapshotNaming {
    backup_name: String,
    time_format: String,
    tag_separator: String,
    utc: bool,
}

impl SnapshotNaming {
    /// Create naming rules from a format like `{}-%Y%m%d%H%M%S`.
    ///
    /// `{}` is replaced by the backup name.
    ///
    /// # Errors
    /// Returns an error if the format has no `{}` placeholder or an invalid
    /// strftime specifier.
    pub fn new(
        backup_name: &str,
        snapshot_format: &str,
        tag_separator: &str,
        utc: bool,
    ) -> Result<Self, ConfigError> {
        if !snapshot_format.contains("{}") {
            return Err(ConfigError::Invalid {
                field: "snapshot_format",
                message: format!("'{snapshot_format}' has no {{}} placeholder for the backup name"),
            });
        }
        if tag_separator.is_empty() {
            return Err(ConfigError::Invalid {
                field: "tag_separator",
                message: "must not be empty".to_string(),
            });
        }

        let time_format = snapshot_format.replace("{}", &backup_name.replace('%', "%%"));
        if StrftimeItems::new(&time_format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::Invalid {
                field: "snapshot_format",
                message: format!("'{snapshot_format}' is not a valid strftime pattern"),
            });
        }

        Ok(Self {
            backup_name: backup_name.to_string(),
            time_format,
            tag_separator: tag_separator.to_string(),
            utc,
        })
    }

    /// Default naming for a backup name: `<name>-%Y%m%d%H%M%S`, local time
    ///
    /// # Errors
    /// Returns an error if the backup name makes the pattern invalid
    pub fn with_defaults(backup_name: &str) -> Result<Self, ConfigError> {
        Self::new(backup_name, "{}-%Y%m%d%H%M%S", "_", false)
    }

    #[must_use]
    pub fn backup_name(&self) -> &str {
        &self.backup_name
    }

    #[must_use]
    pub fn tag_separator(&self) -> &str {
        &self.tag_separator
    }

    /// Suffix for a snapshot taken at `now`
    #[must_use]
    pub fn suffix_at(&self, now: i64) -> String {
        if self.utc {
            let when = DateTime::<Utc>::from_timestamp(now, 0).unwrap_or_default();
            when.format(&self.time_format).to_string()
        } else {
            match Local.timestamp_opt(now, 0).earliest() {
                Some(when) => when.format(&self.time_format).to_string(),
                None => DateTime::<Utc>::from_timestamp(now, 0)
                    .unwrap_or_default()
                    .format(&self.time_format)
                    .to_string(),
            }
        }
    }

    /// `<base><separator><tag>`
    #[must_use]
    pub fn tagged(&self, base: &str, tag: &str) -> String {
        format!("{base}{}{tag}", self.tag_separator)
    }

    /// Parse the timestamp of an untagged suffix
    #[must_use]
    pub fn parse_timestamp(&self, suffix: &str) -> Option<i64> {
        let naive = NaiveDateTime::parse_from_str(suffix, &self.time_format)
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(suffix, &self.time_format)
                    .ok()
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
            })?;

        if self.utc {
            Some(naive.and_utc().timestamp())
        } else {
            Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|when| when.timestamp())
        }
    }

    /// Split off a tag and parse the timestamp.
    ///
    /// A separator only counts as a tag boundary when the part before it is
    /// one of our timestamps, so foreign names containing the separator stay
    /// whole.
    #[must_use]
    pub fn classify(&self, suffix: &str) -> Classified {
        if let Some(timestamp) = self.parse_timestamp(suffix) {
            return Classified {
                base: suffix.to_string(),
                tag: None,
                timestamp: Some(timestamp),
            };
        }

        if let Some((base, tag)) = suffix.rsplit_once(self.tag_separator.as_str())
            && !tag.is_empty()
            && let Some(timestamp) = self.parse_timestamp(base)
        {
            return Classified {
                base: base.to_string(),
                tag: Some(tag.to_string()),
                timestamp: Some(timestamp),
            };
        }

        Classified {
            base: suffix.to_string(),
            tag: None,
            timestamp: None,
        }
    }
}
