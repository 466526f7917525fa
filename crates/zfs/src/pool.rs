//! Pool features, which decide the send and receive flags we may use

use std::sync::PoisonError;

use tracing::debug;
use zbackup_transport::{CmdLine, RunOptions};

use crate::error::Result;
use crate::node::ZfsNode;

/// Feature names from `zpool get -H -o property,value all` rows.
///
/// Only `enabled` and `active` features count.
#[must_use]
pub fn parse_features(rows: &[Vec<String>]) -> Vec<String> {
    rows.iter()
        .filter_map(|row| match row.as_slice() {
            [property, value, ..] if matches!(value.as_str(), "enabled" | "active") => {
                property.strip_prefix("feature@").map(str::to_string)
            }
            _ => None,
        })
        .collect()
}

/// Features present in both lists, in the order of `a`
#[must_use]
pub fn common_features(a: &[String], b: &[String]) -> Vec<String> {
    a.iter().filter(|feature| b.contains(feature)).cloned().collect()
}

impl ZfsNode {
    /// Enabled features of `pool`
    ///
    /// # Errors
    /// Returns an error if the pool can't be queried
    pub async fn pool_features(&self, pool: &str) -> Result<Vec<String>> {
        let cached = self
            .pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pool)
            .cloned();
        if let Some(features) = cached {
            return Ok(features);
        }

        let cmd = CmdLine::new(["zpool", "get", "-H", "-p", "-o", "property,value", "all", pool]);
        let rows = self.query(&cmd, RunOptions::new()).await?.rows();
        let features = parse_features(&rows);
        debug!("[{}] {pool}: features {}", self.label(), features.join(","));

        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pool.to_string(), features.clone());
        Ok(features)
    }
}
