//! Dataset selection by user property
//!
//! Rows come from `zfs get -t volume,filesystem -o name,value,source -H <prop>`
//! in tree order, so an `inherited from X` source can always be resolved
//! through an ancestor seen earlier.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::SelectionError;

const INHERITED_PREFIX: &str = "inherited from ";

/// Value of the selection property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionValue {
    True,
    False,
    /// Select descendants only
    Child,
    /// Select the dataset itself, not its descendants
    Parent,
    Unset,
}

impl SelectionValue {
    fn parse(dataset: &str, value: &str) -> Result<Self, SelectionError> {
        match value {
            "true" => Ok(Self::True),
            "false" => Ok(Self::False),
            "child" => Ok(Self::Child),
            "parent" => Ok(Self::Parent),
            "-" => Ok(Self::Unset),
            other => Err(SelectionError::IllegalValue {
                dataset: dataset.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// One dataset with its resolved property source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub name: String,
    pub value: SelectionValue,
    /// `local`, `received` or `-`, resolved through inheritance
    pub source: String,
    pub inherited: bool,
}

/// Why a dataset is or isn't selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Selected,
    Unset,
    /// `child` set directly on the dataset
    ChildOnly,
    /// `parent` inherited from an ancestor
    ParentOnly,
    Disabled,
    ExcludedPath,
    Received,
}

impl Verdict {
    #[must_use]
    pub fn is_selected(self) -> bool {
        self == Self::Selected
    }
}

/// Filters applied on top of the property value
#[derive(Debug, Clone, Default)]
pub struct SelectionFilter {
    pub exclude_paths: Vec<String>,
    pub exclude_received: bool,
}

/// True if `name` is `path` or lies below it
#[must_use]
pub fn is_below(name: &str, path: &str) -> bool {
    let path = path.trim_end_matches('/');
    name == path || name.starts_with(&format!("{path}/"))
}

/// Resolve property rows into candidates.
///
/// # Errors
/// Fails on rows without three columns, unknown values or sources, or an
/// inheritance source that was not seen before.
pub fn resolve_rows(rows: &[Vec<String>]) -> Result<Vec<Candidate>, SelectionError> {
    let mut sources: HashMap<&str, String> = HashMap::new();
    let mut candidates = Vec::with_capacity(rows.len());

    for row in rows {
        let [name, value, raw_source] = row.as_slice() else {
            return Err(SelectionError::MalformedLine { line: row.clone() });
        };

        let (source, inherited) = match raw_source.strip_prefix(INHERITED_PREFIX) {
            Some(ancestor) => {
                let source = sources.get(ancestor).cloned().ok_or_else(|| {
                    SelectionError::UnknownAncestor {
                        dataset: name.clone(),
                        ancestor: ancestor.to_string(),
                    }
                })?;
                (source, true)
            }
            None => {
                if !matches!(raw_source.as_str(), "local" | "received" | "-") {
                    return Err(SelectionError::IllegalSource {
                        dataset: name.clone(),
                        source_name: raw_source.clone(),
                    });
                }
                (raw_source.clone(), false)
            }
        };

        let value = SelectionValue::parse(name, value)?;
        sources.insert(name.as_str(), source.clone());
        candidates.push(Candidate {
            name: name.clone(),
            value,
            source,
            inherited,
        });
    }

    Ok(candidates)
}

impl Candidate {
    /// Verdict from the property value and the static filters
    #[must_use]
    pub fn verdict(&self, filter: &SelectionFilter) -> Verdict {
        match self.value {
            SelectionValue::Unset => return Verdict::Unset,
            SelectionValue::Child if !self.inherited => return Verdict::ChildOnly,
            SelectionValue::Parent if self.inherited => return Verdict::ParentOnly,
            SelectionValue::False => return Verdict::Disabled,
            _ => {}
        }

        if filter
            .exclude_paths
            .iter()
            .any(|path| is_below(&self.name, path))
        {
            return Verdict::ExcludedPath;
        }

        if filter.exclude_received && self.source == "received" {
            return Verdict::Received;
        }

        Verdict::Selected
    }
}

/// True if a dataset with `written` bytes since its last snapshot counts as
/// changed. Unknown sizes count as changed, a threshold of 0 disables the check.
#[must_use]
pub fn is_changed(written: Option<u64>, min_change: u64) -> bool {
    min_change == 0 || written.is_none_or(|written| written >= min_change)
}
