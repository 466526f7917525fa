//! Dataset path helpers: stripping, target names and pools

use std::collections::HashMap;

use crate::error::PlanError;

/// Drop the first `count` components of `name`.
///
/// # Errors
/// Returns [`PlanError::StripTooMuch`] if `name` has fewer than `count`
/// components.
pub fn strip_path(name: &str, count: usize) -> Result<String, PlanError> {
    let components: Vec<&str> = name.split('/').collect();
    if count > components.len() {
        return Err(PlanError::StripTooMuch {
            dataset: name.to_string(),
            count,
        });
    }
    Ok(components[count..].join("/"))
}

/// Where `source` ends up below `target_path`
///
/// # Errors
/// See [`strip_path`].
pub fn target_name(source: &str, target_path: &str, strip: usize) -> Result<String, PlanError> {
    let stripped = strip_path(source, strip)?;
    let target_path = target_path.trim_end_matches('/');
    if stripped.is_empty() {
        Ok(target_path.to_string())
    } else {
        Ok(format!("{target_path}/{stripped}"))
    }
}

/// Map every source dataset to its target, refusing two sources per target.
///
/// The result keeps the order of `sources`.
///
/// # Errors
/// Returns [`PlanError::TargetCollision`] on the first duplicate target.
pub fn target_names(
    sources: &[String],
    target_path: &str,
    strip: usize,
) -> Result<Vec<(String, String)>, PlanError> {
    let mut seen: HashMap<String, &str> = HashMap::with_capacity(sources.len());
    let mut pairs = Vec::with_capacity(sources.len());

    for source in sources {
        let target = target_name(source, target_path, strip)?;
        if let Some(first) = seen.insert(target.clone(), source) {
            return Err(PlanError::TargetCollision {
                target,
                first: first.to_string(),
                second: source.clone(),
            });
        }
        pairs.push((source.clone(), target));
    }

    Ok(pairs)
}

/// Pool a dataset lives on
#[must_use]
pub fn pool_of(name: &str) -> &str {
    name.split('/').next().unwrap_or(name)
}

/// Parent dataset, `None` for a pool root
#[must_use]
pub fn parent_of(name: &str) -> Option<&str> {
    name.rsplit_once('/').map(|(parent, _)| parent)
}
