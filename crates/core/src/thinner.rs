//! Thinning engine: retention schedules over timestamped objects
//!
//! A schedule looks like `"10,1d1w,1w1m,1m1y"`: keep the last 10, then one
//! object per day for a week, one per week for a month and one per month for
//! a year. Within a period the *oldest* object wins its time block.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::ScheduleError;

/// Anything with a creation time in seconds since the epoch
pub trait Timestamped {
    fn created_at(&self) -> i64;
}

impl Timestamped for i64 {
    fn created_at(&self) -> i64 {
        *self
    }
}

/// Time units understood in schedules, with their length in seconds
const UNITS: [(&str, i64, &str); 7] = [
    ("y", 31_557_600, "year"),
    ("m", 2_592_000, "month"),
    ("w", 604_800, "week"),
    ("d", 86_400, "day"),
    ("h", 3_600, "hour"),
    ("min", 60, "minute"),
    ("s", 1, "second"),
];

fn unit_seconds(unit: &str) -> Option<(i64, &'static str)> {
    UNITS
        .iter()
        .find(|(name, _, _)| *name == unit)
        .map(|(_, secs, human)| (*secs, *human))
}

fn plural(amount: i64) -> &'static str {
    if amount == 1 { "" } else { "s" }
}

/// One `<period><ttl>` rule of a schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThinnerRule {
    /// Length of a time block in seconds
    pub period: i64,
    /// Objects older than this are no longer considered by this rule
    pub ttl: i64,
    #[serde(skip)]
    human: String,
}

impl ThinnerRule {
    /// Parse a rule like `1d1w` or `10s1min`
    ///
    /// # Errors
    /// Returns an error for malformed rules, unknown units or `period > ttl`
    pub fn parse(rule: &str) -> Result<Self, ScheduleError> {
        let lowered = rule.trim().to_lowercase();
        let invalid = || ScheduleError::InvalidRule {
            rule: rule.to_string(),
        };

        let mut rest = lowered.as_str();
        let mut parts = Vec::with_capacity(4);
        for want_digits in [true, false, true, false] {
            let end = rest
                .find(|c: char| c.is_ascii_digit() != want_digits)
                .unwrap_or(rest.len());
            if end == 0 {
                return Err(invalid());
            }
            parts.push(&rest[..end]);
            rest = &rest[end..];
        }
        if !rest.is_empty() {
            return Err(invalid());
        }

        let period_amount: i64 = parts[0].parse().map_err(|_| invalid())?;
        let ttl_amount: i64 = parts[2].parse().map_err(|_| invalid())?;
        let unit_error = |unit: &str| ScheduleError::InvalidUnit {
            rule: rule.to_string(),
            unit: unit.to_string(),
        };
        let (period_unit, period_name) = unit_seconds(parts[1]).ok_or_else(|| unit_error(parts[1]))?;
        let (ttl_unit, ttl_name) = unit_seconds(parts[3]).ok_or_else(|| unit_error(parts[3]))?;

        let period = period_amount.checked_mul(period_unit).ok_or_else(invalid)?;
        let ttl = ttl_amount.checked_mul(ttl_unit).ok_or_else(invalid)?;
        if period > ttl {
            return Err(ScheduleError::PeriodExceedsTtl {
                rule: rule.to_string(),
            });
        }

        let human = format!(
            "Keep every {period_amount} {period_name}{}, delete after {ttl_amount} {ttl_name}{}.",
            plural(period_amount),
            plural(ttl_amount)
        );

        Ok(Self { period, ttl, human })
    }
}

impl fmt::Display for ThinnerRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.human)
    }
}

/// Result of thinning: both halves keep the input order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thinned<T> {
    pub keeps: Vec<T>,
    pub removes: Vec<T>,
}

/// A parsed retention schedule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Thinner {
    always_keep: usize,
    rules: Vec<ThinnerRule>,
}

impl Thinner {
    /// Parse a schedule string; the empty string keeps nothing but `keep_set`
    ///
    /// # Errors
    /// Returns an error if any comma separated part is invalid
    pub fn parse(schedule: &str) -> Result<Self, ScheduleError> {
        let mut thinner = Self::default();
        if schedule.trim().is_empty() {
            return Ok(thinner);
        }

        for part in schedule.split(',') {
            let part = part.trim();
            let digits = part.strip_prefix('-').unwrap_or(part);
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                let count: i64 = part.parse().map_err(|_| ScheduleError::InvalidRule {
                    rule: part.to_string(),
                })?;
                if count < 0 {
                    return Err(ScheduleError::NegativeKeep { count });
                }
                thinner.always_keep = count as usize;
            } else {
                let rule = ThinnerRule::parse(part)?;
                if rule.period == 0 {
                    return Err(ScheduleError::InvalidRule {
                        rule: part.to_string(),
                    });
                }
                thinner.rules.push(rule);
            }
        }

        Ok(thinner)
    }

    /// Number of newest objects that are always kept
    #[must_use]
    pub fn always_keep(&self) -> usize {
        self.always_keep
    }

    #[must_use]
    pub fn rules(&self) -> &[ThinnerRule] {
        &self.rules
    }

    /// Human readable description, one line per rule
    #[must_use]
    pub fn describe(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.rules.len() + 1);
        if self.always_keep > 0 {
            lines.push(format!(
                "Keep the last {} snapshot{}.",
                self.always_keep,
                plural(self.always_keep as i64)
            ));
        }
        lines.extend(self.rules.iter().map(ToString::to_string));
        lines
    }

    /// Split `objects` (oldest first) into keeps and removes as of `now`.
    ///
    /// Objects in `keep_set` are always kept.
    pub fn thin<T>(&self, objects: &[T], keep_set: &[T], now: i64) -> Thinned<T>
    where
        T: Timestamped + PartialEq + Clone,
    {
        if objects.len() <= self.always_keep {
            return Thinned {
                keeps: objects.to_vec(),
                removes: Vec::new(),
            };
        }
        let always_from = objects.len() - self.always_keep;

        // Rules with equal periods share their time blocks
        let mut blocks: HashMap<i64, HashSet<i64>> = self
            .rules
            .iter()
            .map(|rule| (rule.period, HashSet::new()))
            .collect();

        let mut keeps = Vec::new();
        let mut removes = Vec::new();

        for (index, object) in objects.iter().enumerate() {
            let timestamp = object.created_at();
            let age = now.saturating_sub(timestamp);

            let mut keep = false;
            for rule in &self.rules {
                if age <= rule.ttl {
                    let block = timestamp.div_euclid(rule.period);
                    if let Some(taken) = blocks.get_mut(&rule.period)
                        && taken.insert(block)
                    {
                        keep = true;
                    }
                }
            }

            if keep || index >= always_from || keep_set.contains(object) {
                keeps.push(object.clone());
            } else {
                removes.push(object.clone());
            }
        }

        Thinned { keeps, removes }
    }
}

impl FromStr for Thinner {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
