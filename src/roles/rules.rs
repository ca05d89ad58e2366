//! Role rules: a grant role plus OR-of-AND requirement groups.
//!
//! Evaluation is a single pass against the role set held *before* the pass.
//! A role granted by one rule is not visible as a prerequisite to a later
//! rule in the same pass; the next event or sweep picks it up.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A role that is conditionally granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRule {
    /// Role name added/removed by this rule.
    pub grants: String,
    /// Requirement groups. The rule is satisfied when every role in at least
    /// one group is held.
    pub any_requires: Vec<Vec<String>>,
}

impl RoleRule {
    pub fn new(grants: impl Into<String>, any_requires: Vec<Vec<&str>>) -> Self {
        Self {
            grants: grants.into(),
            any_requires: any_requires
                .into_iter()
                .map(|group| group.into_iter().map(String::from).collect())
                .collect(),
        }
    }

    /// Whether at least one requirement group is fully held.
    pub fn is_eligible(&self, held: &HashSet<&str>) -> bool {
        self.any_requires
            .iter()
            .any(|group| group.iter().all(|name| held.contains(name.as_str())))
    }

    /// Reject rules that could never be satisfied or are satisfied vacuously.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grants.trim().is_empty() {
            return Err(ConfigError::invalid("rules.grants", "grant role name is empty"));
        }
        if self.any_requires.is_empty() {
            return Err(ConfigError::invalid(
                format!("rules[{}].any_requires", self.grants),
                "at least one requirement group is needed",
            ));
        }
        if self.any_requires.iter().any(Vec::is_empty) {
            return Err(ConfigError::invalid(
                format!("rules[{}].any_requires", self.grants),
                "requirement groups must not be empty",
            ));
        }
        Ok(())
    }
}

/// A change the evaluator wants applied to a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleChange {
    Add(String),
    Remove(String),
}

impl RoleChange {
    pub fn role(&self) -> &str {
        match self {
            Self::Add(role) | Self::Remove(role) => role,
        }
    }
}

/// Compute the changes for a member holding `held`, in rule order.
pub fn plan_changes<'r, 'a, R, I>(rules: R, held: I) -> Vec<RoleChange>
where
    R: IntoIterator<Item = &'r RoleRule>,
    I: IntoIterator<Item = &'a str>,
{
    let held: HashSet<&str> = held.into_iter().collect();

    rules
        .into_iter()
        .filter_map(|rule| {
            let eligible = rule.is_eligible(&held);
            let has_grant = held.contains(rule.grants.as_str());
            match (eligible, has_grant) {
                (true, false) => Some(RoleChange::Add(rule.grants.clone())),
                (false, true) => Some(RoleChange::Remove(rule.grants.clone())),
                _ => None,
            }
        })
        .collect()
}
