//! Placement constraints carried by task configs.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A named placement constraint against a host attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// The host attribute the constraint applies to.
    pub name: String,
    pub constraint: TaskConstraint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskConstraint {
    Value(ValueConstraint),
    Limit(LimitConstraint),
}

impl TaskConstraint {
    pub fn value<const N: usize>(negated: bool, values: [&str; N]) -> Self {
        Self::Value(ValueConstraint {
            negated,
            values: values.iter().map(|v| v.to_string()).collect(),
        })
    }

    pub fn limit(limit: u32) -> Self {
        Self::Limit(LimitConstraint { limit })
    }
}

/// Passes when the agent exposes the attribute with at least one matching
/// value; `negated` flips the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueConstraint {
    pub negated: bool,
    pub values: BTreeSet<String>,
}

impl ValueConstraint {
    /// Evaluate against the values an agent exposes for the attribute.
    /// A missing attribute is an empty value set.
    pub fn matches(&self, agent_values: &BTreeSet<String>) -> bool {
        let overlap = self.values.iter().any(|v| agent_values.contains(v));
        overlap != self.negated
    }
}

/// Caps the number of active sibling tasks of the same job that may share
/// any single value of the attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitConstraint {
    pub limit: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values<const N: usize>(vs: [&str; N]) -> BTreeSet<String> {
        vs.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn value_constraint_overlap() {
        let c = ValueConstraint {
            negated: false,
            values: values(["ssd", "nvme"]),
        };
        assert!(c.matches(&values(["nvme"])));
        assert!(!c.matches(&values(["spinning"])));
        assert!(!c.matches(&values([])));
    }

    #[test]
    fn negated_value_constraint() {
        let c = ValueConstraint {
            negated: true,
            values: values(["denied"]),
        };
        assert!(c.matches(&values(["allowed"])));
        assert!(c.matches(&values([])));
        assert!(!c.matches(&values(["denied"])));
    }
}
