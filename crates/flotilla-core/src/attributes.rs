//! Per-agent host attributes and maintenance mode.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Hosts exposing this attribute are reserved: only tasks carrying a
/// matching value constraint may land on them.
pub const DEDICATED_ATTRIBUTE: &str = "dedicated";

/// A single named attribute with its advertised values.
///
/// Invariant (enforced at save time): the value set is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub values: BTreeSet<String>,
}

impl Attribute {
    pub fn new<const N: usize>(name: &str, values: [&str; N]) -> Self {
        Self {
            name: name.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// Operator-controlled maintenance state of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceMode {
    None,
    /// Host is being evacuated; no new tasks may be placed.
    Draining,
    /// Host is empty and fenced off.
    Drained,
}

/// The per-agent attribute record.
///
/// `mode` is optional on the way in: a record saved without a mode inherits
/// the previously stored mode (or `None`). Stored records always carry a
/// concrete mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostAttributes {
    pub host: String,
    pub mode: Option<MaintenanceMode>,
    pub attributes: Vec<Attribute>,
}

impl HostAttributes {
    pub fn new(host: &str, mode: MaintenanceMode, attributes: Vec<Attribute>) -> Self {
        Self {
            host: host.to_string(),
            mode: Some(mode),
            attributes,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// The stored mode; records fetched from the attribute store always
    /// have one.
    pub fn effective_mode(&self) -> MaintenanceMode {
        self.mode.unwrap_or(MaintenanceMode::None)
    }
}
