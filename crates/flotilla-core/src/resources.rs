//! Resource vectors: what tasks request and what offers carry.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// What a task asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpus: f64,
    pub ram_mb: u64,
    pub disk_mb: u64,
    /// Named ports; concrete numbers are picked from the offer at assignment.
    pub requested_ports: BTreeSet<String>,
}

impl ResourceRequest {
    pub fn quantity(&self) -> ResourceQuantity {
        ResourceQuantity {
            cpus: self.cpus,
            ram_mb: self.ram_mb,
            disk_mb: self.disk_mb,
        }
    }
}

/// A scalar resource aggregate. Used for quotas and for summing freed
/// victim resources during preemption search.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceQuantity {
    pub cpus: f64,
    pub ram_mb: u64,
    pub disk_mb: u64,
}

impl ResourceQuantity {
    pub fn add(&mut self, other: &ResourceQuantity) {
        self.cpus += other.cpus;
        self.ram_mb += other.ram_mb;
        self.disk_mb += other.disk_mb;
    }

    /// True when every dimension covers `needed`.
    pub fn covers(&self, needed: &ResourceQuantity) -> bool {
        self.cpus >= needed.cpus && self.ram_mb >= needed.ram_mb && self.disk_mb >= needed.disk_mb
    }
}

/// An inclusive port range advertised by an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl PortRange {
    pub fn count(&self) -> usize {
        if self.end < self.begin {
            0
        } else {
            (self.end - self.begin) as usize + 1
        }
    }
}

/// The resources an offer advertises.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceBag {
    pub cpus: f64,
    pub ram_mb: u64,
    pub disk_mb: u64,
    pub port_ranges: Vec<PortRange>,
    /// Best-effort resources: usable only by revocable-tier tasks.
    #[serde(default)]
    pub revocable: bool,
}

impl ResourceBag {
    /// Build a bag from a scalar quantity plus an explicit set of ports,
    /// e.g. the resources a preemption victim set would free.
    pub fn from_freed(quantity: ResourceQuantity, ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            cpus: quantity.cpus,
            ram_mb: quantity.ram_mb,
            disk_mb: quantity.disk_mb,
            port_ranges: ports
                .into_iter()
                .map(|p| PortRange { begin: p, end: p })
                .collect(),
            revocable: false,
        }
    }

    pub fn port_count(&self) -> usize {
        self.port_ranges.iter().map(PortRange::count).sum()
    }

    /// Pick a concrete port for each requested name, consuming from the
    /// ranges front to back. Returns `None` when the offer does not carry
    /// enough ports.
    pub fn assign_ports(&self, names: &BTreeSet<String>) -> Option<BTreeMap<String, u16>> {
        let mut available = self
            .port_ranges
            .iter()
            .flat_map(|r| r.begin..=r.end)
            .take(names.len());
        let mut assigned = BTreeMap::new();
        for name in names {
            assigned.insert(name.clone(), available.next()?);
        }
        Some(assigned)
    }
}
