//! flotilla-filter — the pure fit decision.
//!
//! [`vetoes`] answers one question with no side effects: can a task with
//! the given resource request, constraints and tier run on an agent
//! advertising the given resources and attributes? Evaluation is
//! order-independent and exhaustive — every applicable veto is reported,
//! and the caller decides whether one is enough to move on.

mod counts;
mod veto;

pub use counts::{ActiveSiblingCounts, NoSiblings, SiblingCounts};
pub use veto::Veto;

use flotilla_core::{
    Constraint, HostAttributes, MaintenanceMode, ResourceBag, ResourceRequest, TaskConstraint,
    Tier, DEDICATED_ATTRIBUTE,
};

/// Evaluate a (task, agent) pairing. An empty result means the task fits.
///
/// `counts` is the caller-supplied oracle for limit constraints: active
/// sibling tasks of the same job per (attribute, value).
pub fn vetoes(
    resources: &ResourceBag,
    attributes: &HostAttributes,
    request: &ResourceRequest,
    constraints: &[Constraint],
    tier: Tier,
    counts: &dyn ActiveSiblingCounts,
) -> Vec<Veto> {
    let mut found = Vec::new();

    if attributes.effective_mode() != MaintenanceMode::None {
        found.push(Veto::Maintenance);
    }

    check_dedicated(attributes, constraints, &mut found);
    check_resources(resources, request, tier, &mut found);

    for constraint in constraints {
        match &constraint.constraint {
            TaskConstraint::Value(value) => {
                let agent_values = attributes
                    .attribute(&constraint.name)
                    .map(|a| a.values.clone())
                    .unwrap_or_default();
                if !value.matches(&agent_values) {
                    found.push(Veto::UnsatisfiedValueConstraint {
                        name: constraint.name.clone(),
                    });
                }
            }
            TaskConstraint::Limit(limit) => {
                // The constraint fails when any value the agent exposes for
                // the attribute is already at the limit.
                let saturated = attributes
                    .attribute(&constraint.name)
                    .map(|a| {
                        a.values
                            .iter()
                            .any(|v| counts.active_count(&constraint.name, v) >= limit.limit)
                    })
                    .unwrap_or(false);
                if saturated {
                    found.push(Veto::UnsatisfiedLimitConstraint {
                        name: constraint.name.clone(),
                    });
                }
            }
        }
    }

    found
}

fn check_dedicated(attributes: &HostAttributes, constraints: &[Constraint], found: &mut Vec<Veto>) {
    let Some(dedicated) = attributes.attribute(DEDICATED_ATTRIBUTE) else {
        return;
    };
    // A dedicated host only admits tasks that claim it explicitly.
    let claimed = constraints.iter().any(|c| {
        c.name == DEDICATED_ATTRIBUTE
            && matches!(
                &c.constraint,
                TaskConstraint::Value(v) if !v.negated && v.matches(&dedicated.values)
            )
    });
    if !claimed {
        found.push(Veto::DedicatedMismatch);
    }
}

fn check_resources(
    resources: &ResourceBag,
    request: &ResourceRequest,
    tier: Tier,
    found: &mut Vec<Veto>,
) {
    // Revocable resources are only usable by revocable-tier tasks.
    let usable_cpus = if resources.revocable && !tier.is_revocable() {
        0.0
    } else {
        resources.cpus
    };

    if usable_cpus < request.cpus {
        found.push(Veto::InsufficientCpu {
            requested: request.cpus,
            available: usable_cpus,
        });
    }
    if resources.ram_mb < request.ram_mb {
        found.push(Veto::InsufficientRam {
            requested: request.ram_mb,
            available: resources.ram_mb,
        });
    }
    if resources.disk_mb < request.disk_mb {
        found.push(Veto::InsufficientDisk {
            requested: request.disk_mb,
            available: resources.disk_mb,
        });
    }
    let available_ports = resources.port_count();
    if available_ports < request.requested_ports.len() {
        found.push(Veto::InsufficientPorts {
            requested: request.requested_ports.len(),
            available: available_ports,
        });
    }
}
