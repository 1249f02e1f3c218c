//! Per-agent view of running work, rebuilt for each preemption pass.

use std::collections::BTreeMap;

use flotilla_core::{JobKey, ResourceQuantity, Tier};
use flotilla_state::{ReadProvider, StateResult, TaskQuery};

/// A task occupying resources on an agent, as seen by the victim search.
#[derive(Debug, Clone)]
pub struct Victim {
    pub task_id: String,
    pub job: JobKey,
    pub tier: Tier,
    pub quantity: ResourceQuantity,
    /// Concrete ports the task holds; freed along with it.
    pub ports: Vec<u16>,
}

/// Active tasks grouped by agent host. Keyed by a `BTreeMap` so hosts are
/// visited in a stable order, making tie-breaks deterministic.
#[derive(Debug, Default)]
pub struct ClusterSnapshot {
    pub tasks_by_host: BTreeMap<String, Vec<Victim>>,
}

impl ClusterSnapshot {
    /// Build the snapshot from the task store: every active task with an
    /// agent assignment.
    pub fn build(provider: &ReadProvider) -> StateResult<Self> {
        let mut tasks_by_host: BTreeMap<String, Vec<Victim>> = BTreeMap::new();
        for task in provider.tasks.fetch(&TaskQuery::agent_assigned())? {
            let Some(host) = task.assigned.agent_host.clone() else {
                continue;
            };
            let config = &task.assigned.task;
            tasks_by_host.entry(host).or_default().push(Victim {
                task_id: task.id().to_string(),
                job: config.job.clone(),
                tier: config.tier,
                quantity: config.resources.quantity(),
                ports: task.assigned.assigned_ports.values().copied().collect(),
            });
        }
        Ok(Self { tasks_by_host })
    }
}
