//! Task queries: the filter predicates supported by `TaskStore::fetch`.

use std::collections::BTreeSet;

use flotilla_core::{JobKey, ScheduleStatus, ScheduledTask};

/// A conjunction of optional filters over stored tasks. Unset filters
/// match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub ids: Option<BTreeSet<String>>,
    pub job: Option<JobKey>,
    pub instance_ids: Option<BTreeSet<u32>>,
    pub statuses: Option<BTreeSet<ScheduleStatus>>,
    pub host: Option<String>,
    /// Restrict to non-terminal tasks.
    pub active_only: bool,
}

impl TaskQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: &str) -> Self {
        Self {
            ids: Some([id.to_string()].into()),
            ..Self::default()
        }
    }

    pub fn by_job(job: &JobKey) -> Self {
        Self {
            job: Some(job.clone()),
            ..Self::default()
        }
    }

    pub fn by_host(host: &str) -> Self {
        Self {
            host: Some(host.to_string()),
            ..Self::default()
        }
    }

    /// Tasks in any state the agent fleet knows about; the population
    /// reconciliation reports on.
    pub fn agent_assigned() -> Self {
        Self {
            statuses: Some(ScheduleStatus::AGENT_ASSIGNED.iter().copied().collect()),
            ..Self::default()
        }
    }

    pub fn instances(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.instance_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn statuses(mut self, statuses: impl IntoIterator<Item = ScheduleStatus>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    pub fn active(mut self) -> Self {
        self.active_only = true;
        self
    }

    pub fn matches(&self, task: &ScheduledTask) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(task.id()) {
                return false;
            }
        }
        if let Some(job) = &self.job {
            if task.job() != job {
                return false;
            }
        }
        if let Some(instances) = &self.instance_ids {
            if !instances.contains(&task.assigned.instance_id) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(host) = &self.host {
            if task.assigned.agent_host.as_deref() != Some(host.as_str()) {
                return false;
            }
        }
        if self.active_only && task.status.is_terminal() {
            return false;
        }
        true
    }
}
