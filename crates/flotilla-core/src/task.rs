//! Task identity, configuration and persisted lifecycle state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constraints::Constraint;
use crate::resources::ResourceRequest;
use crate::tier::Tier;

/// Opaque unique task identifier.
pub type TaskId = String;

// ── Identity ──────────────────────────────────────────────────────

/// Identifies a job: the unit users submit and quota is accounted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub role: String,
    pub environment: String,
    pub name: String,
}

impl JobKey {
    pub fn new(role: &str, environment: &str, name: &str) -> Self {
        Self {
            role: role.to_string(),
            environment: environment.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.role, self.environment, self.name)
    }
}

/// Identifies a single instance slot of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub job: JobKey,
    pub instance_id: u32,
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.job, self.instance_id)
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────

/// Authoritative task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Created but not yet visible to the scheduling loop.
    Init,
    /// Waiting for a matching offer.
    Pending,
    /// Penalized for flapping; will move to Pending after the penalty.
    Throttled,
    /// Matched to an agent, launch issued.
    Assigned,
    /// Agent acknowledged the launch.
    Starting,
    Running,
    /// Agent stopped heartbeating; not yet declared lost.
    Partitioned,
    /// Being killed to free its agent for a higher-tier task.
    Preempting,
    /// Being killed at operator request, to be rescheduled.
    Restarting,
    /// Being killed because its host is draining for maintenance.
    Draining,
    /// Being killed at user request.
    Killing,
    Finished,
    Failed,
    Killed,
    Lost,
}

impl ScheduleStatus {
    /// Terminal states are never left once entered.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Killed | Self::Lost)
    }

    /// An active task occupies its (job, instance) slot.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// States in which the task has an agent assignment the agent fleet
    /// knows about. These are the states reconciliation converges.
    pub const AGENT_ASSIGNED: &'static [ScheduleStatus] = &[
        Self::Assigned,
        Self::Starting,
        Self::Running,
        Self::Partitioned,
        Self::Preempting,
        Self::Restarting,
        Self::Draining,
        Self::Killing,
    ];
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Pending => "PENDING",
            Self::Throttled => "THROTTLED",
            Self::Assigned => "ASSIGNED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Partitioned => "PARTITIONED",
            Self::Preempting => "PREEMPTING",
            Self::Restarting => "RESTARTING",
            Self::Draining => "DRAINING",
            Self::Killing => "KILLING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
            Self::Lost => "LOST",
        };
        f.write_str(name)
    }
}

/// One entry in a task's append-only transition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Wall-clock time of the transition, epoch milliseconds.
    pub timestamp_ms: u64,
    pub status: ScheduleStatus,
    /// Optional human-readable audit message.
    pub message: Option<String>,
    /// Hostname of the scheduler that recorded the transition.
    pub scheduler: String,
}

// ── Configuration ─────────────────────────────────────────────────

/// The user-supplied template shared by all instances of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub job: JobKey,
    pub tier: Tier,
    pub resources: ResourceRequest,
    pub constraints: Vec<Constraint>,
    /// Services are rescheduled when they finish; ad-hoc tasks are not.
    pub is_service: bool,
    /// Failures tolerated before the task stops being retried.
    /// A negative value means unlimited retries.
    pub max_task_failures: i32,
}

impl TaskConfig {
    /// Whether a task with the given accumulated failure count may be
    /// rescheduled after another failure.
    pub fn permits_retry(&self, failure_count: u32) -> bool {
        self.max_task_failures < 0 || failure_count + 1 < self.max_task_failures as u32
    }
}

/// Groups tasks that are interchangeable for offer matching: same job and
/// the same resource shape. A static ban proven for one member of the group
/// holds for all of them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskGroupKey {
    pub job: JobKey,
    /// Canonical rendering of the resource request.
    pub signature: String,
}

impl TaskGroupKey {
    pub fn of(config: &TaskConfig) -> Self {
        let r = &config.resources;
        let ports: Vec<&str> = r.requested_ports.iter().map(String::as_str).collect();
        Self {
            job: config.job.clone(),
            signature: format!(
                "cpus={};ram={};disk={};ports={}",
                r.cpus,
                r.ram_mb,
                r.disk_mb,
                ports.join(",")
            ),
        }
    }
}

impl fmt::Display for TaskGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.job, self.signature)
    }
}

// ── Persisted task state ──────────────────────────────────────────

/// A task's agent binding: filled in as the task is matched to an offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedTask {
    pub task_id: TaskId,
    pub instance_id: u32,
    pub task: TaskConfig,
    /// Host of the agent the task is assigned to, once matched.
    pub agent_host: Option<String>,
    /// Id of the agent the task is assigned to, once matched.
    pub agent_id: Option<String>,
    /// Concrete ports picked from the offer for each requested port name.
    pub assigned_ports: BTreeMap<String, u16>,
}

/// The authoritative persisted record of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub status: ScheduleStatus,
    pub failure_count: u32,
    pub times_partitioned: u32,
    /// Id of the task this one was rescheduled from, if any.
    pub ancestor_id: Option<TaskId>,
    pub assigned: AssignedTask,
    /// Append-only transition history, timestamps non-decreasing.
    pub task_events: Vec<TaskEvent>,
}

impl ScheduledTask {
    /// Build a new task record in `Init`, ready for insertion.
    pub fn new(task_id: TaskId, instance_id: u32, config: TaskConfig) -> Self {
        Self {
            status: ScheduleStatus::Init,
            failure_count: 0,
            times_partitioned: 0,
            ancestor_id: None,
            assigned: AssignedTask {
                task_id,
                instance_id,
                task: config,
                agent_host: None,
                agent_id: None,
                assigned_ports: BTreeMap::new(),
            },
            task_events: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.assigned.task_id
    }

    pub fn job(&self) -> &JobKey {
        &self.assigned.task.job
    }

    pub fn instance_key(&self) -> InstanceKey {
        InstanceKey {
            job: self.assigned.task.job.clone(),
            instance_id: self.assigned.instance_id,
        }
    }

    pub fn group_key(&self) -> TaskGroupKey {
        TaskGroupKey::of(&self.assigned.task)
    }
}

/// Convenience for tests and templates: the set of port names as owned strings.
pub fn port_names<const N: usize>(names: [&str; N]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}
