//! The outbound seam to the agent fleet.
//!
//! The cluster-message driver carries launch/kill/decline/reconcile messages
//! to worker agents. Calls are best-effort fire-and-forget: the driver is
//! expected to retry transient failures internally, and reconciliation
//! converges anything that slips through.

use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::task::{AssignedTask, ScheduleStatus, TaskId};

/// A task status as carried by reconciliation messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatusReport {
    pub task_id: TaskId,
    pub agent_id: Option<String>,
    pub status: ScheduleStatus,
}

/// Outbound cluster-message driver.
pub trait Driver: Send + Sync {
    /// Launch `task` using the resources of `offer_id`.
    fn launch_task(&self, offer_id: &str, task: &AssignedTask);

    fn kill_task(&self, task_id: &str);

    /// Return an unused offer, hinting the agent not to re-offer the
    /// resources before `filter_duration` elapses.
    fn decline_offer(&self, offer_id: &str, filter_duration: Duration);

    /// Request the current status of the given tasks. An empty slice asks
    /// the fleet to report everything it knows (implicit reconciliation).
    fn reconcile_tasks(&self, statuses: &[TaskStatusReport]);
}

/// Driver that only logs. Used when the daemon runs without an agent
/// transport attached.
pub struct LoggingDriver;

impl Driver for LoggingDriver {
    fn launch_task(&self, offer_id: &str, task: &AssignedTask) {
        debug!(offer_id, task_id = %task.task_id, "launch");
    }

    fn kill_task(&self, task_id: &str) {
        debug!(task_id, "kill");
    }

    fn decline_offer(&self, offer_id: &str, filter_duration: Duration) {
        debug!(offer_id, ?filter_duration, "decline");
    }

    fn reconcile_tasks(&self, statuses: &[TaskStatusReport]) {
        debug!(count = statuses.len(), "reconcile");
    }
}

/// Records every call for inspection. Test support shared by the crates
/// that emit driver traffic.
#[derive(Default)]
pub struct RecordingDriver {
    pub launched: Mutex<Vec<(String, AssignedTask)>>,
    pub killed: Mutex<Vec<TaskId>>,
    pub declined: Mutex<Vec<(String, Duration)>>,
    pub reconciled: Mutex<Vec<Vec<TaskStatusReport>>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launched_offer_ids(&self) -> Vec<String> {
        self.launched.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn killed_task_ids(&self) -> Vec<TaskId> {
        self.killed.lock().clone()
    }

    pub fn declined_offer_ids(&self) -> Vec<String> {
        self.declined.lock().iter().map(|(id, _)| id.clone()).collect()
    }
}

impl Driver for RecordingDriver {
    fn launch_task(&self, offer_id: &str, task: &AssignedTask) {
        self.launched.lock().push((offer_id.to_string(), task.clone()));
    }

    fn kill_task(&self, task_id: &str) {
        self.killed.lock().push(task_id.to_string());
    }

    fn decline_offer(&self, offer_id: &str, filter_duration: Duration) {
        self.declined.lock().push((offer_id.to_string(), filter_duration));
    }

    fn reconcile_tasks(&self, statuses: &[TaskStatusReport]) {
        self.reconciled.lock().push(statuses.to_vec());
    }
}
