//! The state manager: persisted state-machine transitions and their
//! side-effects, applied inside the storage write transaction.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use tracing::info;

use flotilla_core::{
    AssignedTask, Clock, Driver, ScheduleStatus, ScheduledTask, TaskConfig, TaskEvent,
};
use flotilla_machine::{SideEffect, StateChangeResult, TaskStateMachine};
use flotilla_state::{SchedulerEvent, StoreProvider, TaskQuery, TaskStateChange, TasksDeleted};

use crate::error::{SchedulerError, SchedulerResult};
use crate::ids::TaskIdGenerator;
use crate::reschedule::RescheduleCalculator;

static LOCAL_HOSTNAME: OnceLock<String> = OnceLock::new();

/// The hostname recorded on task events, resolved once per process.
fn local_hostname() -> SchedulerResult<String> {
    if let Some(host) = LOCAL_HOSTNAME.get() {
        return Ok(host.clone());
    }
    let resolved = hostname::get()
        .map_err(|e| SchedulerError::HostResolution(e.to_string()))?
        .into_string()
        .map_err(|_| SchedulerError::HostResolution("hostname is not valid UTF-8".to_string()))?;
    Ok(LOCAL_HOSTNAME.get_or_init(|| resolved).clone())
}

/// Controller for persisted state-machine transitions and their
/// side-effects. All methods take the write-transaction store provider;
/// events they enqueue fire after the transaction commits.
pub struct StateManager {
    clock: Arc<dyn Clock>,
    driver: Arc<dyn Driver>,
    id_generator: Arc<dyn TaskIdGenerator>,
    reschedule: Arc<dyn RescheduleCalculator>,
    scheduler_host: String,
}

impl StateManager {
    /// Build a state manager, resolving the local hostname for event
    /// attribution. Resolution failure is a startup error.
    pub fn new(
        clock: Arc<dyn Clock>,
        driver: Arc<dyn Driver>,
        id_generator: Arc<dyn TaskIdGenerator>,
        reschedule: Arc<dyn RescheduleCalculator>,
    ) -> SchedulerResult<Self> {
        let scheduler_host = local_hostname()?;
        Ok(Self::with_scheduler_host(
            clock,
            driver,
            id_generator,
            reschedule,
            scheduler_host,
        ))
    }

    pub fn with_scheduler_host(
        clock: Arc<dyn Clock>,
        driver: Arc<dyn Driver>,
        id_generator: Arc<dyn TaskIdGenerator>,
        reschedule: Arc<dyn RescheduleCalculator>,
        scheduler_host: String,
    ) -> Self {
        Self {
            clock,
            driver,
            id_generator,
            reschedule,
            scheduler_host,
        }
    }

    /// Insert fresh tasks for the given instances, transitioning each
    /// INIT → PENDING. Rejects the whole batch when any requested instance
    /// is already active for the job.
    pub fn insert_pending_tasks(
        &self,
        provider: &mut StoreProvider<'_>,
        template: &TaskConfig,
        instance_ids: &BTreeSet<u32>,
    ) -> SchedulerResult<Vec<String>> {
        let collisions: Vec<u32> = provider
            .tasks
            .fetch(
                &TaskQuery::by_job(&template.job)
                    .instances(instance_ids.iter().copied())
                    .active(),
            )?
            .iter()
            .map(|t| t.assigned.instance_id)
            .collect();
        if !collisions.is_empty() {
            return Err(SchedulerError::InstanceCollision {
                job: template.job.clone(),
                instances: collisions,
            });
        }

        let tasks: Vec<ScheduledTask> = instance_ids
            .iter()
            .map(|instance_id| {
                ScheduledTask::new(
                    self.id_generator.generate(template, *instance_id),
                    *instance_id,
                    template.clone(),
                )
            })
            .collect();
        provider.tasks.save_tasks(&tasks)?;

        let mut ids = Vec::with_capacity(tasks.len());
        for task in &tasks {
            self.update_task(provider, task.id(), None, ScheduleStatus::Pending, None)?;
            ids.push(task.id().to_string());
        }
        Ok(ids)
    }

    /// Request a state transition, optionally guarded by an expected prior
    /// state. Expected failures (CAS mismatch, illegal edge, no-op) are
    /// reported in the result; storage trouble is an error.
    pub fn change_state(
        &self,
        provider: &mut StoreProvider<'_>,
        task_id: &str,
        expected: Option<ScheduleStatus>,
        target: ScheduleStatus,
        audit_message: Option<String>,
    ) -> SchedulerResult<StateChangeResult> {
        self.update_task(provider, task_id, expected, target, audit_message)
    }

    /// Bind a matched task to its agent and transition it to ASSIGNED.
    /// `binder` fills in the resource binding (ports). The transition not
    /// succeeding is a programming error.
    pub fn assign_task(
        &self,
        provider: &mut StoreProvider<'_>,
        task_id: &str,
        host: &str,
        agent_id: &str,
        binder: impl FnOnce(AssignedTask) -> AssignedTask,
    ) -> SchedulerResult<AssignedTask> {
        let mutated = provider.tasks.mutate_task(task_id, |mut task| {
            task.assigned = binder(task.assigned);
            task.assigned.agent_host = Some(host.to_string());
            task.assigned.agent_id = Some(agent_id.to_string());
            task
        })?;
        if mutated.is_none() {
            panic!("attempt to assign unknown task {task_id}");
        }

        let result = self.update_task(provider, task_id, None, ScheduleStatus::Assigned, None)?;
        if result != StateChangeResult::Success {
            panic!("attempt to assign task {task_id} to {host} failed: {result:?}");
        }

        let assigned = provider
            .tasks
            .fetch_task(task_id)?
            .unwrap_or_else(|| panic!("assigned task {task_id} vanished"))
            .assigned;
        Ok(assigned)
    }

    /// Remove tasks outright, emitting a single deletion event.
    pub fn delete_tasks(
        &self,
        provider: &mut StoreProvider<'_>,
        task_ids: &BTreeSet<String>,
    ) -> SchedulerResult<()> {
        self.delete_and_record(provider, task_ids)
    }

    fn update_task(
        &self,
        provider: &mut StoreProvider<'_>,
        task_id: &str,
        expected: Option<ScheduleStatus>,
        target: ScheduleStatus,
        audit_message: Option<String>,
    ) -> SchedulerResult<StateChangeResult> {
        let task = provider.tasks.fetch_task(task_id)?;
        let machine = match &task {
            Some(task) => TaskStateMachine::for_task(task),
            None => TaskStateMachine::for_missing(task_id),
        };
        let result = machine.evaluate(expected, target);

        for side_effect in result.side_effects() {
            match side_effect {
                SideEffect::IncrementFailures => {
                    let mutated = provider.tasks.mutate_task(task_id, |mut task| {
                        task.failure_count += 1;
                        task
                    })?;
                    if mutated.is_none() {
                        panic!("INCREMENT_FAILURES expected task {task_id} to be present");
                    }
                }

                SideEffect::SaveState => {
                    let now = self.clock.now_millis();
                    let scheduler_host = self.scheduler_host.clone();
                    let message = audit_message.clone();
                    let mutated = provider.tasks.mutate_task(task_id, |mut task| {
                        task.status = target;
                        if target == ScheduleStatus::Partitioned {
                            task.times_partitioned += 1;
                            // Bound event history on flapping agents.
                            task.task_events = compact_partition_events(task.task_events);
                        }
                        task.task_events.push(TaskEvent {
                            timestamp_ms: now,
                            status: target,
                            message,
                            scheduler: scheduler_host,
                        });
                        task
                    })?;
                    let Some(saved) = mutated else {
                        panic!("SAVE_STATE expected task {task_id} to be present");
                    };
                    provider.enqueue_event(SchedulerEvent::TaskStateChange(TaskStateChange {
                        task: saved,
                        previous: machine.previous_state(),
                    }));
                }

                SideEffect::Reschedule => {
                    let current = provider
                        .tasks
                        .fetch_task(task_id)?
                        .unwrap_or_else(|| panic!("RESCHEDULE expected task {task_id} to be present"));
                    info!(task_id, "task being rescheduled");

                    let penalty_ms = self.reschedule.flap_penalty_ms(&current);
                    let (new_state, audit) = if penalty_ms > 0 {
                        (
                            ScheduleStatus::Throttled,
                            format!("Rescheduled, penalized for {penalty_ms} ms for flapping"),
                        )
                    } else {
                        (ScheduleStatus::Pending, "Rescheduled".to_string())
                    };

                    let config = current.assigned.task.clone();
                    let instance_id = current.assigned.instance_id;
                    let mut replacement = ScheduledTask::new(
                        self.id_generator.generate(&config, instance_id),
                        instance_id,
                        config,
                    );
                    replacement.failure_count = current.failure_count;
                    replacement.ancestor_id = Some(task_id.to_string());
                    let replacement_id = replacement.id().to_string();
                    provider.tasks.save_tasks(&[replacement])?;
                    self.update_task(provider, &replacement_id, None, new_state, Some(audit))?;
                }

                SideEffect::TransitionToLost => {
                    self.update_task(
                        provider,
                        task_id,
                        None,
                        ScheduleStatus::Lost,
                        Some("Action performed on partitioned task, marking as LOST.".to_string()),
                    )?;
                }

                SideEffect::Kill => {
                    self.driver.kill_task(task_id);
                }

                SideEffect::Delete => {
                    let ids = BTreeSet::from([task_id.to_string()]);
                    self.delete_and_record(provider, &ids)?;
                }
            }
        }

        Ok(result.result)
    }

    fn delete_and_record(
        &self,
        provider: &mut StoreProvider<'_>,
        task_ids: &BTreeSet<String>,
    ) -> SchedulerResult<()> {
        let deleted = provider.tasks.delete_tasks(task_ids)?;
        if !deleted.is_empty() {
            provider.enqueue_event(SchedulerEvent::TasksDeleted(TasksDeleted { tasks: deleted }));
        }
        Ok(())
    }
}

/// Compact cyclical transitions into PARTITIONED so event history stays
/// bounded on flapping agents. Called while appending a PARTITIONED event:
/// when the last three events read `X, PARTITIONED, X`, the trailing
/// `PARTITIONED, X` pair is dropped (the earlier X remains). Histories
/// without a trailing cycle are untouched, so unique transitions survive.
pub fn compact_partition_events(events: Vec<TaskEvent>) -> Vec<TaskEvent> {
    let n = events.len();
    if n >= 3
        && events[n - 2].status == ScheduleStatus::Partitioned
        && events[n - 3].status == events[n - 1].status
    {
        let mut events = events;
        events.truncate(n - 2);
        return events;
    }
    events
}
