//! Transition evaluation.

use tracing::debug;

use flotilla_core::{ScheduleStatus, ScheduledTask};

use crate::transition::{SideEffect, StateChangeResult, TransitionResult};

use ScheduleStatus::*;
use SideEffect::*;

/// The lifecycle machine for one task.
///
/// Built from the stored record (or from a bare id when the task is not in
/// the store) and asked to evaluate a single transition. The machine holds
/// only the facts it needs: the current state and the retry posture.
pub struct TaskStateMachine {
    task_id: String,
    state: MachineState,
}

enum MachineState {
    Present {
        status: ScheduleStatus,
        /// Whether the task is rescheduled when it finishes cleanly.
        is_service: bool,
        /// Whether another failure still permits a retry.
        permits_retry: bool,
    },
    /// The task is not in the store (deleted, or never existed).
    Missing,
}

impl TaskStateMachine {
    pub fn for_task(task: &ScheduledTask) -> Self {
        Self {
            task_id: task.id().to_string(),
            state: MachineState::Present {
                status: task.status,
                is_service: task.assigned.task.is_service,
                permits_retry: task.assigned.task.permits_retry(task.failure_count),
            },
        }
    }

    pub fn for_missing(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            state: MachineState::Missing,
        }
    }

    /// The state the task was in before evaluation, if it exists.
    pub fn previous_state(&self) -> Option<ScheduleStatus> {
        match &self.state {
            MachineState::Present { status, .. } => Some(*status),
            MachineState::Missing => None,
        }
    }

    /// Evaluate a transition to `target`, optionally guarded by a
    /// compare-and-set expectation on the prior state.
    pub fn evaluate(
        &self,
        cas_state: Option<ScheduleStatus>,
        target: ScheduleStatus,
    ) -> TransitionResult {
        let (status, is_service, permits_retry) = match &self.state {
            MachineState::Present {
                status,
                is_service,
                permits_retry,
            } => {
                if let Some(expected) = cas_state {
                    if expected != *status {
                        return TransitionResult::bare(StateChangeResult::InvalidCas);
                    }
                }
                (*status, *is_service, *permits_retry)
            }
            MachineState::Missing => {
                if cas_state.is_some() {
                    return TransitionResult::bare(StateChangeResult::InvalidCas);
                }
                return self.evaluate_missing(target);
            }
        };

        let result = evaluate_present(status, target, is_service, permits_retry);
        if result.result == StateChangeResult::Illegal {
            debug!(
                task_id = %self.task_id,
                from = %status,
                to = %target,
                "illegal state transition requested"
            );
        }
        result
    }

    /// A report arrived for a task that is not in the store. Live reports
    /// mean a zombie is running somewhere: answer with a kill. Terminal
    /// reports are stale echoes of a deleted task.
    fn evaluate_missing(&self, target: ScheduleStatus) -> TransitionResult {
        match target {
            Assigned | Starting | Running => {
                debug!(task_id = %self.task_id, report = %target, "killing unknown task");
                TransitionResult::new(StateChangeResult::Illegal, vec![Kill])
            }
            Finished | Failed | Killed | Lost => TransitionResult::bare(StateChangeResult::Noop),
            _ => TransitionResult::bare(StateChangeResult::Illegal),
        }
    }
}

fn evaluate_present(
    current: ScheduleStatus,
    target: ScheduleStatus,
    is_service: bool,
    permits_retry: bool,
) -> TransitionResult {
    if current == target {
        return TransitionResult::bare(StateChangeResult::Noop);
    }
    if current.is_terminal() {
        // Terminal tasks are never mutated except for deletion.
        return TransitionResult::bare(StateChangeResult::Illegal);
    }

    let success = |effects| TransitionResult::new(StateChangeResult::Success, effects);

    // Terminal handling shared by every live state the agent can report on.
    let finished = || {
        if is_service {
            success(vec![SaveState, Reschedule, Delete])
        } else {
            success(vec![SaveState, Delete])
        }
    };
    let failed = || {
        if permits_retry {
            success(vec![IncrementFailures, SaveState, Reschedule, Delete])
        } else {
            success(vec![IncrementFailures, SaveState, Delete])
        }
    };
    // Killed without the scheduler asking for it: something external took
    // the task down, so it goes back in the queue.
    let externally_killed = || success(vec![SaveState, Reschedule, Delete]);
    let lost = || success(vec![SaveState, Reschedule, Kill, Delete]);

    match (current, target) {
        (Init, Pending) => success(vec![SaveState]),
        (Init, Throttled) => success(vec![SaveState]),

        (Throttled, Pending) => success(vec![SaveState]),
        (Throttled, Killing) => success(vec![SaveState, Delete]),

        (Pending, Assigned) => success(vec![SaveState]),
        // Killing a task that was never launched needs no agent traffic.
        (Pending, Killing) => success(vec![SaveState, Delete]),

        (Assigned, Starting) => success(vec![SaveState]),
        (Assigned | Starting | Partitioned, Running) => success(vec![SaveState]),
        (Partitioned, Starting) => success(vec![SaveState]),

        (Assigned | Starting | Running | Preempting | Restarting | Draining | Killing, Partitioned) => {
            success(vec![SaveState])
        }

        (Assigned | Starting | Running, Killing) => success(vec![Kill, SaveState]),
        (Assigned | Starting | Running, Preempting) => success(vec![Kill, SaveState]),
        (Assigned | Starting | Running, Restarting) => success(vec![Kill, SaveState]),
        (Assigned | Starting | Running, Draining) => success(vec![Kill, SaveState]),

        // A command against a partitioned task first declares it lost; the
        // recursive LOST transition reschedules and cleans up.
        (Partitioned, Killing | Preempting | Restarting | Draining) => {
            success(vec![TransitionToLost])
        }
        (Partitioned, Lost) => success(vec![SaveState, Reschedule, Kill, Delete]),
        (Partitioned, Finished) => finished(),
        (Partitioned, Failed) => failed(),
        (Partitioned, Killed) => externally_killed(),

        (Assigned | Starting | Running, Finished) => finished(),
        (Assigned | Starting | Running, Failed) => failed(),
        (Assigned | Starting | Running, Killed) => externally_killed(),
        (Assigned | Starting | Running, Lost) => lost(),

        // The kill was user-initiated: no resurrection on any outcome.
        (Killing, Finished | Failed | Killed | Lost) => success(vec![SaveState, Delete]),

        // Kills issued to make room or rotate: the task returns to the queue.
        (Preempting | Restarting | Draining, Finished | Failed | Killed | Lost) => {
            success(vec![SaveState, Reschedule, Delete])
        }

        // An operator kill overrides a preemption or rotation in flight:
        // the task will not be resurrected once the agent confirms.
        (Preempting | Restarting | Draining, Killing) => success(vec![SaveState]),

        // Stale liveness reports racing a kill in flight.
        (Killing | Preempting | Restarting | Draining, Starting | Running) => {
            TransitionResult::bare(StateChangeResult::Noop)
        }

        _ => TransitionResult::bare(StateChangeResult::Illegal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use flotilla_core::{JobKey, ResourceRequest, TaskConfig, Tier};

    fn task(status: ScheduleStatus, is_service: bool, max_failures: i32) -> ScheduledTask {
        let mut t = ScheduledTask::new(
            "t-0".to_string(),
            0,
            TaskConfig {
                job: JobKey::new("ops", "prod", "web"),
                tier: Tier::Preferred,
                resources: ResourceRequest {
                    cpus: 1.0,
                    ram_mb: 128,
                    disk_mb: 0,
                    requested_ports: BTreeSet::new(),
                },
                constraints: Vec::new(),
                is_service,
                max_task_failures: max_failures,
            },
        );
        t.status = status;
        t
    }

    fn evaluate(current: ScheduleStatus, target: ScheduleStatus) -> TransitionResult {
        TaskStateMachine::for_task(&task(current, true, -1)).evaluate(None, target)
    }

    #[test]
    fn insertion_edge() {
        let result = evaluate(Init, Pending);
        assert_eq!(result.result, StateChangeResult::Success);
        assert_eq!(result.side_effects(), &[SaveState]);
    }

    #[test]
    fn assignment_edge() {
        let result = evaluate(Pending, Assigned);
        assert_eq!(result.result, StateChangeResult::Success);
        assert_eq!(result.side_effects(), &[SaveState]);
    }

    #[test]
    fn user_kill_issues_kill_before_save_order_is_canonical() {
        let result = evaluate(Running, Killing);
        assert_eq!(result.result, StateChangeResult::Success);
        // Canonical order puts SAVE_STATE ahead of KILL.
        assert_eq!(result.side_effects(), &[SaveState, Kill]);
    }

    #[test]
    fn kill_confirmation_deletes_without_reschedule() {
        let result = evaluate(Killing, Killed);
        assert_eq!(result.result, StateChangeResult::Success);
        assert_eq!(result.side_effects(), &[SaveState, Delete]);
    }

    #[test]
    fn service_finish_reschedules() {
        let result = evaluate(Running, Finished);
        assert_eq!(
            result.side_effects(),
            &[SaveState, Reschedule, Delete]
        );
    }

    #[test]
    fn adhoc_finish_does_not_reschedule() {
        let machine = TaskStateMachine::for_task(&task(Running, false, 1));
        let result = machine.evaluate(None, Finished);
        assert_eq!(result.side_effects(), &[SaveState, Delete]);
    }

    #[test]
    fn failure_with_retries_left() {
        let machine = TaskStateMachine::for_task(&task(Running, false, 5));
        let result = machine.evaluate(None, Failed);
        assert_eq!(
            result.side_effects(),
            &[IncrementFailures, SaveState, Reschedule, Delete]
        );
    }

    #[test]
    fn failure_with_retries_exhausted() {
        let mut exhausted = task(Running, false, 2);
        exhausted.failure_count = 1;
        let machine = TaskStateMachine::for_task(&exhausted);
        let result = machine.evaluate(None, Failed);
        assert_eq!(
            result.side_effects(),
            &[IncrementFailures, SaveState, Delete]
        );
    }

    #[test]
    fn partition_and_reappearance() {
        assert_eq!(
            evaluate(Running, Partitioned).side_effects(),
            &[SaveState]
        );
        assert_eq!(
            evaluate(Partitioned, Running).side_effects(),
            &[SaveState]
        );
    }

    #[test]
    fn partition_timeout_goes_lost() {
        let result = evaluate(Partitioned, Lost);
        assert_eq!(
            result.side_effects(),
            &[SaveState, Reschedule, Kill, Delete]
        );
    }

    #[test]
    fn command_against_partitioned_task_transitions_to_lost() {
        for command in [Killing, Preempting, Restarting, Draining] {
            let result = evaluate(Partitioned, command);
            assert_eq!(result.result, StateChangeResult::Success);
            assert_eq!(result.side_effects(), &[TransitionToLost]);
        }
    }

    #[test]
    fn preemption_victim_reschedules_on_kill_confirmation() {
        assert_eq!(
            evaluate(Running, Preempting).side_effects(),
            &[SaveState, Kill]
        );
        assert_eq!(
            evaluate(Preempting, Killed).side_effects(),
            &[SaveState, Reschedule, Delete]
        );
    }

    #[test]
    fn terminal_states_are_frozen() {
        for terminal in [Finished, Failed, Killed, Lost] {
            for target in [Pending, Running, Killing, Lost] {
                if terminal == target {
                    continue;
                }
                let result = evaluate(terminal, target);
                assert_eq!(result.result, StateChangeResult::Illegal);
                assert!(result.side_effects().is_empty());
            }
        }
    }

    #[test]
    fn same_state_is_noop() {
        let result = evaluate(Running, Running);
        assert_eq!(result.result, StateChangeResult::Noop);
        assert!(result.side_effects().is_empty());
    }

    #[test]
    fn stale_running_report_during_kill_is_noop() {
        let result = evaluate(Killing, Running);
        assert_eq!(result.result, StateChangeResult::Noop);
    }

    #[test]
    fn cas_mismatch_blocks_side_effects() {
        let machine = TaskStateMachine::for_task(&task(Pending, true, -1));
        let result = machine.evaluate(Some(Starting), Assigned);
        assert_eq!(result.result, StateChangeResult::InvalidCas);
        assert!(result.side_effects().is_empty());
    }

    #[test]
    fn cas_match_proceeds() {
        let machine = TaskStateMachine::for_task(&task(Pending, true, -1));
        let result = machine.evaluate(Some(Pending), Assigned);
        assert_eq!(result.result, StateChangeResult::Success);
    }

    #[test]
    fn cas_on_missing_task_is_invalid() {
        let machine = TaskStateMachine::for_missing("ghost");
        let result = machine.evaluate(Some(Running), Killing);
        assert_eq!(result.result, StateChangeResult::InvalidCas);
    }

    #[test]
    fn live_report_for_unknown_task_shoots_it() {
        let machine = TaskStateMachine::for_missing("ghost");
        let result = machine.evaluate(None, Running);
        assert_eq!(result.result, StateChangeResult::Illegal);
        assert_eq!(result.side_effects(), &[Kill]);
    }

    #[test]
    fn terminal_report_for_unknown_task_is_noop() {
        let machine = TaskStateMachine::for_missing("ghost");
        let result = machine.evaluate(None, Killed);
        assert_eq!(result.result, StateChangeResult::Noop);
        assert!(result.side_effects().is_empty());
    }

    #[test]
    fn pending_kill_needs_no_agent_traffic() {
        let result = evaluate(Pending, Killing);
        assert_eq!(result.side_effects(), &[SaveState, Delete]);
    }

    #[test]
    fn throttled_released_to_pending() {
        let result = evaluate(Throttled, Pending);
        assert_eq!(result.side_effects(), &[SaveState]);
    }
}
