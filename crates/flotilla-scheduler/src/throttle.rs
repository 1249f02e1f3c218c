//! Releasing throttled tasks back into the pending queue.
//!
//! Flap-penalized replacements land in THROTTLED; this worker watches the
//! task-state channel and schedules each one's release once its penalty
//! elapses. The release is a CAS transition so a task killed while
//! throttled is left alone.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use flotilla_core::ScheduleStatus;
use flotilla_state::{EventBus, Storage};

use crate::reschedule::RescheduleCalculator;
use crate::state_manager::StateManager;

pub struct TaskThrottler {
    storage: Storage,
    state_manager: Arc<StateManager>,
    reschedule: Arc<dyn RescheduleCalculator>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskThrottler {
    pub fn new(
        storage: Storage,
        state_manager: Arc<StateManager>,
        reschedule: Arc<dyn RescheduleCalculator>,
    ) -> Self {
        Self {
            storage,
            state_manager,
            reschedule,
            worker: Mutex::new(None),
        }
    }

    /// Subscribe to the task-state channel and start the release worker.
    pub fn start(self: &Arc<Self>, bus: &EventBus) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, u64)>();

        let penalties = Arc::clone(&self.reschedule);
        bus.on_task_state_change(move |change| {
            if change.task.status == ScheduleStatus::Throttled {
                let penalty_ms = penalties.flap_penalty_ms(&change.task).max(1);
                let _ = tx.send((change.task.id().to_string(), penalty_ms));
            }
        });

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some((task_id, penalty_ms)) = rx.recv().await {
                let this = Arc::clone(&this);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(penalty_ms)).await;
                    this.release(&task_id);
                });
            }
        });
        *self.worker.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }

    /// Move one task THROTTLED → PENDING, if it is still throttled.
    pub fn release(&self, task_id: &str) {
        let result = self.storage.write(|provider| {
            self.state_manager.change_state(
                provider,
                task_id,
                Some(ScheduleStatus::Throttled),
                ScheduleStatus::Pending,
                Some("Throttle penalty expired".to_string()),
            )
        });
        match result {
            Ok(outcome) => debug!(task_id, ?outcome, "throttle release attempted"),
            Err(e) => error!(task_id, error = %e, "throttle release failed"),
        }
    }
}

impl Drop for TaskThrottler {
    fn drop(&mut self) {
        self.stop();
    }
}
