//! Periodic task-status reconciliation with the agent fleet.
//!
//! Two loops: explicit reconciliation sends the status of every
//! agent-assigned task in batches; implicit reconciliation sends an empty
//! list, asking the fleet to report everything it knows. Both can also be
//! triggered manually.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use flotilla_core::{Driver, TaskStatusReport};
use flotilla_state::{Storage, TaskQuery};

use crate::error::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Delay before the first explicit run.
    pub initial_delay: Duration,
    pub explicit_interval: Duration,
    pub implicit_interval: Duration,
    /// Offset between the first explicit and first implicit run, so the
    /// two loops do not fire together.
    pub spread: Duration,
    pub batch_size: usize,
    /// Pause between batches of one explicit run.
    pub batch_delay: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10 * 60),
            explicit_interval: Duration::from_secs(60 * 60),
            implicit_interval: Duration::from_secs(180 * 60),
            spread: Duration::from_secs(30 * 60),
            batch_size: 1_000,
            batch_delay: Duration::from_secs(5),
        }
    }
}

impl ReconcilerSettings {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.initial_delay.checked_add(self.spread).is_none() {
            return Err(SchedulerError::InvalidSettings(
                "initial delay plus spread overflows".to_string(),
            ));
        }
        if self.explicit_interval.is_zero() || self.implicit_interval.is_zero() {
            return Err(SchedulerError::InvalidSettings(
                "reconciliation intervals must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(SchedulerError::InvalidSettings(
                "reconciliation batch size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct TaskReconciler {
    settings: ReconcilerSettings,
    storage: Storage,
    driver: Arc<dyn Driver>,
    explicit_runs: AtomicU64,
    implicit_runs: AtomicU64,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskReconciler {
    pub fn new(
        settings: ReconcilerSettings,
        storage: Storage,
        driver: Arc<dyn Driver>,
    ) -> SchedulerResult<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            storage,
            driver,
            explicit_runs: AtomicU64::new(0),
            implicit_runs: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Start both periodic loops.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let explicit = tokio::spawn(async move {
            tokio::time::sleep(this.settings.initial_delay).await;
            loop {
                this.run_explicit(None).await;
                tokio::time::sleep(this.settings.explicit_interval).await;
            }
        });

        let this = Arc::clone(self);
        let implicit = tokio::spawn(async move {
            tokio::time::sleep(this.settings.initial_delay + this.settings.spread).await;
            loop {
                this.run_implicit();
                tokio::time::sleep(this.settings.implicit_interval).await;
            }
        });

        let mut handles = self.handles.lock();
        handles.push(explicit);
        handles.push(implicit);
        info!("task reconciler started");
    }

    pub fn stop(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    /// Run one explicit pass now, optionally overriding the batch size.
    pub async fn trigger_explicit(&self, batch_size: Option<usize>) {
        self.run_explicit(batch_size).await;
    }

    /// Run one implicit pass now.
    pub fn trigger_implicit(&self) {
        self.run_implicit();
    }

    pub fn explicit_run_count(&self) -> u64 {
        self.explicit_runs.load(Ordering::SeqCst)
    }

    pub fn implicit_run_count(&self) -> u64 {
        self.implicit_runs.load(Ordering::SeqCst)
    }

    async fn run_explicit(&self, batch_size: Option<usize>) {
        let tasks = match self.storage.read(|p| p.tasks.fetch(&TaskQuery::agent_assigned())) {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "explicit reconciliation aborted: storage read failed");
                return;
            }
        };
        let statuses: Vec<TaskStatusReport> = tasks
            .iter()
            .map(|t| TaskStatusReport {
                task_id: t.id().to_string(),
                agent_id: t.assigned.agent_id.clone(),
                status: t.status,
            })
            .collect();

        let batch_size = batch_size.unwrap_or(self.settings.batch_size).max(1);
        let mut first = true;
        for batch in statuses.chunks(batch_size) {
            if !first {
                tokio::time::sleep(self.settings.batch_delay).await;
            }
            first = false;
            self.driver.reconcile_tasks(batch);
        }
        self.explicit_runs.fetch_add(1, Ordering::SeqCst);
        info!(tasks = statuses.len(), "explicit reconciliation run complete");
    }

    fn run_implicit(&self) {
        self.driver.reconcile_tasks(&[]);
        self.implicit_runs.fetch_add(1, Ordering::SeqCst);
        info!("implicit reconciliation requested");
    }
}

impl Drop for TaskReconciler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use flotilla_core::{
        JobKey, RecordingDriver, ResourceRequest, ScheduleStatus, ScheduledTask, TaskConfig, Tier,
    };
    use flotilla_state::EventBus;

    fn settings() -> ReconcilerSettings {
        ReconcilerSettings {
            initial_delay: Duration::from_secs(600),
            explicit_interval: Duration::from_secs(3_600),
            implicit_interval: Duration::from_secs(10_800),
            spread: Duration::from_secs(1_800),
            batch_size: 1,
            batch_delay: Duration::from_secs(3),
        }
    }

    fn assigned_task(id: &str, instance: u32) -> ScheduledTask {
        let mut task = ScheduledTask::new(
            id.to_string(),
            instance,
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
                is_service: true,
                max_task_failures: -1,
            },
        );
        task.status = ScheduleStatus::Assigned;
        task.assigned.agent_id = Some("agent-1".to_string());
        task
    }

    fn storage_with_tasks(tasks: &[ScheduledTask]) -> Storage {
        let storage = Storage::open_in_memory(Arc::new(EventBus::new())).unwrap();
        storage.write(|p| p.tasks.save_tasks(tasks)).unwrap();
        storage
    }

    #[test]
    fn settings_validation_rejects_overflow() {
        let bad = ReconcilerSettings {
            initial_delay: Duration::MAX,
            spread: Duration::from_secs(1),
            ..settings()
        };
        assert!(bad.validate().is_err());

        let bad = ReconcilerSettings {
            batch_size: 0,
            ..settings()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn loops_fire_on_schedule() {
        let driver = Arc::new(RecordingDriver::new());
        let storage = storage_with_tasks(&[assigned_task("t-1", 0), assigned_task("t-2", 1)]);
        let reconciler = Arc::new(
            TaskReconciler::new(settings(), storage, Arc::clone(&driver) as _).unwrap(),
        );
        reconciler.start();

        // Just past the initial delay: one explicit run, no implicit yet.
        tokio::time::sleep(Duration::from_secs(601 + 10)).await;
        assert_eq!(reconciler.explicit_run_count(), 1);
        assert_eq!(reconciler.implicit_run_count(), 0);

        // Past the spread: the first implicit run.
        tokio::time::sleep(Duration::from_secs(1_800)).await;
        assert_eq!(reconciler.implicit_run_count(), 1);

        // Past the explicit interval: a second explicit run.
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(reconciler.explicit_run_count(), 2);

        reconciler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_run_batches_statuses() {
        let driver = Arc::new(RecordingDriver::new());
        let storage = storage_with_tasks(&[assigned_task("t-1", 0), assigned_task("t-2", 1)]);
        let reconciler =
            Arc::new(TaskReconciler::new(settings(), storage, Arc::clone(&driver) as _).unwrap());

        // batch_size = 1 → two batches of one status each.
        reconciler.trigger_explicit(None).await;
        let batches = driver.reconciled.lock().clone();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].task_id, "t-1");
        assert_eq!(batches[0][0].status, ScheduleStatus::Assigned);

        // Batch override collapses the run into one message.
        reconciler.trigger_explicit(Some(10)).await;
        let batches = driver.reconciled.lock().clone();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 2);
        assert_eq!(reconciler.explicit_run_count(), 2);
    }

    #[tokio::test]
    async fn implicit_run_sends_empty_status_list() {
        let driver = Arc::new(RecordingDriver::new());
        let storage = storage_with_tasks(&[assigned_task("t-1", 0)]);
        let reconciler =
            Arc::new(TaskReconciler::new(settings(), storage, Arc::clone(&driver) as _).unwrap());

        reconciler.trigger_implicit();
        let batches = driver.reconciled.lock().clone();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_empty());
        assert_eq!(reconciler.implicit_run_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_tasks_are_not_reconciled() {
        let driver = Arc::new(RecordingDriver::new());
        let mut pending = assigned_task("t-1", 0);
        pending.status = ScheduleStatus::Pending;
        let storage = storage_with_tasks(&[pending]);
        let reconciler =
            Arc::new(TaskReconciler::new(settings(), storage, Arc::clone(&driver) as _).unwrap());

        reconciler.trigger_explicit(None).await;
        // An explicit run over zero agent-assigned tasks sends nothing.
        assert!(driver.reconciled.lock().is_empty());
        assert_eq!(reconciler.explicit_run_count(), 1);
    }
}
