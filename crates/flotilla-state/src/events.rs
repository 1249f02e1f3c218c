//! Typed event channels with synchronous, commit-ordered delivery.
//!
//! One channel per event category; subscribers register at wiring time and
//! are invoked inline when `Storage::write` delivers the events of a
//! committed transaction. Delivery order is commit order, and within one
//! transaction the order the events were enqueued.

use parking_lot::RwLock;

use flotilla_core::{HostAttributes, ScheduleStatus, ScheduledTask};

/// A task changed state. `previous` is absent for freshly inserted tasks.
#[derive(Debug, Clone)]
pub struct TaskStateChange {
    pub task: ScheduledTask,
    pub previous: Option<ScheduleStatus>,
}

/// Tasks were removed from the store.
#[derive(Debug, Clone)]
pub struct TasksDeleted {
    pub tasks: Vec<ScheduledTask>,
}

/// A host's attribute record changed.
#[derive(Debug, Clone)]
pub struct HostAttributesChanged {
    pub attributes: HostAttributes,
}

/// The union carried through a transaction's pending-event queue.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    TaskStateChange(TaskStateChange),
    TasksDeleted(TasksDeleted),
    HostAttributesChanged(HostAttributesChanged),
    /// The scheduler became the active leader for its framework.
    SchedulerActive,
}

type Subscriber<E> = Box<dyn Fn(&E) + Send + Sync>;

/// The per-category subscriber registry.
#[derive(Default)]
pub struct EventBus {
    task_state: RwLock<Vec<Subscriber<TaskStateChange>>>,
    deleted: RwLock<Vec<Subscriber<TasksDeleted>>>,
    host_attributes: RwLock<Vec<Subscriber<HostAttributesChanged>>>,
    scheduler_active: RwLock<Vec<Subscriber<()>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_task_state_change(&self, f: impl Fn(&TaskStateChange) + Send + Sync + 'static) {
        self.task_state.write().push(Box::new(f));
    }

    pub fn on_tasks_deleted(&self, f: impl Fn(&TasksDeleted) + Send + Sync + 'static) {
        self.deleted.write().push(Box::new(f));
    }

    pub fn on_host_attributes_changed(
        &self,
        f: impl Fn(&HostAttributesChanged) + Send + Sync + 'static,
    ) {
        self.host_attributes.write().push(Box::new(f));
    }

    pub fn on_scheduler_active(&self, f: impl Fn(&()) + Send + Sync + 'static) {
        self.scheduler_active.write().push(Box::new(f));
    }

    /// Deliver one event to its channel, synchronously.
    pub fn publish(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::TaskStateChange(e) => {
                for subscriber in self.task_state.read().iter() {
                    subscriber(e);
                }
            }
            SchedulerEvent::TasksDeleted(e) => {
                for subscriber in self.deleted.read().iter() {
                    subscriber(e);
                }
            }
            SchedulerEvent::HostAttributesChanged(e) => {
                for subscriber in self.host_attributes.read().iter() {
                    subscriber(e);
                }
            }
            SchedulerEvent::SchedulerActive => {
                for subscriber in self.scheduler_active.read().iter() {
                    subscriber(&());
                }
            }
        }
    }
}
