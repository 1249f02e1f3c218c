//! Short-lived agent reservations consumed by the scheduling pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use flotilla_core::{Clock, InstanceKey};

/// Reservations made on behalf of an active job update. Job-update
/// orchestration is an external collaborator; this is its seam into the
/// scheduling pass.
pub trait UpdateAgentReserver: Send + Sync {
    /// The host reserved for this instance, if an update claimed one.
    fn reserved_host(&self, instance: &InstanceKey) -> Option<String>;

    /// Release the reservation once the instance is placed (or the
    /// attempt failed).
    fn release(&self, host: &str, instance: &InstanceKey);
}

/// Reserver used when no job-update orchestrator is wired in.
pub struct NullUpdateAgentReserver;

impl UpdateAgentReserver for NullUpdateAgentReserver {
    fn reserved_host(&self, _instance: &InstanceKey) -> Option<String> {
        None
    }

    fn release(&self, _host: &str, _instance: &InstanceKey) {}
}

struct Reservation {
    task_id: String,
    expires_at_nanos: u64,
}

/// host → pending-task bindings produced by the preemptor. Bounded
/// lifetime; expired entries are pruned on access.
pub struct PreemptionReservations {
    entries: Mutex<HashMap<String, Reservation>>,
    clock: Arc<dyn Clock>,
    lifetime: Duration,
}

impl PreemptionReservations {
    pub fn new(clock: Arc<dyn Clock>, lifetime: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            lifetime,
        }
    }

    pub fn reserve(&self, host: &str, task_id: &str) {
        debug!(host, task_id, "reserving preemption slot");
        self.entries.lock().insert(
            host.to_string(),
            Reservation {
                task_id: task_id.to_string(),
                expires_at_nanos: self
                    .clock
                    .monotonic_nanos()
                    .saturating_add(self.lifetime.as_nanos() as u64),
            },
        );
    }

    /// The host reserved for `task_id`, if a live reservation exists.
    pub fn reserved_host(&self, task_id: &str) -> Option<String> {
        let now = self.clock.monotonic_nanos();
        let mut entries = self.entries.lock();
        entries.retain(|_, r| r.expires_at_nanos > now);
        entries
            .iter()
            .find(|(_, r)| r.task_id == task_id)
            .map(|(host, _)| host.clone())
    }

    /// Whether `host` currently holds a live reservation.
    pub fn is_reserved(&self, host: &str) -> bool {
        let now = self.clock.monotonic_nanos();
        self.entries
            .lock()
            .get(host)
            .is_some_and(|r| r.expires_at_nanos > now)
    }

    pub fn release(&self, host: &str) {
        self.entries.lock().remove(host);
    }

    pub fn active_count(&self) -> usize {
        let now = self.clock.monotonic_nanos();
        let mut entries = self.entries.lock();
        entries.retain(|_, r| r.expires_at_nanos > now);
        entries.len()
    }
}
