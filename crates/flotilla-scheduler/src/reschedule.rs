//! Flap detection for rescheduled tasks.
//!
//! A task whose previous incarnation died shortly after starting is
//! "flapping"; its replacement is routed through THROTTLED with a backoff
//! penalty instead of going straight back to PENDING.

use std::sync::Arc;
use std::time::Duration;

use flotilla_core::{Clock, ScheduledTask};

/// Consulted by the state manager whenever a RESCHEDULE side-effect fires.
pub trait RescheduleCalculator: Send + Sync {
    /// Penalty in milliseconds for the replacement task. Zero means the
    /// replacement goes straight to PENDING.
    fn flap_penalty_ms(&self, task: &ScheduledTask) -> u64;
}

#[derive(Debug, Clone)]
pub struct FlapPenaltySettings {
    /// Tasks that lived shorter than this are considered flapping.
    pub flapping_threshold: Duration,
    /// Penalty for the first flap.
    pub initial_penalty: Duration,
    /// Penalty ceiling; backoff doubles per accumulated failure up to here.
    pub max_penalty: Duration,
}

impl Default for FlapPenaltySettings {
    fn default() -> Self {
        Self {
            flapping_threshold: Duration::from_secs(5 * 60),
            initial_penalty: Duration::from_secs(30),
            max_penalty: Duration::from_secs(5 * 60),
        }
    }
}

pub struct FlapPenaltyCalculator {
    settings: FlapPenaltySettings,
    clock: Arc<dyn Clock>,
}

impl FlapPenaltyCalculator {
    pub fn new(settings: FlapPenaltySettings, clock: Arc<dyn Clock>) -> Self {
        Self { settings, clock }
    }
}

impl RescheduleCalculator for FlapPenaltyCalculator {
    fn flap_penalty_ms(&self, task: &ScheduledTask) -> u64 {
        let Some(first) = task.task_events.first() else {
            return 0;
        };
        let lifetime_ms = self.clock.now_millis().saturating_sub(first.timestamp_ms);
        if lifetime_ms >= self.settings.flapping_threshold.as_millis() as u64 {
            return 0;
        }
        // Truncated exponential backoff keyed on accumulated failures.
        let doublings = task.failure_count.min(16);
        let penalty = self.settings.initial_penalty.as_millis() as u64
            * 2u64.saturating_pow(doublings);
        penalty.min(self.settings.max_penalty.as_millis() as u64)
    }
}

/// Disables flap detection (tests, or clusters that prefer hot restart
/// loops over throttling).
pub struct NoPenalty;

impl RescheduleCalculator for NoPenalty {
    fn flap_penalty_ms(&self, _task: &ScheduledTask) -> u64 {
        0
    }
}
