//! Scheduler error types.

use thiserror::Error;

use flotilla_core::JobKey;
use flotilla_state::StateError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// An instance requested for insertion is already active for the job.
    #[error("instance ID collision for {job}: instances {instances:?} are active")]
    InstanceCollision { job: JobKey, instances: Vec<u32> },

    #[error("failed to resolve local hostname: {0}")]
    HostResolution(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("storage error: {0}")]
    State(#[from] StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
