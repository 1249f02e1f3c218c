//! Task id generation.

use uuid::Uuid;

use flotilla_core::TaskConfig;

/// Produces unique, log-attributable task ids.
pub trait TaskIdGenerator: Send + Sync {
    fn generate(&self, config: &TaskConfig, instance_id: u32) -> String;
}

/// The production generator: job path and instance id, made unique with a
/// random suffix so rescheduled replacements never collide.
pub struct UuidTaskIdGenerator;

impl TaskIdGenerator for UuidTaskIdGenerator {
    fn generate(&self, config: &TaskConfig, instance_id: u32) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            config.job.role,
            config.job.environment,
            config.job.name,
            instance_id,
            Uuid::new_v4()
        )
    }
}
