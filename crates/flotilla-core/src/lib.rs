//! flotilla-core — shared domain model for the Flotilla scheduler.
//!
//! Everything the scheduling subsystems exchange lives here:
//!
//! - Job, instance and task identity (`JobKey`, `InstanceKey`, task ids)
//! - The task lifecycle vocabulary (`ScheduleStatus`, `TaskEvent`)
//! - Resource requests, offered resource bags and port math
//! - Placement constraints and host attributes
//! - Tiers (preemption/revocability classes)
//! - The outbound agent `Driver` seam
//! - The injectable `Clock`
//!
//! This crate is dependency-light on purpose: all persisted types are plain
//! serde structs, and no component here performs I/O.

pub mod attributes;
pub mod clock;
pub mod constraints;
pub mod driver;
pub mod offer;
pub mod resources;
pub mod task;
pub mod tier;

pub use attributes::{Attribute, HostAttributes, MaintenanceMode, DEDICATED_ATTRIBUTE};
pub use clock::{Clock, FakeClock, SystemClock};
pub use constraints::{Constraint, LimitConstraint, TaskConstraint, ValueConstraint};
pub use driver::{Driver, LoggingDriver, RecordingDriver, TaskStatusReport};
pub use offer::Offer;
pub use resources::{PortRange, ResourceBag, ResourceQuantity, ResourceRequest};
pub use task::{
    AssignedTask, InstanceKey, JobKey, ScheduleStatus, ScheduledTask, TaskConfig, TaskEvent,
    TaskGroupKey,
};
pub use tier::Tier;
