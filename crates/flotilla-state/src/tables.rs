//! redb table definitions.
//!
//! All values are JSON-serialized into byte columns; keys are the natural
//! string key of each record type.

use redb::TableDefinition;

/// task id → `ScheduledTask`
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// host → `HostAttributes`
pub const HOST_ATTRIBUTES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("host_attributes");

/// role → `ResourceQuantity`
pub const QUOTAS: TableDefinition<&str, &[u8]> = TableDefinition::new("quotas");

/// single row: framework id
pub const SCHEDULER: TableDefinition<&str, &[u8]> = TableDefinition::new("scheduler");

/// Key of the single row in the `SCHEDULER` table.
pub const FRAMEWORK_ID_KEY: &str = "framework_id";
