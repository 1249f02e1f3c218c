//! flotilla-state — durable state and the commit-ordered event bus.
//!
//! All durable scheduler state (tasks, host attributes, quotas, the
//! framework id) lives behind [`Storage`]: a redb database exposing a
//! single-writer transactional boundary. Mutations happen inside a
//! `write` closure against typed sub-stores; events enqueued during the
//! closure are delivered to the [`EventBus`] only after the transaction
//! commits.
//!
//! # Architecture
//!
//! ```text
//! Storage
//!   ├── write(|provider| ...)   single write lane, atomic commit
//!   │     ├── TaskStore         CRUD + TaskQuery scans
//!   │     ├── AttributeStore    merge-on-save host attributes
//!   │     ├── QuotaStore        role → resource aggregate
//!   │     └── SchedulerStore    framework id
//!   ├── read(|provider| ...)    snapshot-isolated reads
//!   └── EventBus                typed channels, post-commit delivery
//! ```

pub mod attribute_store;
pub mod error;
pub mod events;
pub mod query;
pub mod quota_store;
pub mod scheduler_store;
pub mod storage;
mod tables;
pub mod task_store;

pub use attribute_store::AttributeStore;
pub use error::{StateError, StateResult};
pub use events::{
    EventBus, HostAttributesChanged, SchedulerEvent, TaskStateChange, TasksDeleted,
};
pub use query::TaskQuery;
pub use quota_store::QuotaStore;
pub use scheduler_store::SchedulerStore;
pub use storage::{ReadProvider, Storage, StoreProvider};
pub use task_store::TaskStore;
