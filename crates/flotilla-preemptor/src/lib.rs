//! flotilla-preemptor — making room for high-tier work.
//!
//! A periodic pass over tasks that stayed PENDING: for each, search the
//! cluster for an agent whose strictly-lower-tier tasks can be killed to
//! free enough resources, issue the kills (PREEMPTING transitions), and
//! reserve the agent for the pending task until the next scheduling pass
//! consumes the slot.

mod cluster_state;
mod preemptor;

pub use cluster_state::{ClusterSnapshot, Victim};
pub use preemptor::{Preemptor, PreemptorSettings};
