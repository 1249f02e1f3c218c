//! flotilla-machine — the authoritative task lifecycle state machine.
//!
//! Pure evaluation: given a task's current state and a requested target
//! state, produce a [`TransitionResult`] describing whether the transition
//! is legal and which side-effects the state manager must apply. The
//! machine never touches storage or the driver itself.
//!
//! Side-effects carry a total order (see [`SideEffect`]); results always
//! present them in that order regardless of how they were derived.

mod machine;
mod transition;

pub use machine::TaskStateMachine;
pub use transition::{SideEffect, StateChangeResult, TransitionResult};
