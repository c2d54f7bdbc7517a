//! Source health tracking.
//!
//! [`SourceStateMachine`] models one source; [`StateManager`] owns them all
//! and decides which sources are fetched in a round.

pub mod machine;
pub mod manager;

pub use machine::{
    next_state, SourceEvent, SourceState, SourceStateMachine, TransitionData, TransitionRecord,
};
pub use manager::{StateManager, StatePolicy, StateStats};
