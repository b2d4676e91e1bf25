//! Shared utilities for the silta bridge workspace.

pub mod state_machine;

pub use state_machine::StateMachine;
