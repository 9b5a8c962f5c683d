//! Tile job aggregate - domain model and state transitions.
//!
//! This module contains the core domain logic for tile jobs:
//! - Job types and states (typestate pattern)
//! - State transition methods
//! - Progress and failure value objects

pub mod state;
pub mod transitions;

pub use state::*;
pub use transitions::RetryConfig;
