//! Airlift assignment engine.
//!
//! Assigns every job without an instance to exactly one instance, under
//! one of two policies: uniform random choice, or multi-knapsack packing
//! against per-instance cpu capacity.

mod assign;
mod error;

pub use assign::{assign_jobs, knapsack_assign, log_distribution, random_assign};
pub use error::{PlacementError, PlacementResult};
