//! Role synchronization.
//!
//! - `rules`: rule data and the pure single-pass planner
//! - `debounce`: per-member cooldown for event-driven evaluation
//! - `service`: `RoleSync`: evaluation, events, sweeps, migration

pub mod debounce;
pub mod rules;
pub mod service;

pub use debounce::DebounceGuard;
pub use rules::{RoleChange, RoleRule, plan_changes};
pub use service::{
    Evaluation, MigrationConfig, MigrationSummary, RoleSync, SweepSummary, UpdateOutcome,
};
