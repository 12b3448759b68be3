//! Table rename execution
//!
//! `coordination` applies a rename and recreates its dependents atomically;
//! `strategy` moves running applications over without downtime; `rollback`
//! undoes whatever a strategy created; `health` holds the external
//! health-check and restart contracts.

pub mod coordination;
pub mod health;
pub mod rollback;
pub mod strategy;

pub use coordination::{CoordinationResult, RenameCoordinationEngine};
pub use strategy::{ApplicationSafeRenameStrategy, RenameState, StrategyExecutionResult, ZeroDowntimeStrategy};
