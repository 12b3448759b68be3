//! SchemaFlow Evolve
//!
//! Schema migration safety and zero-downtime evolution engine. Answers
//! "what breaks if I drop this column or rename this table" before any DDL
//! runs, then applies the change in staged, transactional steps with backup,
//! rollback and health-gated deployment strategies.

pub mod analysis;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod removal;
pub mod rename;
pub mod report;
pub mod routes;
pub mod schema;
pub mod staging;
pub mod state;

#[cfg(test)]
mod testing;

pub use analysis::dependency::DependencyAnalyzer;
pub use analysis::foreign_key::ForeignKeyAnalyzer;
pub use analysis::risk::RiskAssessmentEngine;
pub use analysis::table_rename::TableRenameAnalyzer;
pub use config::{EngineConfig, Settings};
pub use context::{CancellationToken, OperationContext};
pub use error::{AppError, AppResult};
pub use orchestrator::CompleteRenameOrchestrator;
pub use removal::ColumnRemovalManager;
pub use rename::coordination::RenameCoordinationEngine;
pub use rename::strategy::ApplicationSafeRenameStrategy;
pub use report::ImpactReporter;
pub use staging::StagingEnvironmentManager;
