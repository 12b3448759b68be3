//! Application state shared across handlers
//!
//! Holds the analyzers wired to one catalog. Nothing here executes DDL
//! against production; the executor is only used for health probes.

use crate::analysis::dependency::DependencyAnalyzer;
use crate::analysis::foreign_key::ForeignKeyAnalyzer;
use crate::analysis::table_rename::TableRenameAnalyzer;
use crate::config::EngineConfig;
use crate::context::OperationContext;
use crate::db::{CatalogClient, SqlExecutor};
use crate::removal::ColumnRemovalManager;
use crate::rename::health::DatabaseHealthCheck;
use std::sync::Arc;

pub struct AppState {
    pub dependencies: DependencyAnalyzer,
    pub foreign_keys: ForeignKeyAnalyzer,
    pub renames: TableRenameAnalyzer,
    pub removals: ColumnRemovalManager,
    pub database_health: DatabaseHealthCheck,
    pub engine: EngineConfig,
}

impl AppState {
    pub fn new(catalog: Arc<dyn CatalogClient>, executor: Arc<dyn SqlExecutor>, engine: EngineConfig) -> Self {
        Self {
            dependencies: DependencyAnalyzer::new(catalog.clone()),
            foreign_keys: ForeignKeyAnalyzer::new(catalog.clone(), engine.max_fk_chain_depth),
            renames: TableRenameAnalyzer::new(catalog.clone()),
            removals: ColumnRemovalManager::new(catalog, executor.clone(), engine.clone()),
            database_health: DatabaseHealthCheck::new(executor, engine.catalog_query_timeout),
            engine,
        }
    }

    /// Fresh context for one request
    pub fn context(&self) -> OperationContext {
        OperationContext::new(&self.engine)
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
