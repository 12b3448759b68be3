//! Compensating actions for partially applied strategies

use crate::context::OperationContext;
use crate::db::queries::SqlBuilder;
use crate::db::SqlExecutor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Something a strategy created and must remove on rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CreatedObject {
    Table { name: String },
    View { name: String },
    /// Undone by renaming `to` back to `from`
    RenamedTable { from: String, to: String },
    /// Dependents of `table` changed by a step; `undo` runs in one transaction
    Dependents { table: String, undo: Vec<String> },
}

impl CreatedObject {
    pub fn table(name: &str) -> Self {
        CreatedObject::Table { name: name.to_string() }
    }

    pub fn view(name: &str) -> Self {
        CreatedObject::View { name: name.to_string() }
    }

    pub fn renamed(from: &str, to: &str) -> Self {
        CreatedObject::RenamedTable {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn dependents(table: &str, undo: Vec<String>) -> Self {
        CreatedObject::Dependents {
            table: table.to_string(),
            undo,
        }
    }

    /// Statements that remove the object, tolerant of it being gone already
    pub fn undo_statements(&self) -> Vec<String> {
        match self {
            CreatedObject::Table { name } => vec![SqlBuilder::drop_table_if_exists(name)],
            CreatedObject::View { name } => vec![SqlBuilder::drop_view(name)],
            CreatedObject::RenamedTable { from, to } => vec![SqlBuilder::rename_table_if_exists(to, from)],
            CreatedObject::Dependents { undo, .. } => undo.clone(),
        }
    }
}

impl fmt::Display for CreatedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreatedObject::Table { name } => write!(f, "table {}", name),
            CreatedObject::View { name } => write!(f, "view {}", name),
            CreatedObject::RenamedTable { from, to } => write!(f, "rename {} -> {}", from, to),
            CreatedObject::Dependents { table, undo } => write!(f, "{} dependent changes on {}", undo.len(), table),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    pub success: bool,
    pub rolled_back: Vec<String>,
    pub errors: Vec<String>,
}

pub struct RollbackManager {
    executor: Arc<dyn SqlExecutor>,
}

impl RollbackManager {
    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self { executor }
    }

    /// Undo `created` in reverse creation order. Each undo runs on its own so
    /// one failure does not stop the rest; failures are collected.
    pub async fn execute_rollback(&self, ctx: &OperationContext, created: &[CreatedObject]) -> RollbackResult {
        let mut result = RollbackResult {
            success: true,
            ..RollbackResult::default()
        };

        for object in created.iter().rev() {
            let statements = object.undo_statements();
            let undone = match statements.as_slice() {
                [] => Ok(0),
                [sql] => ctx.ddl("rollback_created_object", self.executor.execute(sql)).await,
                _ => {
                    ctx.ddl(
                        "rollback_created_object",
                        self.executor.execute_in_transaction(&statements),
                    )
                    .await
                }
            };
            match undone {
                Ok(_) => result.rolled_back.push(object.to_string()),
                Err(e) => {
                    warn!("⚠️  Could not roll back {}: {}", object, e);
                    result.success = false;
                    result.errors.push(format!("{}: {}", object, e));
                }
            }
        }

        if !created.is_empty() {
            info!(
                "⏪ Rolled back {}/{} created objects",
                result.rolled_back.len(),
                created.len()
            );
        }
        result
    }
}
