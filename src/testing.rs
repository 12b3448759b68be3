//! Scripted collaborators for unit tests
//!
//! `ScriptedCatalog` hands back canned rows per table and leaves
//! column-level filtering to the real catalog. `RecordingExecutor` keeps the
//! statements of committed transactions only, mirroring rollback.

use crate::db::{
    CatalogClient, ConstraintKind, ConstraintRow, ForeignKeyRow, IndexRow, ReferentialAction,
    SqlExecutor, TriggerRow, ViewRow,
};
use crate::error::{AppError, AppResult};
use crate::rename::health::{HealthCheckResult, HealthChecker, RestartCoordinator};
use crate::staging::{StagingBackend, TableDdl};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct ScriptedCatalog {
    tables: HashSet<String>,
    column_types: HashMap<(String, String), String>,
    primary_keys: HashMap<String, Vec<String>>,
    foreign_keys: HashMap<String, Vec<ForeignKeyRow>>,
    views: HashMap<String, Vec<ViewRow>>,
    triggers: HashMap<String, Vec<TriggerRow>>,
    indexes: HashMap<String, Vec<IndexRow>>,
    constraints: HashMap<String, Vec<ConstraintRow>>,
    unreachable: bool,
}

impl ScriptedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails as if the catalog were down.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.tables.insert(table.to_string());
        self
    }

    pub fn with_column(mut self, table: &str, column: &str, data_type: &str) -> Self {
        self.tables.insert(table.to_string());
        self.column_types
            .insert((table.to_string(), column.to_string()), data_type.to_string());
        self
    }

    pub fn with_primary_key(mut self, table: &str, columns: &[&str]) -> Self {
        self.primary_keys
            .insert(table.to_string(), columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Registers the FK under its target table.
    pub fn with_foreign_key(mut self, fk: ForeignKeyRow) -> Self {
        self.tables.insert(fk.source_table.clone());
        self.tables.insert(fk.target_table.clone());
        self.foreign_keys
            .entry(fk.target_table.clone())
            .or_default()
            .push(fk);
        self
    }

    pub fn with_view(mut self, table: &str, name: &str, definition: &str) -> Self {
        self.views.entry(table.to_string()).or_default().push(ViewRow {
            name: name.to_string(),
            definition: definition.to_string(),
        });
        self
    }

    pub fn with_trigger(mut self, table: &str, name: &str, definition: &str) -> Self {
        self.triggers.entry(table.to_string()).or_default().push(TriggerRow {
            name: name.to_string(),
            table: table.to_string(),
            definition: definition.to_string(),
        });
        self
    }

    pub fn with_index(mut self, table: &str, name: &str, columns: &[&str], unique: bool) -> Self {
        let cols: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let definition = format!(
            "CREATE {}INDEX {} ON {} ({})",
            if unique { "UNIQUE " } else { "" },
            name,
            table,
            cols.join(", ")
        );
        self.indexes.entry(table.to_string()).or_default().push(IndexRow {
            name: name.to_string(),
            table: table.to_string(),
            columns: cols,
            is_unique: unique,
            is_primary: false,
            definition,
        });
        self
    }

    pub fn with_constraint(mut self, table: &str, name: &str, kind: ConstraintKind, definition: &str) -> Self {
        self.constraints.entry(table.to_string()).or_default().push(ConstraintRow {
            name: name.to_string(),
            table: table.to_string(),
            kind,
            definition: definition.to_string(),
        });
        self
    }

    fn check(&self) -> AppResult<()> {
        if self.unreachable {
            Err(AppError::Connection("catalog unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

pub fn fk(
    name: &str,
    source: (&str, &str),
    target: (&str, &str),
    on_delete: ReferentialAction,
) -> ForeignKeyRow {
    ForeignKeyRow {
        constraint_name: name.to_string(),
        source_table: source.0.to_string(),
        source_column: source.1.to_string(),
        target_table: target.0.to_string(),
        target_column: target.1.to_string(),
        on_delete,
        on_update: ReferentialAction::NoAction,
    }
}

#[async_trait]
impl CatalogClient for ScriptedCatalog {
    async fn table_exists(&self, table: &str) -> AppResult<bool> {
        self.check()?;
        Ok(self.tables.contains(table))
    }

    async fn column_data_type(&self, table: &str, column: &str) -> AppResult<Option<String>> {
        self.check()?;
        Ok(self
            .column_types
            .get(&(table.to_string(), column.to_string()))
            .cloned())
    }

    async fn primary_key_columns(&self, table: &str) -> AppResult<Vec<String>> {
        self.check()?;
        Ok(self.primary_keys.get(table).cloned().unwrap_or_default())
    }

    async fn list_tables(&self) -> AppResult<Vec<String>> {
        self.check()?;
        let mut tables: Vec<String> = self.tables.iter().cloned().collect();
        tables.sort();
        Ok(tables)
    }

    async fn foreign_keys_referencing(&self, table: &str, _column: Option<&str>) -> AppResult<Vec<ForeignKeyRow>> {
        self.check()?;
        Ok(self.foreign_keys.get(table).cloned().unwrap_or_default())
    }

    async fn views_referencing(&self, table: &str, _column: Option<&str>) -> AppResult<Vec<ViewRow>> {
        self.check()?;
        Ok(self.views.get(table).cloned().unwrap_or_default())
    }

    async fn triggers_on(&self, table: &str, _column: Option<&str>) -> AppResult<Vec<TriggerRow>> {
        self.check()?;
        Ok(self.triggers.get(table).cloned().unwrap_or_default())
    }

    async fn indexes_on(&self, table: &str, _column: Option<&str>) -> AppResult<Vec<IndexRow>> {
        self.check()?;
        Ok(self.indexes.get(table).cloned().unwrap_or_default())
    }

    async fn constraints_on(&self, table: &str, _column: Option<&str>) -> AppResult<Vec<ConstraintRow>> {
        self.check()?;
        Ok(self.constraints.get(table).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct RecordingExecutor {
    committed: Mutex<Vec<String>>,
    transactions: Mutex<usize>,
    fail_on: Mutex<Option<String>>,
    hang_on: Option<String>,
    scalar: i64,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any statement containing `needle` fails.
    pub fn failing_on(needle: &str) -> Self {
        Self {
            fail_on: Mutex::new(Some(needle.to_string())),
            ..Self::default()
        }
    }

    /// Transactions containing `needle` commit, then never return.
    pub fn hanging_on(needle: &str) -> Self {
        Self {
            hang_on: Some(needle.to_string()),
            ..Self::default()
        }
    }

    pub fn with_scalar(mut self, value: i64) -> Self {
        self.scalar = value;
        self
    }

    pub fn stop_failing(&self) {
        *self.fail_on.lock().unwrap() = None;
    }

    pub fn committed(&self) -> Vec<String> {
        self.committed.lock().unwrap().clone()
    }

    pub fn transaction_count(&self) -> usize {
        *self.transactions.lock().unwrap()
    }

    pub fn committed_containing(&self, needle: &str) -> Vec<String> {
        self.committed()
            .into_iter()
            .filter(|s| s.contains(needle))
            .collect()
    }

    fn should_fail(&self, sql: &str) -> bool {
        self.fail_on
            .lock()
            .unwrap()
            .as_deref()
            .map(|needle| sql.contains(needle))
            .unwrap_or(false)
    }
}

#[async_trait]
impl SqlExecutor for RecordingExecutor {
    async fn execute(&self, sql: &str) -> AppResult<u64> {
        if self.should_fail(sql) {
            return Err(AppError::StatementFailed {
                index: 0,
                statement: sql.to_string(),
                message: "scripted failure".to_string(),
            });
        }
        self.committed.lock().unwrap().push(sql.to_string());
        Ok(1)
    }

    async fn execute_in_transaction(&self, statements: &[String]) -> AppResult<u64> {
        *self.transactions.lock().unwrap() += 1;
        if let Some((index, statement)) = statements.iter().enumerate().find(|(_, s)| self.should_fail(s)) {
            return Err(AppError::StatementFailed {
                index,
                statement: statement.clone(),
                message: "scripted failure".to_string(),
            });
        }
        self.committed.lock().unwrap().extend(statements.iter().cloned());
        if let Some(needle) = &self.hang_on {
            if statements.iter().any(|s| s.contains(needle.as_str())) {
                std::future::pending::<()>().await;
            }
        }
        Ok(statements.len() as u64)
    }

    async fn query_scalar(&self, _sql: &str) -> AppResult<i64> {
        Ok(self.scalar)
    }
}

/// Health checker that replays a script, then repeats its last answer.
pub struct ScriptedHealthChecker {
    script: Mutex<VecDeque<bool>>,
    fallback: bool,
    delay: Duration,
    calls: Mutex<usize>,
}

impl ScriptedHealthChecker {
    pub fn healthy() -> Self {
        Self::scripted(vec![], true)
    }

    pub fn scripted(script: Vec<bool>, fallback: bool) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: Duration::ZERO,
            calls: Mutex::new(0),
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::healthy()
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl HealthChecker for ScriptedHealthChecker {
    async fn check_application_health(&self) -> AppResult<HealthCheckResult> {
        *self.calls.lock().unwrap() += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let healthy = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
        Ok(HealthCheckResult {
            is_healthy: healthy,
            response_time: Duration::from_millis(1),
            error_message: (!healthy).then(|| "scripted outage".to_string()),
        })
    }
}

#[derive(Default)]
pub struct ScriptedRestarts {
    failing: HashSet<String>,
    restarted: Mutex<Vec<String>>,
}

impl ScriptedRestarts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(instances: &[&str]) -> Self {
        Self {
            failing: instances.iter().map(|s| s.to_string()).collect(),
            restarted: Mutex::new(Vec::new()),
        }
    }

    pub fn restarted(&self) -> Vec<String> {
        self.restarted.lock().unwrap().clone()
    }
}

#[async_trait]
impl RestartCoordinator for ScriptedRestarts {
    async fn coordinate_restart(&self, instance: &str) -> AppResult<bool> {
        if self.failing.contains(instance) {
            return Ok(false);
        }
        self.restarted.lock().unwrap().push(instance.to_string());
        Ok(true)
    }
}

/// Staging backend that keeps databases in memory. Every sampled table
/// yields ten rows.
#[derive(Default)]
pub struct ScriptedStaging {
    tables: Vec<TableDdl>,
    created: Mutex<Vec<String>>,
    dropped: Mutex<Vec<String>>,
    fail_on: Option<String>,
    fail_drops: bool,
    connect_delay: Duration,
}

impl ScriptedStaging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: &str, ddl: &str) -> Self {
        self.tables.push(TableDdl {
            table: table.to_string(),
            ddl: ddl.to_string(),
        });
        self
    }

    /// Statements containing `needle` fail inside staging databases.
    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.to_string());
        self
    }

    pub fn connecting_after(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn failing_drops(mut self) -> Self {
        self.fail_drops = true;
        self
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn dropped(&self) -> Vec<String> {
        self.dropped.lock().unwrap().clone()
    }
}

#[async_trait]
impl StagingBackend for ScriptedStaging {
    async fn create_database(&self, name: &str) -> AppResult<()> {
        self.created.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> AppResult<bool> {
        if self.fail_drops {
            return Err(AppError::Connection("admin connection lost".to_string()));
        }
        let existed = self.created().iter().any(|c| c == name) && !self.dropped().iter().any(|d| d == name);
        self.dropped.lock().unwrap().push(name.to_string());
        Ok(existed)
    }

    async fn replicate_schema(&self, _production_db: &str, _staging_db: &str) -> AppResult<Vec<TableDdl>> {
        Ok(self.tables.clone())
    }

    async fn copy_sample(&self, _production_db: &str, _staging_db: &str, _table: &str, _fraction: f64) -> AppResult<u64> {
        Ok(10)
    }

    async fn executor_for(&self, _database: &str) -> AppResult<Arc<dyn SqlExecutor>> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        Ok(Arc::new(match &self.fail_on {
            Some(needle) => RecordingExecutor::failing_on(needle),
            None => RecordingExecutor::new(),
        }))
    }
}
