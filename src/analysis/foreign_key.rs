//! Foreign Key Analyzer
//!
//! Walks foreign-key chains outward from a table ("who references me, and
//! who references them?"), validates referential integrity for destructive
//! operations and builds FK-safe migration plans.
//!
//! The walk runs over an arena graph: table names are interned into a
//! `Vec<String>` and edges refer to tables by index. A detected cycle is a
//! normal result (`FKChain::contains_cycles`); only a failing catalog call
//! aborts discovery.

use crate::context::OperationContext;
use crate::db::queries::{find_injection_pattern, validate_identifier, SqlBuilder, DEFAULT_SCHEMA};
use crate::db::{CatalogClient, ForeignKeyRow, ReferentialAction};
use crate::error::{AppError, AppResult};
use crate::schema::RiskLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

// =============================================================================
// OPERATIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FkOperationKind {
    DropTable,
    DropColumn,
    RenameTable,
    RenameColumn,
    TruncateTable,
    AlterColumnType,
}

impl FkOperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FkOperationKind::DropTable => "drop_table",
            FkOperationKind::DropColumn => "drop_column",
            FkOperationKind::RenameTable => "rename_table",
            FkOperationKind::RenameColumn => "rename_column",
            FkOperationKind::TruncateTable => "truncate_table",
            FkOperationKind::AlterColumnType => "alter_column_type",
        }
    }

    pub fn is_column_level(&self) -> bool {
        matches!(
            self,
            FkOperationKind::DropColumn | FkOperationKind::RenameColumn | FkOperationKind::AlterColumnType
        )
    }

    pub fn is_rename(&self) -> bool {
        matches!(self, FkOperationKind::RenameTable | FkOperationKind::RenameColumn)
    }

    /// Operations that make referenced values disappear
    pub fn removes_referenced_rows(&self) -> bool {
        matches!(
            self,
            FkOperationKind::DropTable | FkOperationKind::TruncateTable | FkOperationKind::DropColumn
        )
    }
}

impl fmt::Display for FkOperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FkOperationKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop_table" => Ok(FkOperationKind::DropTable),
            "drop_column" => Ok(FkOperationKind::DropColumn),
            "rename_table" => Ok(FkOperationKind::RenameTable),
            "rename_column" => Ok(FkOperationKind::RenameColumn),
            "truncate_table" => Ok(FkOperationKind::TruncateTable),
            "alter_column_type" => Ok(FkOperationKind::AlterColumnType),
            other => Err(AppError::Validation(format!("Unsupported foreign key operation: '{}'", other))),
        }
    }
}

/// A schema change whose foreign-key fallout should be analyzed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FkOperation {
    pub kind: FkOperationKind,
    pub table: String,
    pub column: Option<String>,
    pub new_name: Option<String>,
    /// Target type for `alter_column_type`
    pub new_type: Option<String>,
}

impl FkOperation {
    pub fn new(kind: FkOperationKind, table: impl Into<String>) -> Self {
        Self {
            kind,
            table: table.into(),
            column: None,
            new_name: None,
            new_type: None,
        }
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn with_new_name(mut self, new_name: impl Into<String>) -> Self {
        self.new_name = Some(new_name.into());
        self
    }

    pub fn with_new_type(mut self, new_type: impl Into<String>) -> Self {
        self.new_type = Some(new_type.into());
        self
    }

    /// Check that the operation carries everything its kind needs.
    pub fn validate(&self) -> AppResult<()> {
        if self.table.trim().is_empty() {
            return Err(AppError::Validation("Table name must not be empty".to_string()));
        }
        validate_identifier(&self.table)?;

        if self.kind.is_column_level() {
            let column = self.column.as_deref().ok_or_else(|| {
                AppError::Validation(format!("Operation {} requires a column", self.kind))
            })?;
            validate_identifier(column)?;
        }

        if self.kind.is_rename() {
            let new_name = self.new_name.as_deref().ok_or_else(|| {
                AppError::Validation(format!("Operation {} requires a new name", self.kind))
            })?;
            validate_identifier(new_name)?;
        }

        if self.kind == FkOperationKind::AlterColumnType {
            let new_type = self.new_type.as_deref().unwrap_or("").trim();
            if new_type.is_empty() {
                return Err(AppError::Validation("alter_column_type requires a target type".to_string()));
            }
            if let Some((pattern, what)) = find_injection_pattern(new_type) {
                return Err(AppError::QueryParsing(format!(
                    "Column type contains a {} ('{}')",
                    what,
                    pattern.escape_debug()
                )));
            }
        }

        Ok(())
    }
}

// =============================================================================
// CHAINS
// =============================================================================

/// One hop in a foreign-key chain: `table.column` references `target_table.target_column`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FKChainNode {
    pub table: String,
    pub column: String,
    pub constraint_name: String,
    pub target_table: String,
    pub target_column: String,
    pub on_delete: ReferentialAction,
}

impl From<&ForeignKeyRow> for FKChainNode {
    fn from(fk: &ForeignKeyRow) -> Self {
        Self {
            table: fk.source_table.clone(),
            column: fk.source_column.clone(),
            constraint_name: fk.constraint_name.clone(),
            target_table: fk.target_table.clone(),
            target_column: fk.target_column.clone(),
            on_delete: fk.on_delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FKChain {
    pub root_table: String,
    pub nodes: Vec<FKChainNode>,
}

impl FKChain {
    pub fn chain_length(&self) -> usize {
        self.nodes.len()
    }

    /// Tables in walk order: the first node's target, then each node's table.
    pub fn tables(&self) -> Vec<&str> {
        let mut tables = Vec::with_capacity(self.nodes.len() + 1);
        if let Some(first) = self.nodes.first() {
            tables.push(first.target_table.as_str());
        }
        tables.extend(self.nodes.iter().map(|n| n.table.as_str()));
        tables
    }

    /// True iff some table shows up twice while walking the chain.
    pub fn contains_cycles(&self) -> bool {
        let mut seen = HashSet::new();
        self.tables().into_iter().any(|t| !seen.insert(normalize_table(t)))
    }

    pub fn has_cascade(&self) -> bool {
        self.nodes.iter().any(|n| n.on_delete == ReferentialAction::Cascade)
    }
}

struct FkEdge {
    source: usize,
    row: ForeignKeyRow,
}

/// Arena graph of tables and the foreign keys pointing at them
#[derive(Default)]
struct FkGraph {
    tables: Vec<String>,
    index: HashMap<String, usize>,
    edges: Vec<FkEdge>,
    /// Edge ids whose target is the table at that position
    inbound: Vec<Vec<usize>>,
}

impl FkGraph {
    fn intern(&mut self, table: &str) -> usize {
        let key = normalize_table(table).to_string();
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let id = self.tables.len();
        self.tables.push(table.to_string());
        self.inbound.push(Vec::new());
        self.index.insert(key, id);
        id
    }

    fn add_edge(&mut self, target: usize, row: ForeignKeyRow) -> usize {
        let source = self.intern(&row.source_table);
        self.edges.push(FkEdge { source, row });
        let edge_id = self.edges.len() - 1;
        self.inbound[target].push(edge_id);
        source
    }
}

// =============================================================================
// REPORTS
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FKImpactReport {
    pub table: String,
    pub operation: FkOperationKind,
    pub affected_foreign_keys: Vec<ForeignKeyRow>,
    pub chains: Vec<FKChain>,
    pub cascade_constraints: Vec<String>,
    pub has_cycles: bool,
    pub risk_level: RiskLevel,
    pub warnings: Vec<String>,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityValidation {
    pub is_safe: bool,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
    pub checked_constraints: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FkStepAction {
    DropConstraint,
    ApplyOperation,
    RecreateConstraint,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FkMigrationStep {
    pub order: usize,
    pub action: FkStepAction,
    pub description: String,
    pub sql: String,
    /// `None` when the step cannot be undone by DDL alone (dropped data)
    pub rollback_sql: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FkMigrationPlan {
    pub operation: FkOperation,
    pub steps: Vec<FkMigrationStep>,
    pub affected_constraints: Vec<String>,
    pub warnings: Vec<String>,
}

impl FkMigrationPlan {
    pub fn forward_sql(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.sql.clone()).collect()
    }

    /// Undo statements in reverse step order
    pub fn rollback_sql(&self) -> Vec<String> {
        self.steps
            .iter()
            .rev()
            .filter_map(|s| s.rollback_sql.clone())
            .collect()
    }
}

// =============================================================================
// ANALYZER
// =============================================================================

#[derive(Clone)]
pub struct ForeignKeyAnalyzer {
    catalog: Arc<dyn CatalogClient>,
    max_depth: usize,
}

impl ForeignKeyAnalyzer {
    pub fn new(catalog: Arc<dyn CatalogClient>, max_depth: usize) -> Self {
        Self {
            catalog,
            max_depth: max_depth.max(1),
        }
    }

    /// Fallout of `operation` (e.g. `"drop_table"`) on everything referencing `table`.
    #[instrument(skip(self, ctx), fields(operation_id = %ctx.operation_id))]
    pub async fn analyze_foreign_key_impact(
        &self,
        ctx: &OperationContext,
        table: &str,
        operation: &str,
    ) -> AppResult<FKImpactReport> {
        if table.trim().is_empty() {
            return Err(AppError::Validation("Table name must not be empty".to_string()));
        }
        let kind: FkOperationKind = operation.parse()?;
        validate_identifier(table)?;

        info!("🔗 Analyzing foreign key impact of {} on {}", kind, table);

        let affected = ctx
            .catalog("foreign_keys_referencing", self.catalog.foreign_keys_referencing(table, None))
            .await?;
        let chains = self.find_all_foreign_key_chains(ctx, table).await?;

        let cascade_constraints: Vec<String> = affected
            .iter()
            .filter(|fk| fk.is_cascading())
            .map(|fk| fk.constraint_name.clone())
            .collect();
        let has_cycles = chains.iter().any(FKChain::contains_cycles);

        let mut warnings = Vec::new();
        for fk in &affected {
            if fk.on_delete == ReferentialAction::Cascade && kind.removes_referenced_rows() {
                warnings.push(format!(
                    "{} cascades deletes into {}",
                    fk.constraint_name, fk.source_table
                ));
            }
        }
        if has_cycles {
            warnings.push(format!("Circular foreign key chain reachable from {}", table));
        }
        if chains.iter().any(|c| c.chain_length() > 1 && c.has_cascade()) {
            warnings.push("Cascading deletes propagate through more than one table".to_string());
        }

        let risk_level = if !cascade_constraints.is_empty() || has_cycles {
            RiskLevel::Critical
        } else if affected.is_empty() {
            RiskLevel::Safe
        } else if kind.removes_referenced_rows() && affected.iter().any(|fk| fk.on_delete.blocks_delete()) {
            RiskLevel::High
        } else {
            RiskLevel::Medium
        };

        info!(
            "🔗 {} foreign keys, {} chains, risk {}",
            affected.len(),
            chains.len(),
            risk_level
        );

        Ok(FKImpactReport {
            table: table.to_string(),
            operation: kind,
            affected_foreign_keys: affected,
            chains,
            cascade_constraints,
            has_cycles,
            risk_level,
            warnings,
            analyzed_at: Utc::now(),
        })
    }

    /// Breadth-first walk from `table` through referencing tables, bounded by
    /// the configured depth. Every maximal path becomes one chain.
    ///
    /// A failing catalog call is reported as `AppError::CircularDependency`.
    pub async fn find_all_foreign_key_chains(
        &self,
        ctx: &OperationContext,
        table: &str,
    ) -> AppResult<Vec<FKChain>> {
        validate_identifier(table)?;

        let mut graph = FkGraph::default();
        let root = graph.intern(table);

        // Discovery: load the reachable part of the graph.
        let mut expanded = HashSet::new();
        let mut queue = VecDeque::from([(root, 0usize)]);
        while let Some((node, depth)) = queue.pop_front() {
            if depth >= self.max_depth || !expanded.insert(node) {
                continue;
            }
            let name = graph.tables[node].clone();
            let rows = ctx
                .catalog("foreign_keys_referencing", self.catalog.foreign_keys_referencing(&name, None))
                .await
                .map_err(|e| {
                    AppError::CircularDependency(format!("Foreign key discovery failed at {}: {}", name, e))
                })?;
            debug!("{} foreign keys reference {}", rows.len(), name);

            for row in rows {
                let source = graph.add_edge(node, row);
                queue.push_back((source, depth + 1));
            }
        }

        // Enumeration: every path that cannot be extended further.
        let mut chains = Vec::new();
        let mut stack: Vec<(usize, Vec<usize>)> = vec![(root, Vec::new())];
        while let Some((node, path)) = stack.pop() {
            let next = &graph.inbound[node];
            if next.is_empty() || path.len() >= self.max_depth {
                if !path.is_empty() {
                    chains.push(path);
                }
                continue;
            }
            for &edge_id in next {
                let source = graph.edges[edge_id].source;
                let revisits = source == root || path.iter().any(|&e| graph.edges[e].source == source);
                let mut extended = path.clone();
                extended.push(edge_id);
                if revisits {
                    chains.push(extended);
                } else {
                    stack.push((source, extended));
                }
            }
        }

        let mut chains: Vec<FKChain> = chains
            .into_iter()
            .map(|path| FKChain {
                root_table: table.to_string(),
                nodes: path.iter().map(|&e| FKChainNode::from(&graph.edges[e].row)).collect(),
            })
            .collect();
        chains.sort_by(|a, b| a.tables().cmp(&b.tables()));

        Ok(chains)
    }

    /// Unsafe when a RESTRICT / NO ACTION key would block the operation.
    #[instrument(skip(self, ctx), fields(operation_id = %ctx.operation_id))]
    pub async fn validate_referential_integrity(
        &self,
        ctx: &OperationContext,
        operation: &FkOperation,
    ) -> AppResult<IntegrityValidation> {
        operation.validate()?;
        let fks = self.affected_foreign_keys(ctx, operation).await?;

        let mut violations = Vec::new();
        let mut warnings = Vec::new();

        for fk in &fks {
            let inbound = references_target(fk, operation);

            if !inbound {
                warnings.push(format!(
                    "{} on {}.{} is removed or rewritten together with the column",
                    fk.constraint_name, fk.source_table, fk.source_column
                ));
                continue;
            }

            match operation.kind {
                kind if kind.removes_referenced_rows() => match fk.on_delete {
                    action if action.blocks_delete() => violations.push(format!(
                        "{} ({}.{} -> {}.{}) uses ON DELETE {} and would block {}",
                        fk.constraint_name,
                        fk.source_table,
                        fk.source_column,
                        fk.target_table,
                        fk.target_column,
                        action,
                        kind
                    )),
                    ReferentialAction::Cascade => warnings.push(format!(
                        "{} will delete referencing rows in {}",
                        fk.constraint_name, fk.source_table
                    )),
                    ReferentialAction::SetNull => warnings.push(format!(
                        "{} will set {}.{} to NULL",
                        fk.constraint_name, fk.source_table, fk.source_column
                    )),
                    _ => warnings.push(format!(
                        "{} will reset {}.{} to its default",
                        fk.constraint_name, fk.source_table, fk.source_column
                    )),
                },
                FkOperationKind::AlterColumnType => warnings.push(format!(
                    "{}.{} must keep a type compatible with the new type of {}",
                    fk.source_table,
                    fk.source_column,
                    operation.column.as_deref().unwrap_or_default()
                )),
                _ => warnings.push(format!(
                    "{} must be recreated against the renamed object",
                    fk.constraint_name
                )),
            }
        }

        if !violations.is_empty() {
            warn!("⚠️  {} referential integrity violations for {}", violations.len(), operation.kind);
        }

        Ok(IntegrityValidation {
            is_safe: violations.is_empty(),
            violations,
            warnings,
            checked_constraints: fks.len(),
        })
    }

    /// Drop affected constraints, apply the operation, recreate constraints.
    ///
    /// Refuses with `AppError::CascadeRisk` whenever any affected key
    /// cascades on delete or update.
    #[instrument(skip(self, ctx), fields(operation_id = %ctx.operation_id))]
    pub async fn generate_fk_safe_migration_plan(
        &self,
        ctx: &OperationContext,
        operation: &FkOperation,
    ) -> AppResult<FkMigrationPlan> {
        operation.validate()?;
        let fks = self.affected_foreign_keys(ctx, operation).await?;

        let cascading: Vec<String> = fks
            .iter()
            .filter(|fk| fk.is_cascading())
            .map(|fk| fk.constraint_name.clone())
            .collect();
        if !cascading.is_empty() {
            warn!("⛔ Refusing to plan {}: cascading keys {:?}", operation.kind, cascading);
            return Err(AppError::CascadeRisk { constraints: cascading });
        }

        let mut steps = Vec::new();
        let mut warnings = Vec::new();

        for fk in &fks {
            steps.push(FkMigrationStep {
                order: steps.len() + 1,
                action: FkStepAction::DropConstraint,
                description: format!("Drop {} on {}", fk.constraint_name, fk.source_table),
                sql: SqlBuilder::drop_constraint(&fk.source_table, &fk.constraint_name),
                rollback_sql: Some(SqlBuilder::add_constraint(
                    &fk.source_table,
                    &fk.constraint_name,
                    &fk.definition(),
                )),
            });
        }

        let (sql, rollback_sql) = self.operation_sql(ctx, operation).await?;
        if rollback_sql.is_none() {
            warnings.push(format!("{} cannot be undone without a backup", operation.kind));
        }
        steps.push(FkMigrationStep {
            order: steps.len() + 1,
            action: FkStepAction::ApplyOperation,
            description: format!("Apply {} on {}", operation.kind, operation.table),
            sql,
            rollback_sql,
        });

        if operation.kind.is_rename() {
            for fk in &fks {
                let recreated = retarget(fk, operation);
                steps.push(FkMigrationStep {
                    order: steps.len() + 1,
                    action: FkStepAction::RecreateConstraint,
                    description: format!("Recreate {} against {}", fk.constraint_name, recreated.target_table),
                    sql: SqlBuilder::add_constraint(
                        &recreated.source_table,
                        &recreated.constraint_name,
                        &recreated.definition(),
                    ),
                    rollback_sql: Some(SqlBuilder::drop_constraint(
                        &recreated.source_table,
                        &recreated.constraint_name,
                    )),
                });
            }
        } else if !fks.is_empty() {
            warnings.push(format!(
                "{} foreign keys are dropped and not recreated",
                fks.len()
            ));
        }

        info!("📋 FK-safe plan for {} on {}: {} steps", operation.kind, operation.table, steps.len());

        Ok(FkMigrationPlan {
            operation: operation.clone(),
            steps,
            affected_constraints: fks.iter().map(|fk| fk.constraint_name.clone()).collect(),
            warnings,
        })
    }

    async fn affected_foreign_keys(
        &self,
        ctx: &OperationContext,
        operation: &FkOperation,
    ) -> AppResult<Vec<ForeignKeyRow>> {
        let column = if operation.kind.is_column_level() {
            operation.column.as_deref()
        } else {
            None
        };
        ctx.catalog(
            "foreign_keys_referencing",
            self.catalog.foreign_keys_referencing(&operation.table, column),
        )
        .await
    }

    /// Forward DDL for the operation plus its inverse, when one exists.
    async fn operation_sql(
        &self,
        ctx: &OperationContext,
        operation: &FkOperation,
    ) -> AppResult<(String, Option<String>)> {
        let table = operation.table.as_str();
        let column = operation.column.as_deref().unwrap_or_default();
        let new_name = operation.new_name.as_deref().unwrap_or_default();

        Ok(match operation.kind {
            FkOperationKind::DropTable => (SqlBuilder::drop_table(table), None),
            FkOperationKind::TruncateTable => (SqlBuilder::truncate_table(table), None),
            FkOperationKind::DropColumn => (SqlBuilder::drop_column(table, column), None),
            FkOperationKind::RenameTable => {
                let (schema, _) = crate::db::queries::split_qualified(table);
                let renamed = if schema == DEFAULT_SCHEMA {
                    new_name.to_string()
                } else {
                    format!("{}.{}", schema, new_name)
                };
                (
                    SqlBuilder::rename_table(table, new_name),
                    Some(SqlBuilder::rename_table(&renamed, table)),
                )
            }
            FkOperationKind::RenameColumn => (
                SqlBuilder::rename_column(table, column, new_name),
                Some(SqlBuilder::rename_column(table, new_name, column)),
            ),
            FkOperationKind::AlterColumnType => {
                let new_type = operation.new_type.as_deref().unwrap_or_default();
                let old_type = ctx
                    .catalog("column_data_type", self.catalog.column_data_type(table, column))
                    .await?;
                (
                    SqlBuilder::alter_column_type(table, column, new_type),
                    old_type.map(|t| SqlBuilder::alter_column_type(table, column, &t)),
                )
            }
        })
    }
}

/// Strip the default schema so `public.users` and `users` compare equal.
fn normalize_table(name: &str) -> &str {
    name.strip_prefix("public.").unwrap_or(name)
}

fn same_table(a: &str, b: &str) -> bool {
    normalize_table(a) == normalize_table(b)
}

/// Does `fk` point at the object the operation changes?
fn references_target(fk: &ForeignKeyRow, operation: &FkOperation) -> bool {
    if !same_table(&fk.target_table, &operation.table) {
        return false;
    }
    match (&operation.column, operation.kind.is_column_level()) {
        (Some(column), true) => &fk.target_column == column,
        _ => true,
    }
}

/// The key as it must look after a rename.
fn retarget(fk: &ForeignKeyRow, operation: &FkOperation) -> ForeignKeyRow {
    let mut recreated = fk.clone();
    let new_name = operation.new_name.clone().unwrap_or_default();

    match operation.kind {
        FkOperationKind::RenameTable => {
            if same_table(&fk.target_table, &operation.table) {
                recreated.target_table = new_name.clone();
            }
            if same_table(&fk.source_table, &operation.table) {
                recreated.source_table = new_name;
            }
        }
        FkOperationKind::RenameColumn => {
            let column = operation.column.as_deref().unwrap_or_default();
            if same_table(&fk.target_table, &operation.table) && fk.target_column == column {
                recreated.target_column = new_name.clone();
            }
            if same_table(&fk.source_table, &operation.table) && fk.source_column == column {
                recreated.source_column = new_name;
            }
        }
        _ => {}
    }
    recreated
}
