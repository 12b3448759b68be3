//! Rename Coordination Engine
//!
//! Turns a [`TableRenameReport`] into an ordered workflow and applies it as
//! one transaction: dependents that name the table are dropped, the table is
//! renamed, then foreign keys, views, triggers and indexes are recreated
//! against the new name. Either every step commits or none does.

use crate::analysis::table_rename::{RenameDependency, TableRenameReport};
use crate::context::OperationContext;
use crate::db::queries::{split_qualified, validate_identifier, SqlBuilder};
use crate::db::{ForeignKeyRow, SqlExecutor};
use crate::error::{AppError, AppResult};
use crate::schema::ObjectKind;
use regex::{Captures, Regex};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationAction {
    DropDependent,
    RenameTable,
    RecreateForeignKey,
    RecreateDependent,
    RenameIndex,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationStep {
    pub order: usize,
    pub action: CoordinationAction,
    pub description: String,
    pub statements: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationResult {
    pub success: bool,
    pub workflow_id: Uuid,
    pub old_name: String,
    pub new_name: String,
    pub completed_steps: Vec<String>,
    pub failed_step: Option<String>,
    /// The coordinating transaction was rolled back; the schema is untouched
    pub transaction_rolled_back: bool,
    pub error: Option<String>,
    pub statements: Vec<String>,
}

/// Dependent rewiring for a table swap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependentMove {
    /// Before the swap: drop dependents bound to the old table
    pub detach: Vec<String>,
    /// After the swap: recreate them against the new name
    pub attach: Vec<String>,
    /// Drops what `attach` created
    pub undo_attach: Vec<String>,
    /// Recreates the original dependents once the old name is back
    pub restore: Vec<String>,
}

impl DependentMove {
    pub fn is_empty(&self) -> bool {
        self.detach.is_empty()
    }
}

#[derive(Clone)]
pub struct RenameCoordinationEngine {
    executor: Arc<dyn SqlExecutor>,
}

impl RenameCoordinationEngine {
    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self { executor }
    }

    /// Ordered steps that move every dependent from `old_name` to `new_name`.
    pub fn build_workflow(report: &TableRenameReport) -> AppResult<Vec<CoordinationStep>> {
        validate_identifier(&report.old_name)?;
        validate_identifier(&report.new_name)?;
        let rewriter = NameRewriter::new(&report.old_name, &report.new_name)?;

        let mut steps = Vec::new();

        for dep in rewritable(report) {
            steps.push(step(
                CoordinationAction::DropDependent,
                format!("Drop {} {}", dep.object.kind, dep.object.name),
                vec![drop_dependent(dep, &report.old_name)],
            ));
        }

        steps.push(step(
            CoordinationAction::RenameTable,
            format!("Rename table {} to {}", report.old_name, report.new_name),
            vec![SqlBuilder::rename_table(&report.old_name, &report.new_name)],
        ));

        for fk in foreign_keys(report) {
            let moved = retarget(fk, &report.old_name, &report.new_name);
            steps.push(step(
                CoordinationAction::RecreateForeignKey,
                format!("Recreate foreign key {} on {}", fk.constraint_name, moved.source_table),
                vec![
                    SqlBuilder::drop_constraint(&moved.source_table, &moved.constraint_name),
                    SqlBuilder::add_constraint(&moved.source_table, &moved.constraint_name, &moved.definition()),
                ],
            ));
        }

        for dep in rewritable(report) {
            steps.push(step(
                CoordinationAction::RecreateDependent,
                format!("Recreate {} {} against {}", dep.object.kind, dep.object.name, report.new_name),
                vec![create_dependent(dep, &rewriter.rewrite(&dep.object.definition))],
            ));
        }

        for (index, renamed) in renamed_indexes(report)? {
            steps.push(step(
                CoordinationAction::RenameIndex,
                format!("Rename index {} to {}", index, renamed),
                vec![SqlBuilder::rename_index(&index, &renamed)],
            ));
        }

        Ok(number(steps))
    }

    /// Inverse workflow that restores the original name and the original
    /// definitions captured in `report`.
    pub fn build_rollback_workflow(report: &TableRenameReport) -> AppResult<Vec<CoordinationStep>> {
        validate_identifier(&report.old_name)?;
        validate_identifier(&report.new_name)?;

        let mut steps = Vec::new();

        for (index, renamed) in renamed_indexes(report)? {
            steps.push(step(
                CoordinationAction::RenameIndex,
                format!("Rename index {} back to {}", renamed, index),
                vec![SqlBuilder::rename_index(&renamed, &index)],
            ));
        }

        for dep in rewritable(report) {
            let recreated = match dep.object.kind {
                ObjectKind::Trigger => SqlBuilder::drop_trigger(&dep.object.name, &report.new_name),
                _ => SqlBuilder::drop_view(&dep.object.name),
            };
            steps.push(step(
                CoordinationAction::DropDependent,
                format!("Drop recreated {} {}", dep.object.kind, dep.object.name),
                vec![recreated],
            ));
        }

        steps.push(step(
            CoordinationAction::RenameTable,
            format!("Rename table {} back to {}", report.new_name, report.old_name),
            vec![SqlBuilder::rename_table(&report.new_name, &report.old_name)],
        ));

        for fk in foreign_keys(report) {
            steps.push(step(
                CoordinationAction::RecreateForeignKey,
                format!("Restore foreign key {} on {}", fk.constraint_name, fk.source_table),
                vec![
                    SqlBuilder::drop_constraint(&fk.source_table, &fk.constraint_name),
                    SqlBuilder::add_constraint(&fk.source_table, &fk.constraint_name, &fk.definition()),
                ],
            ));
        }

        for dep in rewritable(report) {
            steps.push(step(
                CoordinationAction::RecreateDependent,
                format!("Restore {} {}", dep.object.kind, dep.object.name),
                vec![create_dependent(dep, &dep.object.definition)],
            ));
        }

        Ok(number(steps))
    }

    /// Flattened forward statements in execution order.
    pub fn workflow_statements(report: &TableRenameReport) -> AppResult<Vec<String>> {
        Ok(Self::build_workflow(report)?
            .into_iter()
            .flat_map(|s| s.statements)
            .collect())
    }

    /// Forward statements that only touch tables, keys and indexes. Staging
    /// databases carry no views or triggers, so those steps are left out.
    pub fn table_level_statements(report: &TableRenameReport) -> AppResult<Vec<String>> {
        Ok(Self::build_workflow(report)?
            .into_iter()
            .filter(|s| {
                !matches!(
                    s.action,
                    CoordinationAction::DropDependent | CoordinationAction::RecreateDependent
                )
            })
            .flat_map(|s| s.statements)
            .collect())
    }

    /// Statements that move every dependent from `report.old_name` onto a
    /// replacement table that takes over `report.new_name`, as in a
    /// blue-green swap where the original table is kept under another name.
    pub fn dependent_move(report: &TableRenameReport) -> AppResult<DependentMove> {
        validate_identifier(&report.old_name)?;
        validate_identifier(&report.new_name)?;
        let rewriter = NameRewriter::new(&report.old_name, &report.new_name)?;

        let mut moves = DependentMove::default();

        for fk in foreign_keys(report) {
            let moved = retarget(fk, &report.old_name, &report.new_name);
            moves
                .detach
                .push(SqlBuilder::drop_constraint(&fk.source_table, &fk.constraint_name));
            moves.attach.push(SqlBuilder::add_constraint(
                &moved.source_table,
                &moved.constraint_name,
                &moved.definition(),
            ));
            moves
                .undo_attach
                .push(SqlBuilder::drop_constraint(&moved.source_table, &moved.constraint_name));
            moves.restore.extend([
                SqlBuilder::drop_constraint(&fk.source_table, &fk.constraint_name),
                SqlBuilder::add_constraint(&fk.source_table, &fk.constraint_name, &fk.definition()),
            ]);
        }

        for dep in rewritable(report) {
            moves.detach.push(drop_dependent(dep, &report.old_name));
            moves
                .attach
                .push(create_dependent(dep, &rewriter.rewrite(&dep.object.definition)));
            moves.undo_attach.push(drop_dependent(dep, &report.new_name));
            moves.restore.extend([
                drop_dependent(dep, &report.old_name),
                create_dependent(dep, &dep.object.definition),
            ]);
        }

        Ok(moves)
    }

    /// Apply the rename workflow in a single transaction.
    ///
    /// A failing statement is reported through the result; only input,
    /// connection and cancellation errors are returned as `Err`.
    #[instrument(skip(self, ctx, report), fields(operation_id = %ctx.operation_id, old = %report.old_name, new = %report.new_name))]
    pub async fn execute_coordination(
        &self,
        ctx: &OperationContext,
        report: &TableRenameReport,
    ) -> AppResult<CoordinationResult> {
        if !report.table_exists {
            return Err(AppError::NotFound(format!("Table '{}' does not exist", report.old_name)));
        }

        let steps = Self::build_workflow(report)?;
        info!(
            "🔗 Coordinating rename {} -> {} ({} steps)",
            report.old_name,
            report.new_name,
            steps.len()
        );
        self.run_workflow(ctx, report, steps).await
    }

    /// Undo a successful coordination. A failed one was never committed, so
    /// there is nothing to undo and an empty successful result is returned.
    #[instrument(skip(self, ctx, report, applied), fields(operation_id = %ctx.operation_id))]
    pub async fn rollback_coordination(
        &self,
        ctx: &OperationContext,
        report: &TableRenameReport,
        applied: &CoordinationResult,
    ) -> AppResult<CoordinationResult> {
        if !applied.success {
            return Ok(CoordinationResult {
                success: true,
                workflow_id: ctx.operation_id,
                old_name: report.new_name.clone(),
                new_name: report.old_name.clone(),
                completed_steps: Vec::new(),
                failed_step: None,
                transaction_rolled_back: false,
                error: None,
                statements: Vec::new(),
            });
        }

        let steps = Self::build_rollback_workflow(report)?;
        info!("⏪ Reverting rename {} -> {}", report.old_name, report.new_name);
        let mut result = self.run_workflow(ctx, report, steps).await?;
        result.old_name = report.new_name.clone();
        result.new_name = report.old_name.clone();
        Ok(result)
    }

    async fn run_workflow(
        &self,
        ctx: &OperationContext,
        report: &TableRenameReport,
        steps: Vec<CoordinationStep>,
    ) -> AppResult<CoordinationResult> {
        let statements: Vec<String> = steps.iter().flat_map(|s| s.statements.iter().cloned()).collect();

        let mut result = CoordinationResult {
            success: false,
            workflow_id: ctx.operation_id,
            old_name: report.old_name.clone(),
            new_name: report.new_name.clone(),
            completed_steps: Vec::new(),
            failed_step: None,
            transaction_rolled_back: false,
            error: None,
            statements: statements.clone(),
        };

        match ctx
            .ddl("coordinate_rename", self.executor.execute_in_transaction(&statements))
            .await
        {
            Ok(_) => {
                result.success = true;
                result.completed_steps = steps.into_iter().map(|s| s.description).collect();
                info!("✅ Workflow {} committed", result.workflow_id);
            }
            Err(AppError::StatementFailed { index, statement, message }) => {
                let failed = step_for_statement(&steps, index);
                error!("❌ Coordination step failed ({}): {}", statement, message);
                warn!("⏪ Transaction rolled back, {} left unchanged", report.old_name);
                result.failed_step = failed.map(|s| s.description.clone());
                result.transaction_rolled_back = true;
                result.error = Some(format!("{}: {}", statement, message));
            }
            Err(e) => return Err(e),
        }

        Ok(result)
    }
}

/// Word-boundary replacement of the bare table name inside SQL text
struct NameRewriter {
    pattern: Regex,
    replacement: String,
}

impl NameRewriter {
    fn new(old_name: &str, new_name: &str) -> AppResult<Self> {
        let (_, bare_old) = split_qualified(old_name);
        let (_, bare_new) = split_qualified(new_name);
        let pattern = Regex::new(&format!(r"\b{}\b", regex::escape(bare_old)))
            .map_err(|e| AppError::Internal(format!("Failed to build rewrite pattern: {}", e)))?;
        Ok(Self {
            pattern,
            replacement: bare_new.to_string(),
        })
    }

    fn rewrite(&self, sql: &str) -> String {
        self.pattern
            .replace_all(sql, regex::NoExpand(&self.replacement))
            .into_owned()
    }
}

fn step(action: CoordinationAction, description: String, statements: Vec<String>) -> CoordinationStep {
    CoordinationStep {
        order: 0,
        action,
        description,
        statements,
    }
}

fn number(mut steps: Vec<CoordinationStep>) -> Vec<CoordinationStep> {
    for (i, s) in steps.iter_mut().enumerate() {
        s.order = i + 1;
    }
    steps
}

fn rewritable(report: &TableRenameReport) -> impl Iterator<Item = &RenameDependency> {
    report
        .schema_objects
        .iter()
        .filter(|d| matches!(d.object.kind, ObjectKind::View | ObjectKind::Trigger))
}

fn foreign_keys(report: &TableRenameReport) -> impl Iterator<Item = &ForeignKeyRow> {
    report.schema_objects.iter().filter_map(|d| d.foreign_key.as_ref())
}

fn drop_dependent(dep: &RenameDependency, table: &str) -> String {
    match dep.object.kind {
        ObjectKind::Trigger => SqlBuilder::drop_trigger(&dep.object.name, table),
        _ => SqlBuilder::drop_view(&dep.object.name),
    }
}

fn create_dependent(dep: &RenameDependency, definition: &str) -> String {
    match dep.object.kind {
        ObjectKind::Trigger => definition.trim().trim_end_matches(';').to_string(),
        _ => SqlBuilder::create_view(&dep.object.name, definition),
    }
}

/// Indexes whose name embeds the table name as a whole `_`-separated
/// segment follow the table.
fn renamed_indexes(report: &TableRenameReport) -> AppResult<Vec<(String, String)>> {
    let (_, bare_old) = split_qualified(&report.old_name);
    let (_, bare_new) = split_qualified(&report.new_name);
    let segment = Regex::new(&format!(r"(^|_){}(_|$)", regex::escape(bare_old)))
        .map_err(|e| AppError::Internal(format!("Failed to build index pattern: {}", e)))?;

    Ok(report
        .of_kind(ObjectKind::Index)
        .filter(|d| segment.is_match(&d.object.name))
        .map(|d| {
            let renamed = segment.replacen(&d.object.name, 1, |caps: &Captures| {
                format!("{}{}{}", &caps[1], bare_new, &caps[2])
            });
            (d.object.name.clone(), renamed.into_owned())
        })
        .collect())
}

fn retarget(fk: &ForeignKeyRow, old_name: &str, new_name: &str) -> ForeignKeyRow {
    let mut moved = fk.clone();
    if same_table(&moved.source_table, old_name) {
        moved.source_table = new_name.to_string();
    }
    if same_table(&moved.target_table, old_name) {
        moved.target_table = new_name.to_string();
    }
    moved
}

fn same_table(a: &str, b: &str) -> bool {
    split_qualified(a) == split_qualified(b)
}

fn step_for_statement(steps: &[CoordinationStep], index: usize) -> Option<&CoordinationStep> {
    let mut seen = 0;
    steps.iter().find(|s| {
        seen += s.statements.len();
        index < seen
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::table_rename::TableRenameAnalyzer;
    use crate::db::ReferentialAction;
    use crate::testing::{fk, RecordingExecutor, ScriptedCatalog};
    use pretty_assertions::assert_eq;
    use tokio_test::assert_ok;

    async fn users_report() -> TableRenameReport {
        let catalog = ScriptedCatalog::new()
            .with_table("users")
            .with_foreign_key(fk("orders_user_fk", ("orders", "user_id"), ("users", "id"), ReferentialAction::Restrict))
            .with_view("users", "user_summary", "SELECT id, email FROM users")
            .with_index("users", "users_email_idx", &["email"], true);
        let analyzer = TableRenameAnalyzer::new(Arc::new(catalog));
        analyzer
            .analyze_table_rename(&OperationContext::default(), "users", "accounts")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_workflow_order() {
        let report = users_report().await;
        let steps = assert_ok!(RenameCoordinationEngine::build_workflow(&report));

        let actions: Vec<CoordinationAction> = steps.iter().map(|s| s.action).collect();
        assert_eq!(
            actions,
            vec![
                CoordinationAction::DropDependent,
                CoordinationAction::RenameTable,
                CoordinationAction::RecreateForeignKey,
                CoordinationAction::RecreateDependent,
                CoordinationAction::RenameIndex,
            ]
        );
        assert_eq!(steps[3].statements[0], "CREATE VIEW \"user_summary\" AS SELECT id, email FROM accounts");
        assert_eq!(
            steps[2].statements[1],
            "ALTER TABLE \"orders\" ADD CONSTRAINT \"orders_user_fk\" FOREIGN KEY (\"user_id\") REFERENCES \"accounts\"(\"id\") ON DELETE RESTRICT ON UPDATE NO ACTION"
        );
        assert_eq!(
            steps[4].statements[0],
            "ALTER INDEX IF EXISTS \"users_email_idx\" RENAME TO \"accounts_email_idx\""
        );
    }

    #[tokio::test]
    async fn test_successful_coordination_uses_one_transaction() {
        let report = users_report().await;
        let executor = Arc::new(RecordingExecutor::new());
        let engine = RenameCoordinationEngine::new(executor.clone());
        let ctx = OperationContext::default();

        let result = assert_ok!(engine.execute_coordination(&ctx, &report).await);

        assert!(result.success);
        assert_eq!(result.workflow_id, ctx.operation_id);
        assert_eq!(result.completed_steps.len(), 5);
        assert_eq!(executor.transaction_count(), 1);
        assert_eq!(executor.committed_containing("RENAME TO \"accounts\"").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_step_leaves_nothing_committed() {
        let report = users_report().await;
        let executor = Arc::new(RecordingExecutor::failing_on("CREATE VIEW"));
        let engine = RenameCoordinationEngine::new(executor.clone());

        let result = assert_ok!(engine.execute_coordination(&OperationContext::default(), &report).await);

        assert!(!result.success);
        assert!(result.transaction_rolled_back);
        assert!(result.completed_steps.is_empty());
        assert_eq!(result.failed_step.as_deref(), Some("Recreate view user_summary against accounts"));
        assert!(result.error.is_some());
        assert!(executor.committed().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_restores_original_definitions() {
        let report = users_report().await;
        let executor = Arc::new(RecordingExecutor::new());
        let engine = RenameCoordinationEngine::new(executor.clone());
        let ctx = OperationContext::default();

        let applied = engine.execute_coordination(&ctx, &report).await.unwrap();
        let reverted = assert_ok!(engine.rollback_coordination(&ctx, &report, &applied).await);

        assert!(reverted.success);
        assert_eq!(reverted.new_name, "users");
        assert_eq!(
            executor.committed_containing("CREATE VIEW").last().map(String::as_str),
            Some("CREATE VIEW \"user_summary\" AS SELECT id, email FROM users")
        );
        assert_eq!(executor.committed_containing("RENAME TO \"users\"").len(), 1);
    }

    #[tokio::test]
    async fn test_missing_table_is_rejected() {
        let engine = RenameCoordinationEngine::new(Arc::new(RecordingExecutor::new()));
        let report = TableRenameAnalyzer::new(Arc::new(ScriptedCatalog::new()))
            .analyze_table_rename(&OperationContext::default(), "ghost", "spirit")
            .await
            .unwrap();

        let result = engine.execute_coordination(&OperationContext::default(), &report).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_table_level_statements_skip_views() {
        let report = users_report().await;
        let all = RenameCoordinationEngine::workflow_statements(&report).unwrap();
        let table_level = RenameCoordinationEngine::table_level_statements(&report).unwrap();

        assert_eq!(all.len(), 6);
        assert_eq!(table_level.len(), 4);
        assert!(table_level.iter().all(|s| !s.contains("VIEW")));
    }

    #[test]
    fn test_rewrite_respects_word_boundaries() {
        let rewriter = NameRewriter::new("users", "accounts").unwrap();
        assert_eq!(
            rewriter.rewrite("SELECT u.id FROM users u JOIN users_audit a ON a.id = u.id"),
            "SELECT u.id FROM accounts u JOIN users_audit a ON a.id = u.id"
        );
    }

    #[tokio::test]
    async fn test_index_renames_match_whole_name_segments() {
        let catalog = ScriptedCatalog::new()
            .with_table("users")
            .with_index("users", "users_email_idx", &["email"], true)
            .with_index("users", "idx_users", &["id"], false)
            .with_index("users", "superusers_flag_idx", &["flag"], false)
            .with_index("users", "users2_created_idx", &["created_at"], false);
        let report = TableRenameAnalyzer::new(Arc::new(catalog))
            .analyze_table_rename(&OperationContext::default(), "users", "accounts")
            .await
            .unwrap();

        let mut renamed = renamed_indexes(&report).unwrap();
        renamed.sort();

        assert_eq!(
            renamed,
            vec![
                ("idx_users".to_string(), "idx_accounts".to_string()),
                ("users_email_idx".to_string(), "accounts_email_idx".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_dependent_move_retargets_and_restores() {
        let report = users_report().await;
        let moves = assert_ok!(RenameCoordinationEngine::dependent_move(&report));

        assert_eq!(
            moves.detach,
            vec![
                "ALTER TABLE \"orders\" DROP CONSTRAINT IF EXISTS \"orders_user_fk\"".to_string(),
                "DROP VIEW IF EXISTS \"user_summary\"".to_string(),
            ]
        );
        assert!(moves.attach[0].contains("REFERENCES \"accounts\"(\"id\")"));
        assert_eq!(moves.attach[1], "CREATE VIEW \"user_summary\" AS SELECT id, email FROM accounts");
        assert_eq!(moves.undo_attach.len(), 2);
        assert!(moves.restore.iter().any(|s| s.contains("REFERENCES \"users\"(\"id\")")));
        assert_eq!(
            moves.restore.last().map(String::as_str),
            Some("CREATE VIEW \"user_summary\" AS SELECT id, email FROM users")
        );
    }
}
