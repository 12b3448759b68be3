//! Column Removal Manager
//!
//! Plans and executes a staged column drop:
//! backup → dependents → constraints → indexes → column → cleanup → validation.
//!
//! Each mutating stage runs in its own transaction. When a stage fails its
//! transaction is rolled back, earlier stages stay committed and are not
//! retried, and the result carries recovery instructions instead of an error.

pub mod backup;
pub mod plan;

use crate::analysis::dependency::DependencyAnalyzer;
use crate::config::EngineConfig;
use crate::context::OperationContext;
use crate::db::queries::{split_qualified, validate_identifier, SqlBuilder, DEFAULT_SCHEMA};
use crate::db::{CatalogClient, SqlExecutor};
use crate::error::{AppError, AppResult};
use crate::schema::{ObjectKind, RiskLevel, SchemaObject};
use backup::{handler_for, BackupHandler, BackupInfo};
use plan::{
    RemovalOptions, RemovalPlan, RemovalResult, RemovalRollbackResult, RemovalSafetyValidation, RemovalStage,
    RemovalStageResult,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

pub struct ColumnRemovalManager {
    analyzer: DependencyAnalyzer,
    catalog: Arc<dyn CatalogClient>,
    executor: Arc<dyn SqlExecutor>,
    config: EngineConfig,
}

impl ColumnRemovalManager {
    pub fn new(catalog: Arc<dyn CatalogClient>, executor: Arc<dyn SqlExecutor>, config: EngineConfig) -> Self {
        Self {
            analyzer: DependencyAnalyzer::new(catalog.clone()),
            catalog,
            executor,
            config,
        }
    }

    /// Analyze the column and lay out the stages needed to drop it.
    #[instrument(skip(self, ctx, options), fields(operation_id = %ctx.operation_id))]
    pub async fn plan_column_removal(
        &self,
        ctx: &OperationContext,
        table: &str,
        column: &str,
        options: RemovalOptions,
    ) -> AppResult<RemovalPlan> {
        validate_identifier(table)?;
        validate_identifier(column)?;

        let column_data_type = ctx
            .catalog("column_data_type", self.catalog.column_data_type(table, column))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Column {}.{} does not exist", table, column)))?;

        let dependencies = self.analyzer.analyze_column_dependencies(ctx, table, column).await?;
        let execution_stages = RemovalStage::plan_for(&dependencies);
        let estimated_duration = RemovalPlan::estimate_duration(&dependencies, &execution_stages);
        let confirmation_required = options.require_confirmation || dependencies.overall_risk() >= RiskLevel::High;

        info!(
            "📋 Removal plan for {}.{}: {} stages, ~{}s",
            table,
            column,
            execution_stages.len(),
            estimated_duration.as_secs()
        );

        Ok(RemovalPlan {
            table: table.to_string(),
            column: column.to_string(),
            column_data_type,
            dependencies,
            execution_stages,
            backup_strategy: options.backup_strategy.unwrap_or(self.config.default_backup_strategy),
            confirmation_required,
            dry_run: options.dry_run,
            enable_rollback: !options.disable_rollback,
            keep_backup: options.keep_backup,
            estimated_duration,
            created_at: chrono::Utc::now(),
        })
    }

    /// Pure check of a plan; critical dependencies block it.
    pub fn validate_removal_plan(plan: &RemovalPlan) -> RemovalSafetyValidation {
        let report = &plan.dependencies;
        let blocking: Vec<SchemaObject> = report.critical_dependencies().into_iter().cloned().collect();
        let risk_level = report.overall_risk();

        let mut warnings = Vec::new();
        let mut recommendations = Vec::new();

        for view in report.of_kind(ObjectKind::View) {
            warnings.push(format!("View {} will be dropped", view.name));
        }
        for trigger in report.of_kind(ObjectKind::Trigger) {
            warnings.push(format!("Trigger {} on {} will be dropped", trigger.name, trigger.table));
        }
        for fk in report.of_kind(ObjectKind::ForeignKey) {
            recommendations.push(format!(
                "Resolve foreign key {} on {} before dropping the column",
                fk.name, fk.table
            ));
        }
        if !report.of_kind(ObjectKind::Index).is_empty() {
            warnings.push(format!(
                "{} indexes will be dropped",
                report.of_kind(ObjectKind::Index).len()
            ));
        }
        if !plan.enable_rollback {
            warnings.push("Rollback is disabled for this plan".to_string());
        }
        if risk_level >= RiskLevel::High {
            recommendations.push("Dry-run the plan in a staging environment first".to_string());
        }
        if !plan.dry_run {
            recommendations.push(format!(
                "Verify the backup after creation ({} strategy)",
                plan.backup_strategy
            ));
        }

        let is_safe = blocking.is_empty();
        RemovalSafetyValidation {
            table: plan.table.clone(),
            column: plan.column.clone(),
            is_safe,
            risk_level,
            total_dependencies: report.total_count(),
            blocking_dependencies: blocking,
            warnings,
            recommendations,
            requires_confirmation: plan.confirmation_required || !is_safe,
        }
    }

    /// Run every stage in order, stopping at the first failure.
    ///
    /// Plans that require confirmation refuse to run unless `confirmed`.
    /// Stage failures are reported in the result, never raised.
    #[instrument(skip(self, ctx, plan), fields(operation_id = %ctx.operation_id, table = %plan.table, column = %plan.column))]
    pub async fn execute_removal_plan(
        &self,
        ctx: &OperationContext,
        plan: &RemovalPlan,
        confirmed: bool,
    ) -> AppResult<RemovalResult> {
        if plan.confirmation_required && !confirmed && !plan.dry_run {
            return Err(AppError::Validation(format!(
                "Removing {}.{} requires explicit confirmation",
                plan.table, plan.column
            )));
        }

        let started = Instant::now();
        let handler = handler_for(plan.backup_strategy, self.catalog.clone(), self.executor.clone());
        let mut backup: Option<BackupInfo> = None;
        let mut backup_retained = false;
        let mut stage_results = Vec::new();
        let mut failed_stage = None;

        info!(
            "🚀 Executing removal of {}.{} ({} stages{})",
            plan.table,
            plan.column,
            plan.execution_stages.len(),
            if plan.dry_run { ", dry run" } else { "" }
        );

        for &stage in &plan.execution_stages {
            let stage_started = Instant::now();
            let mut result = self
                .execute_stage(ctx, plan, stage, handler.as_ref(), &mut backup, &mut backup_retained)
                .await;
            result.duration = stage_started.elapsed();

            if result.success {
                info!("✅ Stage {} done in {:?}", stage, result.duration);
                stage_results.push(result);
            } else {
                error!("❌ Stage {} failed: {:?}", stage, result.errors);
                stage_results.push(result);
                failed_stage = Some(stage);
                break;
            }
        }

        let recovery_instructions = match failed_stage {
            Some(stage) => recovery_instructions(stage, &stage_results, backup.as_ref(), backup_retained),
            None => Vec::new(),
        };

        Ok(RemovalResult {
            table: plan.table.clone(),
            column: plan.column.clone(),
            success: failed_stage.is_none(),
            dry_run: plan.dry_run,
            stage_results,
            failed_stage,
            backup,
            backup_retained,
            recovery_instructions,
            total_duration: started.elapsed(),
        })
    }

    async fn execute_stage(
        &self,
        ctx: &OperationContext,
        plan: &RemovalPlan,
        stage: RemovalStage,
        handler: &dyn BackupHandler,
        backup: &mut Option<BackupInfo>,
        backup_retained: &mut bool,
    ) -> RemovalStageResult {
        let mut result = RemovalStageResult::new(stage);
        let report = &plan.dependencies;

        match stage {
            RemovalStage::BackupCreation => {
                if plan.dry_run {
                    result.warnings.push(format!("Dry run: {} backup not created", plan.backup_strategy));
                    return result;
                }
                match handler.create_backup(ctx, &plan.table, &plan.column).await {
                    Ok(info) => {
                        result.objects_affected.push(info.location.clone());
                        result.rollback_data = json!({ "backup": info });
                        *backup = Some(info);
                        *backup_retained = true;
                    }
                    Err(e) => result.fail(e.to_string()),
                }
            }
            RemovalStage::DependentObjects => {
                let mut forward = Vec::new();
                let mut undo = Vec::new();
                for view in report.of_kind(ObjectKind::View) {
                    forward.push(SqlBuilder::drop_view(&view.name));
                    undo.push(SqlBuilder::create_view(&view.name, &view.definition));
                    result.objects_affected.push(view.name.clone());
                }
                for trigger in report.of_kind(ObjectKind::Trigger) {
                    forward.push(SqlBuilder::drop_trigger(&trigger.name, &trigger.table));
                    undo.push(trigger.definition.clone());
                    result.objects_affected.push(trigger.name.clone());
                }
                self.run_statements(ctx, plan, &mut result, forward, undo).await;
            }
            RemovalStage::ConstraintRemoval => {
                let mut forward = Vec::new();
                let mut undo = Vec::new();
                for obj in report
                    .of_kind(ObjectKind::ForeignKey)
                    .iter()
                    .chain(report.of_kind(ObjectKind::Constraint))
                {
                    forward.push(SqlBuilder::drop_constraint(&obj.table, &obj.name));
                    undo.push(SqlBuilder::add_constraint(&obj.table, &obj.name, &obj.definition));
                    result.objects_affected.push(obj.name.clone());
                }
                self.run_statements(ctx, plan, &mut result, forward, undo).await;
            }
            RemovalStage::IndexRemoval => {
                let mut forward = Vec::new();
                let mut undo = Vec::new();
                for index in report.of_kind(ObjectKind::Index) {
                    forward.push(SqlBuilder::drop_index(&in_schema_of(&plan.table, &index.name)));
                    undo.push(index.definition.clone());
                    result.objects_affected.push(index.name.clone());
                }
                self.run_statements(ctx, plan, &mut result, forward, undo).await;
            }
            RemovalStage::ColumnRemoval => {
                let forward = vec![SqlBuilder::drop_column(&plan.table, &plan.column)];
                result.objects_affected.push(format!("{}.{}", plan.table, plan.column));
                self.run_statements(ctx, plan, &mut result, forward, Vec::new()).await;
                result.rollback_data = json!({
                    "column": plan.column,
                    "dataType": plan.column_data_type,
                });
            }
            RemovalStage::Cleanup => {
                let forward = vec![SqlBuilder::analyze(&plan.table)];
                self.run_statements(ctx, plan, &mut result, forward, Vec::new()).await;
                if result.success && !plan.dry_run && !plan.keep_backup {
                    if let Some(info) = backup.as_ref() {
                        let cleanup = handler.cleanup_backup(ctx, info).await;
                        if cleanup.success {
                            *backup_retained = false;
                            result.objects_affected.push(info.location.clone());
                        } else {
                            // A lingering backup is not a failed removal.
                            result.warnings.push(cleanup.message);
                        }
                    }
                }
            }
            RemovalStage::Validation => {
                if plan.dry_run {
                    result.warnings.push("Dry run: column presence not re-checked".to_string());
                    return result;
                }
                match ctx
                    .catalog("column_data_type", self.catalog.column_data_type(&plan.table, &plan.column))
                    .await
                {
                    Ok(None) => {}
                    Ok(Some(_)) => result.fail(format!("Column {}.{} still exists", plan.table, plan.column)),
                    Err(e) => result.fail(e.to_string()),
                }
            }
        }

        result
    }

    /// Execute `forward` in one transaction; record `undo` as rollback data.
    async fn run_statements(
        &self,
        ctx: &OperationContext,
        plan: &RemovalPlan,
        result: &mut RemovalStageResult,
        forward: Vec<String>,
        undo: Vec<String>,
    ) {
        if !undo.is_empty() {
            result.rollback_data = json!({ "recreate": undo });
        }
        if plan.dry_run {
            result
                .warnings
                .push(format!("Dry run: {} statements not executed", forward.len()));
            result.objects_affected.extend(forward.iter().map(|s| format!("would run: {}", s)));
            return;
        }
        if let Err(e) = ctx
            .ddl(result.stage.as_str(), self.executor.execute_in_transaction(&forward))
            .await
        {
            result.fail(e.to_string());
        }
    }

    /// Undo a (possibly partial) removal: re-add the column, restore values
    /// from the backup, then recreate dropped objects in reverse stage order.
    #[instrument(skip(self, ctx, plan, outcome), fields(operation_id = %ctx.operation_id))]
    pub async fn rollback_removal(
        &self,
        ctx: &OperationContext,
        plan: &RemovalPlan,
        outcome: &RemovalResult,
    ) -> AppResult<RemovalRollbackResult> {
        if !plan.enable_rollback {
            return Err(AppError::Validation("Rollback was disabled for this plan".to_string()));
        }
        if outcome.dry_run {
            return Err(AppError::Validation("Nothing to roll back after a dry run".to_string()));
        }

        let handler = handler_for(plan.backup_strategy, self.catalog.clone(), self.executor.clone());
        let mut statements = Vec::new();
        let mut warnings = Vec::new();

        let column_dropped = outcome
            .stage(RemovalStage::ColumnRemoval)
            .map(|r| r.success)
            .unwrap_or(false);
        if column_dropped {
            statements.push(SqlBuilder::add_column(&plan.table, &plan.column, &plan.column_data_type));
            match (&outcome.backup, outcome.backup_retained) {
                (Some(info), true) => statements.extend(handler.restore_statements(info)),
                _ => warnings.push(format!(
                    "No backup available; {}.{} is re-added empty",
                    plan.table, plan.column
                )),
            }
        }

        for stage_result in outcome.stage_results.iter().rev().filter(|r| r.success) {
            if let Some(recreate) = stage_result.rollback_data.get("recreate").and_then(|v| v.as_array()) {
                statements.extend(recreate.iter().filter_map(|s| s.as_str().map(str::to_string)));
            }
        }

        if statements.is_empty() {
            return Ok(RemovalRollbackResult {
                success: true,
                statements,
                warnings,
                error: None,
            });
        }

        info!("⏪ Rolling back removal of {}.{} ({} statements)", plan.table, plan.column, statements.len());

        match ctx
            .ddl("rollback_removal", self.executor.execute_in_transaction(&statements))
            .await
        {
            Ok(_) => Ok(RemovalRollbackResult {
                success: true,
                statements,
                warnings,
                error: None,
            }),
            Err(e) => {
                warn!("⚠️  Removal rollback failed: {}", e);
                Ok(RemovalRollbackResult {
                    success: false,
                    statements,
                    warnings,
                    error: Some(e.to_string()),
                })
            }
        }
    }
}

fn in_schema_of(table: &str, object: &str) -> String {
    match split_qualified(table) {
        (schema, _) if schema != DEFAULT_SCHEMA && !object.contains('.') => format!("{}.{}", schema, object),
        _ => object.to_string(),
    }
}

fn recovery_instructions(
    failed: RemovalStage,
    results: &[RemovalStageResult],
    backup: Option<&BackupInfo>,
    backup_retained: bool,
) -> Vec<String> {
    let committed: Vec<&str> = results
        .iter()
        .filter(|r| r.success)
        .map(|r| r.stage.as_str())
        .collect();

    let mut instructions = vec![format!(
        "The transaction for stage '{}' was rolled back; no partial changes from it remain.",
        failed
    )];

    if committed.is_empty() {
        instructions.push("No earlier stage was committed.".to_string());
    } else {
        instructions.push(format!(
            "Stages already committed and not retried: {}.",
            committed.join(", ")
        ));
    }

    match backup {
        Some(info) if backup_retained => instructions.push(format!(
            "Backup preserved at {} ({} rows). Verify with: {}",
            info.location, info.size, info.verification_query
        )),
        Some(info) => instructions.push(format!("Backup {} was already cleaned up.", info.location)),
        None => instructions.push("No backup was created.".to_string()),
    }

    if let Some(last) = results.last() {
        for err in &last.errors {
            instructions.push(format!("Error: {}", err));
        }
    }

    instructions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ReferentialAction;
    use crate::removal::backup::BackupStrategy;
    use crate::testing::{fk, RecordingExecutor, ScriptedCatalog};
    use pretty_assertions::assert_eq;
    use tokio_test::{assert_err, assert_ok};

    fn manager(catalog: ScriptedCatalog, executor: Arc<RecordingExecutor>) -> ColumnRemovalManager {
        ColumnRemovalManager::new(Arc::new(catalog), executor, EngineConfig::default())
    }

    fn indexed_email() -> ScriptedCatalog {
        ScriptedCatalog::new()
            .with_column("users", "email", "character varying(255)")
            .with_primary_key("users", &["id"])
            .with_index("users", "users_email_idx", &["email"], false)
    }

    #[tokio::test]
    async fn test_single_index_plan_is_safe() {
        let m = manager(indexed_email(), Arc::new(RecordingExecutor::new()));
        let ctx = OperationContext::default();

        let plan = assert_ok!(m.plan_column_removal(&ctx, "users", "email", RemovalOptions::default()).await);
        let validation = ColumnRemovalManager::validate_removal_plan(&plan);

        assert!(validation.is_safe);
        assert!(matches!(validation.risk_level, RiskLevel::Low | RiskLevel::Medium));
        assert!(validation.blocking_dependencies.is_empty());
        assert!(!plan.confirmation_required);
        assert_eq!(plan.column_data_type, "character varying(255)");
    }

    #[tokio::test]
    async fn test_missing_column_is_not_found() {
        let m = manager(ScriptedCatalog::new(), Arc::new(RecordingExecutor::new()));
        let ctx = OperationContext::default();

        let result = m.plan_column_removal(&ctx, "users", "ghost", RemovalOptions::default()).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_dry_run_executes_nothing() {
        let executor = Arc::new(RecordingExecutor::new());
        let m = manager(indexed_email(), executor.clone());
        let ctx = OperationContext::default();
        let options = RemovalOptions {
            dry_run: true,
            ..RemovalOptions::default()
        };

        let plan = assert_ok!(m.plan_column_removal(&ctx, "users", "email", options).await);
        let result = assert_ok!(m.execute_removal_plan(&ctx, &plan, false).await);

        assert!(result.success);
        assert!(result.dry_run);
        assert_eq!(executor.transaction_count(), 0);
        assert!(result.stage_results.iter().all(|r| r.errors.is_empty()));
    }

    #[tokio::test]
    async fn test_successful_removal_runs_stages_in_order() {
        let executor = Arc::new(RecordingExecutor::new().with_scalar(10));
        let catalog = indexed_email().with_view("users", "contact_list", "SELECT id, email FROM users");
        let m = manager(catalog, executor.clone());
        let ctx = OperationContext::default();

        let plan = assert_ok!(m.plan_column_removal(&ctx, "users", "email", RemovalOptions::default()).await);
        // The scripted catalog still reports the column, so validation fails last.
        let result = assert_ok!(m.execute_removal_plan(&ctx, &plan, true).await);

        let executed: Vec<RemovalStage> = result.stage_results.iter().map(|r| r.stage).collect();
        assert_eq!(executed, plan.execution_stages);
        assert_eq!(result.failed_stage, Some(RemovalStage::Validation));

        let committed = executor.committed();
        let position = |needle: &str| committed.iter().position(|s| s.contains(needle)).unwrap();
        assert!(position("CREATE TABLE") < position("DROP VIEW"));
        assert!(position("DROP VIEW") < position("DROP INDEX"));
        assert!(position("DROP INDEX") < position("DROP COLUMN"));
        assert!(position("DROP COLUMN") < position("DROP TABLE IF EXISTS"));
    }

    #[tokio::test]
    async fn test_failed_stage_stops_and_explains_recovery() {
        let executor = Arc::new(RecordingExecutor::failing_on("DROP COLUMN"));
        let m = manager(indexed_email(), executor.clone());
        let ctx = OperationContext::default();

        let plan = assert_ok!(m.plan_column_removal(&ctx, "users", "email", RemovalOptions::default()).await);
        let result = assert_ok!(m.execute_removal_plan(&ctx, &plan, true).await);

        assert!(!result.success);
        assert_eq!(result.failed_stage, Some(RemovalStage::ColumnRemoval));
        assert!(result.stage(RemovalStage::Cleanup).is_none());
        assert!(result.backup_retained);
        assert!(result.recovery_instructions[0].contains("rolled back"));
        assert!(result.recovery_instructions.iter().any(|i| i.starts_with("Backup preserved at users__email_backup_")));
        assert!(result.recovery_instructions.iter().any(|i| i.starts_with("Error:")));
        assert!(executor.committed_containing("DROP COLUMN").is_empty());
    }

    #[tokio::test]
    async fn test_critical_plan_requires_confirmation() {
        let catalog = ScriptedCatalog::new()
            .with_column("users", "id", "integer")
            .with_foreign_key(fk("orders_user_fk", ("orders", "user_id"), ("users", "id"), ReferentialAction::Cascade));
        let m = manager(catalog, Arc::new(RecordingExecutor::new()));
        let ctx = OperationContext::default();

        let plan = assert_ok!(m.plan_column_removal(&ctx, "users", "id", RemovalOptions::default()).await);
        let validation = ColumnRemovalManager::validate_removal_plan(&plan);

        assert!(!validation.is_safe);
        assert_eq!(validation.blocking_dependencies.len(), 1);
        assert!(plan.confirmation_required);
        assert!(matches!(
            assert_err!(m.execute_removal_plan(&ctx, &plan, false).await),
            AppError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_rollback_restores_column_and_dependents() {
        let executor = Arc::new(RecordingExecutor::failing_on("ANALYZE"));
        let m = manager(indexed_email(), executor.clone());
        let ctx = OperationContext::default();
        let options = RemovalOptions {
            backup_strategy: Some(BackupStrategy::TableSnapshot),
            ..RemovalOptions::default()
        };

        let plan = assert_ok!(m.plan_column_removal(&ctx, "users", "email", options).await);
        let outcome = assert_ok!(m.execute_removal_plan(&ctx, &plan, true).await);
        assert_eq!(outcome.failed_stage, Some(RemovalStage::Cleanup));

        let rollback = assert_ok!(m.rollback_removal(&ctx, &plan, &outcome).await);

        assert!(rollback.success);
        assert_eq!(
            rollback.statements[0],
            "ALTER TABLE \"users\" ADD COLUMN \"email\" character varying(255)"
        );
        assert!(rollback.statements[1].starts_with("UPDATE \"users\" AS t SET \"email\""));
        assert_eq!(rollback.statements[2], "CREATE INDEX users_email_idx ON users (email)");
    }
}
