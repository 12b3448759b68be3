//! Complete Rename Orchestrator
//!
//! Runs a table rename end to end:
//!
//! 1. Analysis: validate names and discover dependents (read only)
//! 2. Staging dry run (optional): replay the table-level workflow in a
//!    throwaway copy of production
//! 3. Coordination: rename and recreate dependents in one transaction
//! 4. Deployment: move applications over with the strategy chosen from the
//!    analysis risk, under health monitoring
//!
//! When a phase fails, completed phases are undone in reverse order.

use crate::analysis::table_rename::{TableRenameAnalyzer, TableRenameReport};
use crate::config::EngineConfig;
use crate::context::OperationContext;
use crate::db::{CatalogClient, SqlExecutor};
use crate::rename::coordination::{CoordinationResult, RenameCoordinationEngine};
use crate::rename::health::{HealthChecker, RestartCoordinator};
use crate::rename::strategy::{
    ApplicationSafeRenameStrategy, RenameState, StrategyExecutionResult, ZeroDowntimeStrategy,
};
use crate::staging::{StagingCleanupResult, StagingDryRunResult, StagingEnvironmentManager};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationPhase {
    Analysis,
    StagingDryRun,
    Coordination,
    Deployment,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationOptions {
    /// Production database to copy into staging; no staging run when absent
    pub staging_database: Option<String>,
    /// Defaults to the engine's configured sample size
    pub data_sample_size: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingRunSummary {
    pub staging_id: Option<Uuid>,
    pub tables_replicated: usize,
    pub rows_sampled: u64,
    pub dry_run: Option<StagingDryRunResult>,
    pub cleanup: Option<StagingCleanupResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationResult {
    pub workflow_id: Uuid,
    pub old_name: String,
    pub new_name: String,
    pub success: bool,
    pub phases_completed: Vec<OrchestrationPhase>,
    pub failed_phase: Option<OrchestrationPhase>,
    pub rollback_executed: bool,
    pub rollback_errors: Vec<String>,
    pub strategy: Option<ZeroDowntimeStrategy>,
    pub analysis: Option<TableRenameReport>,
    pub staging: Option<StagingRunSummary>,
    pub coordination: Option<CoordinationResult>,
    pub deployment: Option<StrategyExecutionResult>,
    pub error_message: Option<String>,
    pub duration: Duration,
}

pub struct CompleteRenameOrchestrator {
    analyzer: TableRenameAnalyzer,
    coordination: RenameCoordinationEngine,
    strategy: ApplicationSafeRenameStrategy,
    staging: Option<Arc<StagingEnvironmentManager>>,
    config: EngineConfig,
}

impl CompleteRenameOrchestrator {
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        executor: Arc<dyn SqlExecutor>,
        health: Arc<dyn HealthChecker>,
        restarts: Arc<dyn RestartCoordinator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            analyzer: TableRenameAnalyzer::new(catalog.clone()),
            coordination: RenameCoordinationEngine::new(executor.clone()),
            strategy: ApplicationSafeRenameStrategy::new(catalog, executor, health, restarts, config.clone()),
            staging: None,
            config,
        }
    }

    pub fn with_staging(mut self, staging: Arc<StagingEnvironmentManager>) -> Self {
        self.staging = Some(staging);
        self
    }

    pub fn with_instances(mut self, instances: Vec<String>) -> Self {
        self.strategy = self.strategy.with_instances(instances);
        self
    }

    /// Run every phase. Never returns an error: failures are reported through
    /// `failed_phase` and `error_message`.
    #[instrument(skip(self, ctx, options), fields(operation_id = %ctx.operation_id))]
    pub async fn execute_complete_rename(
        &self,
        ctx: &OperationContext,
        old_name: &str,
        new_name: &str,
        options: OrchestrationOptions,
    ) -> OrchestrationResult {
        let started = Instant::now();
        let mut result = OrchestrationResult {
            workflow_id: ctx.operation_id,
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
            success: false,
            phases_completed: Vec::new(),
            failed_phase: None,
            rollback_executed: false,
            rollback_errors: Vec::new(),
            strategy: None,
            analysis: None,
            staging: None,
            coordination: None,
            deployment: None,
            error_message: None,
            duration: Duration::ZERO,
        };

        info!("🚀 Complete rename {} -> {} ({})", old_name, new_name, ctx.operation_id);

        // ===== PHASE 1: ANALYSIS =====
        let validation = TableRenameAnalyzer::validate_rename_operation(old_name, new_name);
        if !validation.is_valid {
            return finish(result, OrchestrationPhase::Analysis, validation.errors.join("; "), started);
        }
        let report = match self.analyzer.analyze_table_rename(ctx, old_name, new_name).await {
            Ok(report) if !report.table_exists => {
                let message = format!("Table '{}' does not exist", old_name);
                result.analysis = Some(report);
                return finish(result, OrchestrationPhase::Analysis, message, started);
            }
            Ok(report) => report,
            Err(e) => return finish(result, OrchestrationPhase::Analysis, e.to_string(), started),
        };
        let strategy = ApplicationSafeRenameStrategy::select_strategy(old_name, new_name, &report);
        info!(
            "🧠 Analysis: {} dependents, risk {}, strategy {}",
            report.total_count(),
            report.overall_risk,
            strategy
        );
        result.strategy = Some(strategy);
        result.analysis = Some(report.clone());
        result.phases_completed.push(OrchestrationPhase::Analysis);

        // ===== PHASE 2: STAGING DRY RUN =====
        if let Some(production_db) = options.staging_database.as_deref() {
            let sample_size = options.data_sample_size.unwrap_or(self.config.default_sample_size);
            let (summary, failure) = self.staging_dry_run(ctx, production_db, sample_size, &report).await;
            result.staging = Some(summary);
            if let Some(message) = failure {
                return finish(result, OrchestrationPhase::StagingDryRun, message, started);
            }
            result.phases_completed.push(OrchestrationPhase::StagingDryRun);
        }

        // ===== PHASE 3: COORDINATION =====
        let coordination = match self.coordination.execute_coordination(ctx, &report).await {
            Ok(c) => c,
            Err(e) => return finish(result, OrchestrationPhase::Coordination, e.to_string(), started),
        };
        let coordinated = coordination.success;
        let coordination_error = coordination.error.clone();
        result.coordination = Some(coordination);
        if !coordinated {
            // The coordinating transaction rolled itself back; earlier phases
            // did not mutate production.
            let message = coordination_error.unwrap_or_else(|| "Coordination failed".to_string());
            return finish(result, OrchestrationPhase::Coordination, message, started);
        }
        result.phases_completed.push(OrchestrationPhase::Coordination);

        // ===== PHASE 4: DEPLOYMENT =====
        let deployment = self
            .strategy
            .execute_with_health_monitoring(ctx, strategy, old_name, new_name, RenameState::AlreadyRenamed)
            .await;
        let deployed = deployment.success;
        let deployment_error = deployment.error_message.clone();
        if !deployment.rollback_errors.is_empty() {
            result.rollback_errors.extend(deployment.rollback_errors.iter().cloned());
        }
        result.deployment = Some(deployment);

        if !deployed {
            error!("❌ Deployment failed, reverting completed phases");
            self.rollback_completed(ctx, &report, &mut result).await;
            let message = deployment_error.unwrap_or_else(|| "Deployment failed".to_string());
            return finish(result, OrchestrationPhase::Deployment, message, started);
        }
        result.phases_completed.push(OrchestrationPhase::Deployment);

        result.success = true;
        result.duration = started.elapsed();
        info!("✅ Rename {} -> {} complete in {:?}", old_name, new_name, result.duration);
        result
    }

    /// Undo completed mutating phases, newest first. Analysis and staging
    /// never touch production, so only coordination needs reverting.
    async fn rollback_completed(
        &self,
        ctx: &OperationContext,
        report: &TableRenameReport,
        result: &mut OrchestrationResult,
    ) {
        let rollback_ctx = ctx.detached();
        for phase in result.phases_completed.clone().into_iter().rev() {
            if phase != OrchestrationPhase::Coordination {
                continue;
            }
            let Some(applied) = result.coordination.as_ref() else {
                continue;
            };
            result.rollback_executed = true;
            match self
                .coordination
                .rollback_coordination(&rollback_ctx, report, applied)
                .await
            {
                Ok(reverted) if reverted.success => {
                    info!("⏪ Coordination reverted");
                }
                Ok(reverted) => {
                    warn!("⚠️  Coordination rollback failed");
                    result
                        .rollback_errors
                        .push(reverted.error.unwrap_or_else(|| "Coordination rollback failed".to_string()));
                }
                Err(e) => {
                    warn!("⚠️  Coordination rollback errored: {}", e);
                    result.rollback_errors.push(e.to_string());
                }
            }
        }
    }

    /// Create, seed and dry-run a staging copy, always cleaning it up.
    /// Returns the summary and, on failure, the reason.
    async fn staging_dry_run(
        &self,
        ctx: &OperationContext,
        production_db: &str,
        sample_size: f64,
        report: &TableRenameReport,
    ) -> (StagingRunSummary, Option<String>) {
        let mut summary = StagingRunSummary {
            staging_id: None,
            tables_replicated: 0,
            rows_sampled: 0,
            dry_run: None,
            cleanup: None,
        };

        let Some(staging) = self.staging.as_ref() else {
            return (summary, Some("No staging backend is configured".to_string()));
        };

        let env = match staging.create_staging_environment(ctx, production_db, sample_size).await {
            Ok(env) => env,
            Err(e) => return (summary, Some(format!("Staging environment unavailable: {}", e))),
        };
        summary.staging_id = Some(env.staging_id);

        let failure = async {
            let replication = staging
                .replicate_production_schema(ctx, env.staging_id)
                .await
                .map_err(|e| format!("Schema replication failed: {}", e))?;
            summary.tables_replicated = replication.tables_replicated;

            let sampling = staging
                .sample_production_data(ctx, env.staging_id)
                .await
                .map_err(|e| format!("Data sampling failed: {}", e))?;
            summary.rows_sampled = sampling.rows_copied;

            let statements = RenameCoordinationEngine::table_level_statements(report).map_err(|e| e.to_string())?;
            let dry_run = staging
                .dry_run_statements(ctx, env.staging_id, &statements)
                .await
                .map_err(|e| format!("Dry run errored: {}", e))?;
            let passed = dry_run.success;
            let reason = dry_run.error.clone();
            summary.dry_run = Some(dry_run);
            if passed {
                Ok(())
            } else {
                Err(format!(
                    "Dry run failed in staging: {}",
                    reason.unwrap_or_else(|| "unknown error".to_string())
                ))
            }
        }
        .await
        .err();

        match staging.cleanup_staging_environment(ctx, env.staging_id).await {
            Ok(cleanup) => {
                if !cleanup.resources_freed {
                    warn!("⚠️  Staging environment {} was not freed", env.staging_id);
                }
                summary.cleanup = Some(cleanup);
            }
            Err(e) => warn!("⚠️  Staging cleanup errored: {}", e),
        }

        (summary, failure)
    }
}

fn finish(
    mut result: OrchestrationResult,
    phase: OrchestrationPhase,
    message: String,
    started: Instant,
) -> OrchestrationResult {
    error!("❌ {:?} phase failed: {}", phase, message);
    result.failed_phase = Some(phase);
    result.error_message = Some(message);
    result.duration = started.elapsed();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ReferentialAction;
    use crate::testing::{fk, RecordingExecutor, ScriptedCatalog, ScriptedHealthChecker, ScriptedRestarts, ScriptedStaging};
    use pretty_assertions::assert_eq;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            health_check_interval: Duration::from_millis(1),
            health_check_timeout: Duration::from_millis(500),
            health_check_samples: 1,
            ..EngineConfig::default()
        }
    }

    fn catalog() -> ScriptedCatalog {
        ScriptedCatalog::new()
            .with_table("users")
            .with_foreign_key(fk("orders_user_fk", ("orders", "user_id"), ("users", "id"), ReferentialAction::Restrict))
            .with_view("users", "user_summary", "SELECT id, email FROM users")
    }

    fn orchestrator(executor: Arc<RecordingExecutor>, health: ScriptedHealthChecker) -> CompleteRenameOrchestrator {
        CompleteRenameOrchestrator::new(
            Arc::new(catalog()),
            executor,
            Arc::new(health),
            Arc::new(ScriptedRestarts::new()),
            fast_config(),
        )
    }

    #[tokio::test]
    async fn test_complete_rename_succeeds() {
        let executor = Arc::new(RecordingExecutor::new());
        let orchestrator = orchestrator(executor.clone(), ScriptedHealthChecker::healthy());
        let ctx = OperationContext::default();

        let result = orchestrator
            .execute_complete_rename(&ctx, "users", "accounts", OrchestrationOptions::default())
            .await;

        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.workflow_id, ctx.operation_id);
        assert_eq!(
            result.phases_completed,
            vec![
                OrchestrationPhase::Analysis,
                OrchestrationPhase::Coordination,
                OrchestrationPhase::Deployment,
            ]
        );
        // The view makes the rename high risk, which selects blue-green
        assert_eq!(result.strategy, Some(ZeroDowntimeStrategy::BlueGreen));
        assert!(!result.rollback_executed);
    }

    #[tokio::test]
    async fn test_invalid_names_fail_analysis_without_io() {
        let executor = Arc::new(RecordingExecutor::new());
        let orchestrator = orchestrator(executor.clone(), ScriptedHealthChecker::healthy());

        let result = orchestrator
            .execute_complete_rename(&OperationContext::default(), "users", "", OrchestrationOptions::default())
            .await;

        assert_eq!(result.failed_phase, Some(OrchestrationPhase::Analysis));
        assert!(result.phases_completed.is_empty());
        assert!(executor.committed().is_empty());
    }

    #[tokio::test]
    async fn test_coordination_failure_needs_no_rollback() {
        let executor = Arc::new(RecordingExecutor::failing_on("CREATE VIEW \"user_summary\""));
        let orchestrator = orchestrator(executor.clone(), ScriptedHealthChecker::healthy());

        let result = orchestrator
            .execute_complete_rename(&OperationContext::default(), "users", "accounts", OrchestrationOptions::default())
            .await;

        assert!(!result.success);
        assert_eq!(result.failed_phase, Some(OrchestrationPhase::Coordination));
        assert!(!result.rollback_executed);
        assert!(executor.committed().is_empty());
    }

    #[tokio::test]
    async fn test_unhealthy_deployment_reverts_coordination() {
        let executor = Arc::new(RecordingExecutor::new());
        let orchestrator = orchestrator(executor.clone(), ScriptedHealthChecker::scripted(vec![true, false], false));

        let result = orchestrator
            .execute_complete_rename(&OperationContext::default(), "users", "accounts", OrchestrationOptions::default())
            .await;

        assert!(!result.success);
        assert_eq!(result.failed_phase, Some(OrchestrationPhase::Deployment));
        assert!(result.rollback_executed);
        assert!(result.rollback_errors.is_empty());
        assert_eq!(
            executor.committed_containing("ALTER TABLE \"accounts\" RENAME TO \"users\""),
            vec!["ALTER TABLE \"accounts\" RENAME TO \"users\"".to_string()]
        );
        assert_eq!(
            executor.committed_containing("CREATE VIEW \"user_summary\"").last().map(String::as_str),
            Some("CREATE VIEW \"user_summary\" AS SELECT id, email FROM users")
        );
    }

    #[tokio::test]
    async fn test_staging_failure_stops_before_production() {
        let executor = Arc::new(RecordingExecutor::new());
        let staging_backend = Arc::new(ScriptedStaging::new().failing_on("RENAME TO"));
        let staging = Arc::new(StagingEnvironmentManager::new(staging_backend.clone(), fast_config()));
        let orchestrator = orchestrator(executor.clone(), ScriptedHealthChecker::healthy()).with_staging(staging.clone());

        let result = orchestrator
            .execute_complete_rename(
                &OperationContext::default(),
                "users",
                "accounts",
                OrchestrationOptions {
                    staging_database: Some("shop".to_string()),
                    data_sample_size: Some(0.05),
                },
            )
            .await;

        assert_eq!(result.failed_phase, Some(OrchestrationPhase::StagingDryRun));
        assert!(executor.committed().is_empty());
        assert_eq!(staging_backend.dropped().len(), 1);
        assert!(staging.list_environments().await.is_empty());
        let summary = result.staging.unwrap();
        assert!(!summary.dry_run.unwrap().success);
        assert!(summary.cleanup.unwrap().resources_freed);
    }

    #[tokio::test]
    async fn test_staging_success_precedes_coordination() {
        let executor = Arc::new(RecordingExecutor::new());
        let staging = Arc::new(StagingEnvironmentManager::new(Arc::new(ScriptedStaging::new()), fast_config()));
        let orchestrator = orchestrator(executor, ScriptedHealthChecker::healthy()).with_staging(staging);

        let result = orchestrator
            .execute_complete_rename(
                &OperationContext::default(),
                "users",
                "accounts",
                OrchestrationOptions {
                    staging_database: Some("shop".to_string()),
                    data_sample_size: None,
                },
            )
            .await;

        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.phases_completed[1], OrchestrationPhase::StagingDryRun);
    }

    #[tokio::test]
    async fn test_missing_table_fails_analysis() {
        let orchestrator = orchestrator(Arc::new(RecordingExecutor::new()), ScriptedHealthChecker::healthy());

        let result = orchestrator
            .execute_complete_rename(&OperationContext::default(), "ghost", "spirit", OrchestrationOptions::default())
            .await;

        assert_eq!(result.failed_phase, Some(OrchestrationPhase::Analysis));
        assert!(result.analysis.is_some());
    }
}
