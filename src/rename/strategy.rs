//! Application-safe rename strategies
//!
//! Three ways to move applications from an old table name to a new one
//! without downtime. Each strategy is expanded into a list of steps and run
//! by the same executor loop, so health monitoring, downtime accounting and
//! rollback behave identically for all of them.
//!
//! Strategies never return `Err`: every failure, including bad input, comes
//! back as `StrategyExecutionResult { success: false, error_message }`.

use super::health::{monitor_window, probe, HealthCheckResult, HealthChecker, RestartCoordinator};
use super::rollback::{CreatedObject, RollbackManager};
use super::coordination::{DependentMove, RenameCoordinationEngine};
use crate::analysis::table_rename::{TableRenameAnalyzer, TableRenameReport};
use crate::config::EngineConfig;
use crate::context::OperationContext;
use crate::db::queries::{validate_identifier, SqlBuilder};
use crate::db::{CatalogClient, SqlExecutor};
use crate::error::{AppError, AppResult};
use crate::schema::RiskLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

// ===== TYPES =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroDowntimeStrategy {
    ViewAliasing,
    BlueGreen,
    GradualMigration,
}

impl ZeroDowntimeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZeroDowntimeStrategy::ViewAliasing => "view_aliasing",
            ZeroDowntimeStrategy::BlueGreen => "blue_green",
            ZeroDowntimeStrategy::GradualMigration => "gradual_migration",
        }
    }
}

impl fmt::Display for ZeroDowntimeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ZeroDowntimeStrategy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "view_aliasing" => Ok(ZeroDowntimeStrategy::ViewAliasing),
            "blue_green" => Ok(ZeroDowntimeStrategy::BlueGreen),
            "gradual_migration" | "gradual" => Ok(ZeroDowntimeStrategy::GradualMigration),
            other => Err(AppError::Validation(format!("Unknown rename strategy: '{}'", other))),
        }
    }
}

/// Whether the table still carries the old name when the strategy starts.
/// After a coordinated rename the strategy only has to move applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenameState {
    Pending,
    AlreadyRenamed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradualPhase {
    PreRenameValidation,
    CreateAliases,
    ExecuteRename,
    ApplicationRestart,
    CleanupAliases,
}

impl GradualPhase {
    pub const ALL: [GradualPhase; 5] = [
        GradualPhase::PreRenameValidation,
        GradualPhase::CreateAliases,
        GradualPhase::ExecuteRename,
        GradualPhase::ApplicationRestart,
        GradualPhase::CleanupAliases,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GradualPhase::PreRenameValidation => "pre_rename_validation",
            GradualPhase::CreateAliases => "create_aliases",
            GradualPhase::ExecuteRename => "execute_rename",
            GradualPhase::ApplicationRestart => "application_restart",
            GradualPhase::CleanupAliases => "cleanup_aliases",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyExecutionResult {
    pub strategy_used: ZeroDowntimeStrategy,
    pub success: bool,
    /// Objects this run created that still exist (or existed before rollback)
    pub created_objects: Vec<CreatedObject>,
    pub health_check_results: Vec<HealthCheckResult>,
    /// Time spent in cutover steps, where old code could observe a missing name
    pub application_downtime: Duration,
    pub error_message: Option<String>,
    pub completed_steps: Vec<String>,
    pub completed_phases: Vec<GradualPhase>,
    pub rolled_back: bool,
    pub rollback_errors: Vec<String>,
}

impl StrategyExecutionResult {
    fn new(strategy: ZeroDowntimeStrategy) -> Self {
        Self {
            strategy_used: strategy,
            success: false,
            created_objects: Vec::new(),
            health_check_results: Vec::new(),
            application_downtime: Duration::ZERO,
            error_message: None,
            completed_steps: Vec::new(),
            completed_phases: Vec::new(),
            rolled_back: false,
            rollback_errors: Vec::new(),
        }
    }

    fn failed(strategy: ZeroDowntimeStrategy, message: String) -> Self {
        Self {
            error_message: Some(message),
            ..Self::new(strategy)
        }
    }
}

enum StepAction {
    /// Statements applied in one transaction; empty means nothing to do
    Ddl(Vec<String>),
    RestartInstances,
    ValidateNames {
        old_name: String,
        new_name: String,
        state: RenameState,
    },
}

/// A failed step, and whether its effects may have landed anyway
struct StepFailure {
    message: String,
    maybe_applied: bool,
}

impl From<AppError> for StepFailure {
    fn from(e: AppError) -> Self {
        // The round trip was abandoned, not refused: a COMMIT may have landed
        let maybe_applied = matches!(e, AppError::Timeout { .. } | AppError::Cancelled(_));
        Self {
            message: e.to_string(),
            maybe_applied,
        }
    }
}

impl From<String> for StepFailure {
    fn from(message: String) -> Self {
        Self {
            message,
            maybe_applied: false,
        }
    }
}

struct StrategyStep {
    description: String,
    action: StepAction,
    creates: Vec<CreatedObject>,
    /// Objects created earlier that this step removes
    releases: Vec<CreatedObject>,
    cutover: bool,
    phase: Option<GradualPhase>,
}

impl StrategyStep {
    fn ddl(description: impl Into<String>, statements: Vec<String>) -> Self {
        Self {
            description: description.into(),
            action: StepAction::Ddl(statements),
            creates: Vec::new(),
            releases: Vec::new(),
            cutover: false,
            phase: None,
        }
    }

    fn restart() -> Self {
        Self {
            action: StepAction::RestartInstances,
            ..Self::ddl("Rolling restart of application instances", Vec::new())
        }
    }

    fn creates(mut self, objects: Vec<CreatedObject>) -> Self {
        self.creates = objects;
        self
    }

    fn releases(mut self, objects: Vec<CreatedObject>) -> Self {
        self.releases = objects;
        self
    }

    fn cutover(mut self) -> Self {
        self.cutover = true;
        self
    }

    fn in_phase(mut self, phase: GradualPhase) -> Self {
        self.phase = Some(phase);
        self
    }
}

// ===== STRATEGY =====

pub struct ApplicationSafeRenameStrategy {
    catalog: Arc<dyn CatalogClient>,
    executor: Arc<dyn SqlExecutor>,
    health: Arc<dyn HealthChecker>,
    restarts: Arc<dyn RestartCoordinator>,
    instances: Vec<String>,
    config: EngineConfig,
    rollback: RollbackManager,
}

impl ApplicationSafeRenameStrategy {
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        executor: Arc<dyn SqlExecutor>,
        health: Arc<dyn HealthChecker>,
        restarts: Arc<dyn RestartCoordinator>,
        config: EngineConfig,
    ) -> Self {
        let rollback = RollbackManager::new(executor.clone());
        Self {
            catalog,
            executor,
            health,
            restarts,
            instances: Vec::new(),
            config,
            rollback,
        }
    }

    /// Application instances restarted one by one during rolling restarts.
    pub fn with_instances(mut self, instances: Vec<String>) -> Self {
        self.instances = instances;
        self
    }

    /// Risky renames get the strategy with the smallest blast radius.
    pub fn select_strategy(old_name: &str, new_name: &str, report: &TableRenameReport) -> ZeroDowntimeStrategy {
        let strategy = match report.overall_risk {
            RiskLevel::Safe | RiskLevel::Low | RiskLevel::Medium => ZeroDowntimeStrategy::ViewAliasing,
            RiskLevel::High | RiskLevel::Critical => ZeroDowntimeStrategy::BlueGreen,
        };
        debug!(
            "Strategy for {} -> {} at risk {}: {}",
            old_name, new_name, report.overall_risk, strategy
        );
        strategy
    }

    pub async fn execute_strategy(
        &self,
        ctx: &OperationContext,
        strategy: ZeroDowntimeStrategy,
        old_name: &str,
        new_name: &str,
        state: RenameState,
    ) -> StrategyExecutionResult {
        match self.plan(ctx, strategy, old_name, new_name, state).await {
            Ok(steps) => self.run(ctx, strategy, steps, false).await,
            Err(e) => StrategyExecutionResult::failed(strategy, e.to_string()),
        }
    }

    pub async fn execute_view_aliasing(
        &self,
        ctx: &OperationContext,
        old_name: &str,
        new_name: &str,
        state: RenameState,
    ) -> StrategyExecutionResult {
        self.execute_strategy(ctx, ZeroDowntimeStrategy::ViewAliasing, old_name, new_name, state)
            .await
    }

    pub async fn execute_blue_green(
        &self,
        ctx: &OperationContext,
        old_name: &str,
        new_name: &str,
        state: RenameState,
    ) -> StrategyExecutionResult {
        self.execute_strategy(ctx, ZeroDowntimeStrategy::BlueGreen, old_name, new_name, state)
            .await
    }

    pub async fn execute_gradual_migration(
        &self,
        ctx: &OperationContext,
        old_name: &str,
        new_name: &str,
        state: RenameState,
    ) -> StrategyExecutionResult {
        self.execute_strategy(ctx, ZeroDowntimeStrategy::GradualMigration, old_name, new_name, state)
            .await
    }

    /// Re-run a gradual migration starting at `from`. Phases are independent,
    /// so a failed phase can be retried without repeating earlier ones.
    /// Rollback only covers objects created by this run.
    #[instrument(skip(self, ctx), fields(operation_id = %ctx.operation_id))]
    pub async fn resume_gradual_migration(
        &self,
        ctx: &OperationContext,
        old_name: &str,
        new_name: &str,
        state: RenameState,
        from: GradualPhase,
    ) -> StrategyExecutionResult {
        let strategy = ZeroDowntimeStrategy::GradualMigration;
        match gradual_steps(old_name, new_name, state) {
            Ok(steps) => {
                let remaining = steps
                    .into_iter()
                    .filter(|s| s.phase.map(|p| p >= from).unwrap_or(true))
                    .collect();
                info!("🔁 Resuming gradual migration at {}", from.as_str());
                self.run(ctx, strategy, remaining, false).await
            }
            Err(e) => StrategyExecutionResult::failed(strategy, e.to_string()),
        }
    }

    /// Interleave the strategy's steps with health monitoring windows. A
    /// degraded or timed-out window aborts the run and rolls back.
    #[instrument(skip(self, ctx), fields(operation_id = %ctx.operation_id))]
    pub async fn execute_with_health_monitoring(
        &self,
        ctx: &OperationContext,
        strategy: ZeroDowntimeStrategy,
        old_name: &str,
        new_name: &str,
        state: RenameState,
    ) -> StrategyExecutionResult {
        match self.plan(ctx, strategy, old_name, new_name, state).await {
            Ok(steps) => self.run(ctx, strategy, steps, true).await,
            Err(e) => StrategyExecutionResult::failed(strategy, e.to_string()),
        }
    }

    /// Drop the alias view left under the old name once every instance has
    /// moved to the new one. Missing aliases are fine.
    #[instrument(skip(self, ctx), fields(operation_id = %ctx.operation_id))]
    pub async fn cleanup_aliases(&self, ctx: &OperationContext, old_name: &str) -> AppResult<()> {
        validate_identifier(old_name)?;
        ctx.ddl("cleanup_aliases", self.executor.execute(&SqlBuilder::drop_view(old_name)))
            .await?;
        info!("🧹 Dropped alias view {}", old_name);
        Ok(())
    }

    /// A pending blue-green swap reads the table's dependents first so the
    /// swap can move them onto the new table.
    async fn plan(
        &self,
        ctx: &OperationContext,
        strategy: ZeroDowntimeStrategy,
        old_name: &str,
        new_name: &str,
        state: RenameState,
    ) -> AppResult<Vec<StrategyStep>> {
        match (strategy, state) {
            (ZeroDowntimeStrategy::ViewAliasing, _) => view_aliasing_steps(old_name, new_name, state),
            (ZeroDowntimeStrategy::GradualMigration, _) => gradual_steps(old_name, new_name, state),
            (ZeroDowntimeStrategy::BlueGreen, RenameState::AlreadyRenamed) => {
                blue_green_rollover_steps(old_name, new_name)
            }
            (ZeroDowntimeStrategy::BlueGreen, RenameState::Pending) => {
                let report = TableRenameAnalyzer::new(self.catalog.clone())
                    .analyze_table_rename(ctx, old_name, new_name)
                    .await?;
                if !report.table_exists {
                    return Err(AppError::NotFound(format!("Table '{}' does not exist", old_name)));
                }
                blue_green_swap_steps(&report)
            }
        }
    }

    async fn run(
        &self,
        ctx: &OperationContext,
        strategy: ZeroDowntimeStrategy,
        steps: Vec<StrategyStep>,
        monitor: bool,
    ) -> StrategyExecutionResult {
        let mut result = StrategyExecutionResult::new(strategy);
        info!("🚀 Executing {} ({} steps)", strategy, steps.len());

        if monitor {
            let baseline = monitor_window(ctx, self.health.as_ref(), &self.config).await;
            result.health_check_results.extend(baseline.results);
            if !baseline.healthy {
                let reason = baseline.error.unwrap_or_default();
                warn!("⛔ Application unhealthy before {}: {}", strategy, reason);
                result.error_message = Some(format!("Application unhealthy before {}: {}", strategy, reason));
                return result;
            }
        }

        for step in steps {
            let StrategyStep {
                description,
                action,
                creates,
                releases,
                cutover,
                phase,
            } = step;

            let started = Instant::now();
            let applied = self.apply(ctx, &action, &mut result).await;
            if let Err(failure) = applied {
                error!("❌ {} failed: {}", description, failure.message);
                if failure.maybe_applied {
                    warn!("⚠️  {} may have committed, tracking its objects for rollback", description);
                    result.created_objects.extend(creates);
                }
                return self
                    .abort(ctx, result, format!("{} failed: {}", description, failure.message))
                    .await;
            }
            if cutover {
                result.application_downtime += started.elapsed();
            }

            result.created_objects.retain(|o| !releases.contains(o));
            result.created_objects.extend(creates);
            result.completed_steps.push(description);
            if let Some(phase) = phase {
                result.completed_phases.push(phase);
            }

            if monitor {
                let window = monitor_window(ctx, self.health.as_ref(), &self.config).await;
                result.health_check_results.extend(window.results);
                if !window.healthy {
                    let reason = window.error.unwrap_or_default();
                    return self.abort(ctx, result, reason).await;
                }
            }
        }

        result.success = true;
        info!(
            "✅ {} completed, downtime {:?}",
            strategy, result.application_downtime
        );
        result
    }

    async fn apply(
        &self,
        ctx: &OperationContext,
        action: &StepAction,
        result: &mut StrategyExecutionResult,
    ) -> Result<(), StepFailure> {
        match action {
            StepAction::Ddl(statements) if statements.is_empty() => Ok(()),
            StepAction::Ddl(statements) => {
                ctx.ddl("strategy_step", self.executor.execute_in_transaction(statements))
                    .await?;
                Ok(())
            }
            StepAction::RestartInstances => {
                for instance in &self.instances {
                    let restarted = ctx
                        .guard(
                            "coordinate_restart",
                            self.config.ddl_timeout,
                            self.restarts.coordinate_restart(instance),
                        )
                        .await?;
                    if !restarted {
                        return Err(format!("instance {} did not come back after restart", instance).into());
                    }

                    let health = probe(ctx, self.health.as_ref(), &self.config).await;
                    let healthy = health.is_healthy;
                    result.health_check_results.push(health);
                    if !healthy {
                        return Err(format!("instance {} is unhealthy after restart", instance).into());
                    }
                    info!("🔄 Restarted {}", instance);
                }
                Ok(())
            }
            StepAction::ValidateNames {
                old_name,
                new_name,
                state,
            } => self
                .validate_names(ctx, old_name, new_name, *state)
                .await
                .map_err(StepFailure::from),
        }
    }

    async fn validate_names(
        &self,
        ctx: &OperationContext,
        old_name: &str,
        new_name: &str,
        state: RenameState,
    ) -> Result<(), String> {
        let validation = TableRenameAnalyzer::validate_rename_operation(old_name, new_name);
        if !validation.is_valid {
            return Err(validation.errors.join("; "));
        }

        match state {
            RenameState::Pending => {
                if !self.table_exists(ctx, old_name).await? {
                    return Err(format!("table {} does not exist", old_name));
                }
                if self.table_exists(ctx, new_name).await? {
                    return Err(format!("table {} already exists", new_name));
                }
            }
            RenameState::AlreadyRenamed => {
                if !self.table_exists(ctx, new_name).await? {
                    return Err(format!("table {} does not exist", new_name));
                }
            }
        }
        Ok(())
    }

    async fn table_exists(&self, ctx: &OperationContext, table: &str) -> Result<bool, String> {
        ctx.catalog("table_exists", self.catalog.table_exists(table))
            .await
            .map_err(|e| e.to_string())
    }

    async fn abort(
        &self,
        ctx: &OperationContext,
        mut result: StrategyExecutionResult,
        message: String,
    ) -> StrategyExecutionResult {
        // Rollback must still run when the failure was a cancellation
        let rollback_ctx = ctx.detached();
        warn!(
            "⏪ Rolling back {} ({} created objects)",
            result.strategy_used,
            result.created_objects.len()
        );
        let rollback = self
            .rollback
            .execute_rollback(&rollback_ctx, &result.created_objects)
            .await;
        result.rolled_back = rollback.success;
        result.rollback_errors = rollback.errors;
        result.error_message = Some(message);
        result
    }
}

// ===== STEP PLANS =====

fn check_identifiers(names: &[&str]) -> AppResult<()> {
    for name in names {
        validate_identifier(name)?;
    }
    Ok(())
}

/// Rename (unless done already) and leave a view under the old name.
fn view_aliasing_steps(old_name: &str, new_name: &str, state: RenameState) -> AppResult<Vec<StrategyStep>> {
    check_identifiers(&[old_name, new_name])?;

    let step = match state {
        RenameState::Pending => StrategyStep::ddl(
            format!("Rename {} to {} behind alias view", old_name, new_name),
            vec![
                SqlBuilder::rename_table(old_name, new_name),
                SqlBuilder::create_alias_view(old_name, new_name),
            ],
        )
        .creates(vec![
            CreatedObject::renamed(old_name, new_name),
            CreatedObject::view(old_name),
        ])
        .cutover(),
        RenameState::AlreadyRenamed => StrategyStep::ddl(
            format!("Create alias view {} over {}", old_name, new_name),
            vec![SqlBuilder::create_alias_view(old_name, new_name)],
        )
        .creates(vec![CreatedObject::view(old_name)]),
    };
    Ok(vec![step])
}

/// Build a green copy, then in one transaction: block writers, backfill,
/// swap names and move every dependent onto the green table. The original
/// is kept as `{old}_blue`.
fn blue_green_swap_steps(report: &TableRenameReport) -> AppResult<Vec<StrategyStep>> {
    let old_name = report.old_name.as_str();
    let new_name = report.new_name.as_str();
    check_identifiers(&[old_name, new_name])?;

    let green = format!("{}_green", new_name);
    let blue = format!("{}_blue", old_name);
    check_identifiers(&[&green, &blue])?;

    let DependentMove {
        detach,
        attach,
        undo_attach,
        restore,
    } = RenameCoordinationEngine::dependent_move(report)?;
    let has_dependents = !detach.is_empty();

    let mut swap = vec![
        SqlBuilder::lock_table_exclusive(old_name),
        SqlBuilder::insert_select_all(&green, old_name),
    ];
    swap.extend(detach);
    swap.push(SqlBuilder::rename_table(old_name, &blue));
    swap.push(SqlBuilder::rename_table(&green, new_name));
    swap.extend(attach);

    // Undone in reverse: drop the moved dependents, swap names back, restore
    let mut swapped = Vec::new();
    if has_dependents {
        swapped.push(CreatedObject::dependents(old_name, restore));
    }
    swapped.push(CreatedObject::renamed(old_name, &blue));
    swapped.push(CreatedObject::renamed(&green, new_name));
    if has_dependents {
        swapped.push(CreatedObject::dependents(new_name, undo_attach));
    }

    Ok(vec![
        StrategyStep::ddl(
            format!("Create green table {}", green),
            vec![SqlBuilder::create_table_like(&green, old_name)],
        )
        .creates(vec![CreatedObject::table(&green)]),
        StrategyStep::ddl(format!("Backfill {} and swap it in as {}", green, new_name), swap)
            .creates(swapped)
            .cutover(),
    ])
}

/// The table already carries the new name: expose it under the old name,
/// roll instances over, then retire the alias.
fn blue_green_rollover_steps(old_name: &str, new_name: &str) -> AppResult<Vec<StrategyStep>> {
    check_identifiers(&[old_name, new_name])?;

    Ok(vec![
        StrategyStep::ddl(
            format!("Expose {} as {}", new_name, old_name),
            vec![SqlBuilder::create_alias_view(old_name, new_name)],
        )
        .creates(vec![CreatedObject::view(old_name)]),
        StrategyStep::restart(),
        StrategyStep::ddl(
            format!("Retire alias {}", old_name),
            vec![SqlBuilder::drop_view(old_name)],
        )
        .releases(vec![CreatedObject::view(old_name)]),
    ])
}

fn gradual_steps(old_name: &str, new_name: &str, state: RenameState) -> AppResult<Vec<StrategyStep>> {
    check_identifiers(&[old_name, new_name])?;

    let validation = StrategyStep {
        action: StepAction::ValidateNames {
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
            state,
        },
        ..StrategyStep::ddl(format!("Validate rename {} -> {}", old_name, new_name), Vec::new())
    }
    .in_phase(GradualPhase::PreRenameValidation);

    let (aliases, rename) = match state {
        RenameState::Pending => (
            StrategyStep::ddl(
                format!("Expose {} as {}", old_name, new_name),
                vec![SqlBuilder::create_alias_view(new_name, old_name)],
            )
            .creates(vec![CreatedObject::view(new_name)]),
            StrategyStep::ddl(
                format!("Rename {} to {}", old_name, new_name),
                vec![
                    SqlBuilder::drop_view(new_name),
                    SqlBuilder::rename_table(old_name, new_name),
                    SqlBuilder::create_alias_view(old_name, new_name),
                ],
            )
            .creates(vec![
                CreatedObject::renamed(old_name, new_name),
                CreatedObject::view(old_name),
            ])
            .releases(vec![CreatedObject::view(new_name)])
            .cutover(),
        ),
        RenameState::AlreadyRenamed => (
            StrategyStep::ddl(
                format!("Expose {} as {}", new_name, old_name),
                vec![SqlBuilder::create_alias_view(old_name, new_name)],
            )
            .creates(vec![CreatedObject::view(old_name)]),
            StrategyStep::ddl(format!("{} already renamed to {}", old_name, new_name), Vec::new()),
        ),
    };

    Ok(vec![
        validation,
        aliases.in_phase(GradualPhase::CreateAliases),
        rename.in_phase(GradualPhase::ExecuteRename),
        StrategyStep::restart().in_phase(GradualPhase::ApplicationRestart),
        StrategyStep::ddl(
            format!("Drop alias view {}", old_name),
            vec![SqlBuilder::drop_view(old_name)],
        )
        .releases(vec![CreatedObject::view(old_name)])
        .in_phase(GradualPhase::CleanupAliases),
    ])
}
