//! Staging Environment Manager
//!
//! Isolated databases seeded from a production schema and a data sample,
//! used to dry-run a plan before it touches production. Production is only
//! ever read. Environments are admission-controlled by
//! `max_staging_environments` and must be cleaned up explicitly or by TTL.

pub mod postgres;

use crate::config::EngineConfig;
use crate::context::OperationContext;
use crate::db::queries::validate_identifier;
use crate::db::SqlExecutor;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const MAX_IDENTIFIER_LENGTH: usize = 63;

/// DDL used to recreate one production table in staging
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDdl {
    pub table: String,
    pub ddl: String,
}

/// Database-side operations the manager needs
#[async_trait]
pub trait StagingBackend: Send + Sync {
    async fn create_database(&self, name: &str) -> AppResult<()>;

    /// `false` when the database was already gone.
    async fn drop_database(&self, name: &str) -> AppResult<bool>;

    /// Recreate every production table in `staging_db`; returns what was run.
    async fn replicate_schema(&self, production_db: &str, staging_db: &str) -> AppResult<Vec<TableDdl>>;

    /// Copy a `fraction` sample of `table`; returns rows copied.
    async fn copy_sample(&self, production_db: &str, staging_db: &str, table: &str, fraction: f64) -> AppResult<u64>;

    async fn executor_for(&self, database: &str) -> AppResult<Arc<dyn SqlExecutor>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingStatus {
    Provisioning,
    Active,
    Cleaning,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingEnvironmentInfo {
    pub staging_id: Uuid,
    pub database_name: String,
    pub status: StagingStatus,
    pub production_db: String,
    pub data_sample_size: f64,
    pub created_at: DateTime<Utc>,
    pub tables: Vec<String>,
    pub schema_checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaReplicationResult {
    pub staging_id: Uuid,
    pub tables_replicated: usize,
    pub tables: Vec<String>,
    pub schema_checksum: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSamplingResult {
    pub staging_id: Uuid,
    /// Sample size as a percentage, 0 to 100
    pub sample_percentage: f64,
    pub tables_sampled: usize,
    pub rows_copied: u64,
    pub failed_tables: Vec<String>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingDryRunResult {
    pub staging_id: Uuid,
    pub success: bool,
    pub statements_executed: usize,
    pub failed_statement: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingCleanupResult {
    pub staging_id: Uuid,
    pub database_name: String,
    pub resources_freed: bool,
    pub database_dropped: bool,
    pub errors: Vec<String>,
}

pub struct StagingEnvironmentManager {
    backend: Arc<dyn StagingBackend>,
    config: EngineConfig,
    environments: RwLock<HashMap<Uuid, StagingEnvironmentInfo>>,
}

impl StagingEnvironmentManager {
    pub fn new(backend: Arc<dyn StagingBackend>, config: EngineConfig) -> Self {
        Self {
            backend,
            config,
            environments: RwLock::new(HashMap::new()),
        }
    }

    /// Staging database name for `production_db`, unique per id. Long
    /// production names are cut so the result stays a valid identifier.
    pub fn staging_database_name(production_db: &str, staging_id: Uuid) -> String {
        let hex: String = staging_id.simple().to_string().chars().take(8).collect();
        let suffix = format!("_staging_{}", hex);
        let prefix: String = production_db
            .chars()
            .take(MAX_IDENTIFIER_LENGTH.saturating_sub(suffix.len()))
            .collect();
        format!("{}{}", prefix, suffix)
    }

    /// Reserve a slot and create an empty staging database.
    #[instrument(skip(self, ctx), fields(operation_id = %ctx.operation_id))]
    pub async fn create_staging_environment(
        &self,
        ctx: &OperationContext,
        production_db: &str,
        data_sample_size: f64,
    ) -> AppResult<StagingEnvironmentInfo> {
        if !(0.0..=1.0).contains(&data_sample_size) {
            return Err(AppError::Validation(format!(
                "Data sample size must be between 0 and 1, got {}",
                data_sample_size
            )));
        }
        validate_identifier(production_db)?;

        let staging_id = Uuid::new_v4();
        let database_name = Self::staging_database_name(production_db, staging_id);
        validate_identifier(&database_name)?;

        let info = StagingEnvironmentInfo {
            staging_id,
            database_name: database_name.clone(),
            status: StagingStatus::Provisioning,
            production_db: production_db.to_string(),
            data_sample_size,
            created_at: Utc::now(),
            tables: Vec::new(),
            schema_checksum: None,
        };

        // Admission check and reservation happen under one write lock
        {
            let mut environments = self.environments.write().await;
            if environments.len() >= self.config.max_staging_environments {
                warn!(
                    "⛔ Staging capacity reached ({}/{})",
                    environments.len(),
                    self.config.max_staging_environments
                );
                return Err(AppError::CapacityExceeded(format!(
                    "Maximum of {} staging environments reached",
                    self.config.max_staging_environments
                )));
            }
            environments.insert(staging_id, info);
        }

        if let Err(e) = ctx
            .ddl("create_staging_database", self.backend.create_database(&database_name))
            .await
        {
            error!("❌ Failed to create staging database {}: {}", database_name, e);
            self.environments.write().await.remove(&staging_id);
            return Err(e);
        }

        let info = {
            let mut environments = self.environments.write().await;
            let entry = environments
                .get_mut(&staging_id)
                .ok_or_else(|| AppError::Internal(format!("Staging environment {} vanished", staging_id)))?;
            entry.status = StagingStatus::Active;
            entry.clone()
        };

        info!("🧪 Staging environment {} created ({})", staging_id, database_name);
        Ok(info)
    }

    #[instrument(skip(self, ctx), fields(operation_id = %ctx.operation_id))]
    pub async fn replicate_production_schema(
        &self,
        ctx: &OperationContext,
        staging_id: Uuid,
    ) -> AppResult<SchemaReplicationResult> {
        let env = self.active_environment(staging_id).await?;
        let started = Instant::now();

        let mut replicated = ctx
            .ddl(
                "replicate_schema",
                self.backend.replicate_schema(&env.production_db, &env.database_name),
            )
            .await?;
        replicated.sort_by(|a, b| a.table.cmp(&b.table));

        let schema_checksum = schema_checksum(&replicated);
        let tables: Vec<String> = replicated.into_iter().map(|t| t.table).collect();

        if let Some(entry) = self.environments.write().await.get_mut(&staging_id) {
            entry.tables = tables.clone();
            entry.schema_checksum = Some(schema_checksum.clone());
        }

        info!("💾 Replicated {} tables into {}", tables.len(), env.database_name);
        Ok(SchemaReplicationResult {
            staging_id,
            tables_replicated: tables.len(),
            tables,
            schema_checksum,
            duration: started.elapsed(),
        })
    }

    /// Copy the environment's sample fraction of every replicated table.
    /// A table that fails to copy is reported, not fatal.
    #[instrument(skip(self, ctx), fields(operation_id = %ctx.operation_id))]
    pub async fn sample_production_data(
        &self,
        ctx: &OperationContext,
        staging_id: Uuid,
    ) -> AppResult<DataSamplingResult> {
        let env = self.active_environment(staging_id).await?;
        if env.schema_checksum.is_none() {
            return Err(AppError::Validation(format!(
                "Schema of staging environment {} has not been replicated",
                staging_id
            )));
        }

        let started = Instant::now();
        let mut rows_copied = 0;
        let mut tables_sampled = 0;
        let mut failed_tables = Vec::new();

        if env.data_sample_size > 0.0 {
            for table in &env.tables {
                match ctx
                    .ddl(
                        "copy_sample",
                        self.backend
                            .copy_sample(&env.production_db, &env.database_name, table, env.data_sample_size),
                    )
                    .await
                {
                    Ok(rows) => {
                        rows_copied += rows;
                        tables_sampled += 1;
                    }
                    Err(e @ AppError::Cancelled(_)) => return Err(e),
                    Err(e) => {
                        warn!("⚠️  Sampling {} failed: {}", table, e);
                        failed_tables.push(table.clone());
                    }
                }
            }
        }

        info!(
            "💾 Sampled {} rows from {} tables into {}",
            rows_copied, tables_sampled, env.database_name
        );
        Ok(DataSamplingResult {
            staging_id,
            sample_percentage: env.data_sample_size * 100.0,
            tables_sampled,
            rows_copied,
            failed_tables,
            duration: started.elapsed(),
        })
    }

    /// Run a plan's statements against the staging database in one
    /// transaction. A failing statement is a result, not an error.
    #[instrument(skip(self, ctx, statements), fields(operation_id = %ctx.operation_id, statements = statements.len()))]
    pub async fn dry_run_statements(
        &self,
        ctx: &OperationContext,
        staging_id: Uuid,
        statements: &[String],
    ) -> AppResult<StagingDryRunResult> {
        let env = self.active_environment(staging_id).await?;
        let started = Instant::now();
        let executor = ctx
            .ddl("staging_connect", self.backend.executor_for(&env.database_name))
            .await?;

        let mut result = StagingDryRunResult {
            staging_id,
            success: false,
            statements_executed: 0,
            failed_statement: None,
            error: None,
            duration: Duration::ZERO,
        };

        match ctx
            .ddl("staging_dry_run", executor.execute_in_transaction(statements))
            .await
        {
            Ok(_) => {
                result.success = true;
                result.statements_executed = statements.len();
                info!("✅ Dry run of {} statements passed in {}", statements.len(), env.database_name);
            }
            Err(AppError::StatementFailed { index, statement, message }) => {
                warn!("❌ Dry run failed at statement {}: {}", index, message);
                result.statements_executed = index;
                result.failed_statement = Some(statement);
                result.error = Some(message);
            }
            Err(e) => return Err(e),
        }

        result.duration = started.elapsed();
        Ok(result)
    }

    /// Drop the staging database and release the slot. An unknown id is a
    /// validation error. A failed drop keeps the slot so it can be retried.
    #[instrument(skip(self, ctx), fields(operation_id = %ctx.operation_id))]
    pub async fn cleanup_staging_environment(
        &self,
        ctx: &OperationContext,
        staging_id: Uuid,
    ) -> AppResult<StagingCleanupResult> {
        let database_name = {
            let mut environments = self.environments.write().await;
            let entry = environments
                .get_mut(&staging_id)
                .ok_or_else(|| AppError::Validation(format!("Unknown staging environment {}", staging_id)))?;
            entry.status = StagingStatus::Cleaning;
            entry.database_name.clone()
        };

        let mut result = StagingCleanupResult {
            staging_id,
            database_name: database_name.clone(),
            resources_freed: false,
            database_dropped: false,
            errors: Vec::new(),
        };

        // Cleanup must run even after the caller cancelled its operation
        match ctx
            .detached()
            .ddl("drop_staging_database", self.backend.drop_database(&database_name))
            .await
        {
            Ok(dropped) => {
                if !dropped {
                    warn!("⚠️  Staging database {} was already gone", database_name);
                }
                self.environments.write().await.remove(&staging_id);
                result.database_dropped = dropped;
                result.resources_freed = true;
                info!("🧹 Staging environment {} cleaned up", staging_id);
            }
            Err(e) => {
                error!("❌ Failed to drop staging database {}: {}", database_name, e);
                if let Some(entry) = self.environments.write().await.get_mut(&staging_id) {
                    entry.status = StagingStatus::Active;
                }
                result.errors.push(e.to_string());
            }
        }

        Ok(result)
    }

    pub async fn list_environments(&self) -> Vec<StagingEnvironmentInfo> {
        let mut environments: Vec<StagingEnvironmentInfo> =
            self.environments.read().await.values().cloned().collect();
        environments.sort_by_key(|e| e.created_at);
        environments
    }

    /// Clean up every environment older than `staging_ttl`.
    pub async fn cleanup_expired(&self, ctx: &OperationContext) -> Vec<StagingCleanupResult> {
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .environments
            .read()
            .await
            .values()
            .filter(|e| e.status == StagingStatus::Active)
            .filter(|e| (now - e.created_at).to_std().unwrap_or_default() >= self.config.staging_ttl)
            .map(|e| e.staging_id)
            .collect();

        let mut results = Vec::with_capacity(expired.len());
        for staging_id in expired {
            match self.cleanup_staging_environment(ctx, staging_id).await {
                Ok(result) => results.push(result),
                // Removed concurrently
                Err(e) => warn!("⚠️  Expired environment {} skipped: {}", staging_id, e),
            }
        }
        results
    }

    async fn active_environment(&self, staging_id: Uuid) -> AppResult<StagingEnvironmentInfo> {
        let environments = self.environments.read().await;
        let env = environments
            .get(&staging_id)
            .ok_or_else(|| AppError::Validation(format!("Unknown staging environment {}", staging_id)))?;
        if env.status != StagingStatus::Active {
            return Err(AppError::Validation(format!(
                "Staging environment {} is not active",
                staging_id
            )));
        }
        Ok(env.clone())
    }
}

/// Order-independent digest of the replicated DDL
fn schema_checksum(tables: &[TableDdl]) -> String {
    let mut hasher = Sha256::new();
    for table in tables {
        hasher.update(table.table.as_bytes());
        hasher.update(b"\n");
        hasher.update(table.ddl.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedStaging;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use tokio_test::assert_ok;

    fn manager(backend: Arc<ScriptedStaging>, max: usize) -> StagingEnvironmentManager {
        StagingEnvironmentManager::new(
            backend,
            EngineConfig {
                max_staging_environments: max,
                ..EngineConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_sample_size_out_of_range() {
        let manager = manager(Arc::new(ScriptedStaging::new()), 3);
        let ctx = OperationContext::default();

        for size in [1.5, -0.1, f64::NAN] {
            let result = manager.create_staging_environment(&ctx, "shop", size).await;
            assert!(matches!(result, Err(AppError::Validation(_))), "size {}", size);
        }
        assert!(manager.list_environments().await.is_empty());
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_capacity_enforced() {
        let backend = Arc::new(ScriptedStaging::new());
        let manager = manager(backend.clone(), 2);
        let ctx = OperationContext::default();

        let a = assert_ok!(manager.create_staging_environment(&ctx, "shop", 0.1).await);
        let b = assert_ok!(manager.create_staging_environment(&ctx, "shop", 0.1).await);
        assert_ne!(a.staging_id, b.staging_id);
        assert_ne!(a.database_name, b.database_name);
        assert!(a.database_name.starts_with("shop_staging_"));
        assert_eq!(a.status, StagingStatus::Active);

        let third = manager.create_staging_environment(&ctx, "shop", 0.1).await;
        assert!(matches!(third, Err(AppError::CapacityExceeded(_))));

        let cleanup = assert_ok!(manager.cleanup_staging_environment(&ctx, a.staging_id).await);
        assert!(cleanup.resources_freed && cleanup.database_dropped);
        assert_eq!(backend.dropped(), vec![a.database_name.clone()]);
        assert_ok!(manager.create_staging_environment(&ctx, "shop", 0.1).await);

        let created: HashSet<String> = backend.created().into_iter().collect();
        assert_eq!(created.len(), 3);
    }

    #[tokio::test]
    async fn test_replicate_then_sample() {
        let backend = Arc::new(
            ScriptedStaging::new()
                .with_table("users", "CREATE TABLE \"users\" (\"id\" integer NOT NULL)")
                .with_table("orders", "CREATE TABLE \"orders\" (\"id\" integer NOT NULL)"),
        );
        let manager = manager(backend.clone(), 3);
        let ctx = OperationContext::default();
        let env = manager.create_staging_environment(&ctx, "shop", 0.25).await.unwrap();

        let early = manager.sample_production_data(&ctx, env.staging_id).await;
        assert!(matches!(early, Err(AppError::Validation(_))));

        let replication = assert_ok!(manager.replicate_production_schema(&ctx, env.staging_id).await);
        assert_eq!(replication.tables_replicated, 2);
        assert_eq!(replication.tables, vec!["orders", "users"]);
        assert_eq!(replication.schema_checksum.len(), 64);

        let sampling = assert_ok!(manager.sample_production_data(&ctx, env.staging_id).await);
        assert_eq!(sampling.sample_percentage, 25.0);
        assert_eq!(sampling.tables_sampled, 2);
        assert_eq!(sampling.rows_copied, 20);
    }

    #[tokio::test]
    async fn test_dry_run_reports_failing_statement() {
        let backend = Arc::new(ScriptedStaging::new().failing_on("DROP COLUMN"));
        let manager = manager(backend, 3);
        let ctx = OperationContext::default();
        let env = manager.create_staging_environment(&ctx, "shop", 0.0).await.unwrap();

        let statements = vec![
            "ALTER TABLE \"users\" ADD COLUMN \"nickname\" text".to_string(),
            "ALTER TABLE \"users\" DROP COLUMN \"email\"".to_string(),
        ];
        let result = assert_ok!(manager.dry_run_statements(&ctx, env.staging_id, &statements).await);

        assert!(!result.success);
        assert_eq!(result.statements_executed, 1);
        assert_eq!(result.failed_statement.as_deref(), Some(statements[1].as_str()));
    }

    #[tokio::test]
    async fn test_long_production_name_still_gets_staging() {
        let backend = Arc::new(ScriptedStaging::new());
        let manager = manager(backend, 3);
        let production_db = format!("p{}", "x".repeat(60));

        let env = assert_ok!(
            manager
                .create_staging_environment(&OperationContext::default(), &production_db, 0.1)
                .await
        );

        assert_eq!(env.database_name.len(), 63);
        assert!(env.database_name.starts_with("pxxx"));
        assert!(env.database_name.contains("_staging_"));
        assert_eq!(env.production_db, production_db);
    }

    #[tokio::test]
    async fn test_slow_staging_connection_times_out() {
        let backend = Arc::new(ScriptedStaging::new().connecting_after(Duration::from_secs(5)));
        let manager = manager(backend, 3);
        let env = manager
            .create_staging_environment(&OperationContext::default(), "shop", 0.0)
            .await
            .unwrap();
        let ctx = OperationContext::new(&EngineConfig {
            ddl_timeout: Duration::from_millis(20),
            ..EngineConfig::default()
        });

        let result = manager
            .dry_run_statements(&ctx, env.staging_id, &["SELECT 1".to_string()])
            .await;

        assert!(matches!(
            result,
            Err(AppError::Timeout { ref operation, .. }) if operation == "staging_connect"
        ));
    }

    #[tokio::test]
    async fn test_cleanup_unknown_environment_is_an_error() {
        let manager = manager(Arc::new(ScriptedStaging::new()), 3);
        let result = manager
            .cleanup_staging_environment(&OperationContext::default(), Uuid::new_v4())
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_failed_drop_keeps_the_slot() {
        let backend = Arc::new(ScriptedStaging::new().failing_drops());
        let manager = manager(backend, 3);
        let ctx = OperationContext::default();
        let env = manager.create_staging_environment(&ctx, "shop", 0.1).await.unwrap();

        let result = assert_ok!(manager.cleanup_staging_environment(&ctx, env.staging_id).await);

        assert!(!result.resources_freed);
        assert!(!result.database_dropped);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(manager.list_environments().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let backend = Arc::new(ScriptedStaging::new());
        let manager = StagingEnvironmentManager::new(
            backend,
            EngineConfig {
                staging_ttl: Duration::ZERO,
                ..EngineConfig::default()
            },
        );
        let ctx = OperationContext::default();
        manager.create_staging_environment(&ctx, "shop", 0.1).await.unwrap();
        manager.create_staging_environment(&ctx, "shop", 0.1).await.unwrap();

        let results = manager.cleanup_expired(&ctx).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.resources_freed));
        assert!(manager.list_environments().await.is_empty());
    }
}
