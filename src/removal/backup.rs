//! Backup handlers for column removal
//!
//! A backup is a side table created before anything is dropped. Its name is
//! deterministic so operators can find it later:
//! `{table}__{column}_backup_{timestamp}` for column backups and
//! `{table}_backup_{timestamp}` for full snapshots.

use crate::context::OperationContext;
use crate::db::queries::{split_qualified, SqlBuilder, DEFAULT_SCHEMA};
use crate::db::{CatalogClient, SqlExecutor};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Row identity used when the table has no primary key
pub const ROW_ID_COLUMN: &str = "backup_row_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStrategy {
    #[default]
    ColumnOnly,
    TableSnapshot,
}

impl BackupStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStrategy::ColumnOnly => "column_only",
            BackupStrategy::TableSnapshot => "table_snapshot",
        }
    }
}

impl fmt::Display for BackupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStrategy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "column_only" | "column" => Ok(BackupStrategy::ColumnOnly),
            "table_snapshot" | "snapshot" | "table" => Ok(BackupStrategy::TableSnapshot),
            other => Err(AppError::Validation(format!("Unknown backup strategy: '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub strategy: BackupStrategy,
    /// Backup table name
    pub location: String,
    pub source_table: String,
    pub column: String,
    /// Columns that identify a row in both the source and the backup
    pub key_columns: Vec<String>,
    /// Whether `key_columns` is the `ctid` fallback
    pub uses_row_identity: bool,
    /// Rows copied
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub verification_query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupCleanupResult {
    pub success: bool,
    pub location: String,
    pub message: String,
}

#[async_trait]
pub trait BackupHandler: Send + Sync {
    fn strategy(&self) -> BackupStrategy;

    /// Copy the data needed to restore `table.column` into a new side table.
    async fn create_backup(&self, ctx: &OperationContext, table: &str, column: &str) -> AppResult<BackupInfo>;

    /// Drop the backup table. Safe to call repeatedly; never returns an error.
    async fn cleanup_backup(&self, ctx: &OperationContext, backup: &BackupInfo) -> BackupCleanupResult;

    /// Statements that put the backed-up values back into a re-added column.
    fn restore_statements(&self, backup: &BackupInfo) -> Vec<String> {
        restore_from(backup)
    }
}

pub fn handler_for(
    strategy: BackupStrategy,
    catalog: Arc<dyn CatalogClient>,
    executor: Arc<dyn SqlExecutor>,
) -> Arc<dyn BackupHandler> {
    match strategy {
        BackupStrategy::ColumnOnly => Arc::new(ColumnOnlyBackupHandler::new(catalog, executor)),
        BackupStrategy::TableSnapshot => Arc::new(TableSnapshotBackupHandler::new(catalog, executor)),
    }
}

/// Copies the primary key (or row identity) plus the one column
pub struct ColumnOnlyBackupHandler {
    catalog: Arc<dyn CatalogClient>,
    executor: Arc<dyn SqlExecutor>,
}

impl ColumnOnlyBackupHandler {
    pub fn new(catalog: Arc<dyn CatalogClient>, executor: Arc<dyn SqlExecutor>) -> Self {
        Self { catalog, executor }
    }

    pub fn backup_name(table: &str, column: &str, at: DateTime<Utc>) -> String {
        qualify_like(table, format!("{}__{}_backup_{}", bare(table), column, at.format("%Y%m%d%H%M%S")))
    }
}

#[async_trait]
impl BackupHandler for ColumnOnlyBackupHandler {
    fn strategy(&self) -> BackupStrategy {
        BackupStrategy::ColumnOnly
    }

    async fn create_backup(&self, ctx: &OperationContext, table: &str, column: &str) -> AppResult<BackupInfo> {
        let now = Utc::now();
        let location = Self::backup_name(table, column, now);
        let keys = row_keys(ctx, self.catalog.as_ref(), table).await?;

        let mut select_list: Vec<String> = keys.select_list();
        select_list.push(SqlBuilder::quote_ident(column));
        let select = format!(
            "SELECT {} FROM {}",
            select_list.join(", "),
            SqlBuilder::quote_qualified(table)
        );

        run_backup(ctx, self.executor.as_ref(), BackupStrategy::ColumnOnly, table, column, location, keys, select, now)
            .await
    }

    async fn cleanup_backup(&self, ctx: &OperationContext, backup: &BackupInfo) -> BackupCleanupResult {
        drop_backup(ctx, self.executor.as_ref(), backup).await
    }
}

/// Copies the entire table
pub struct TableSnapshotBackupHandler {
    catalog: Arc<dyn CatalogClient>,
    executor: Arc<dyn SqlExecutor>,
}

impl TableSnapshotBackupHandler {
    pub fn new(catalog: Arc<dyn CatalogClient>, executor: Arc<dyn SqlExecutor>) -> Self {
        Self { catalog, executor }
    }

    pub fn backup_name(table: &str, at: DateTime<Utc>) -> String {
        qualify_like(table, format!("{}_backup_{}", bare(table), at.format("%Y%m%d%H%M%S")))
    }
}

#[async_trait]
impl BackupHandler for TableSnapshotBackupHandler {
    fn strategy(&self) -> BackupStrategy {
        BackupStrategy::TableSnapshot
    }

    async fn create_backup(&self, ctx: &OperationContext, table: &str, column: &str) -> AppResult<BackupInfo> {
        let now = Utc::now();
        let location = Self::backup_name(table, now);
        let keys = row_keys(ctx, self.catalog.as_ref(), table).await?;

        let select = if keys.uses_row_identity {
            format!(
                "SELECT ctid AS {}, * FROM {}",
                SqlBuilder::quote_ident(ROW_ID_COLUMN),
                SqlBuilder::quote_qualified(table)
            )
        } else {
            format!("SELECT * FROM {}", SqlBuilder::quote_qualified(table))
        };

        run_backup(ctx, self.executor.as_ref(), BackupStrategy::TableSnapshot, table, column, location, keys, select, now)
            .await
    }

    async fn cleanup_backup(&self, ctx: &OperationContext, backup: &BackupInfo) -> BackupCleanupResult {
        drop_backup(ctx, self.executor.as_ref(), backup).await
    }
}

struct RowKeys {
    columns: Vec<String>,
    uses_row_identity: bool,
}

impl RowKeys {
    fn select_list(&self) -> Vec<String> {
        if self.uses_row_identity {
            vec![format!("ctid AS {}", SqlBuilder::quote_ident(ROW_ID_COLUMN))]
        } else {
            self.columns.iter().map(|c| SqlBuilder::quote_ident(c)).collect()
        }
    }
}

async fn row_keys(ctx: &OperationContext, catalog: &dyn CatalogClient, table: &str) -> AppResult<RowKeys> {
    let columns = ctx
        .catalog("primary_key_columns", catalog.primary_key_columns(table))
        .await?;
    if columns.is_empty() {
        warn!("⚠️  {} has no primary key; backup keyed by row identity (ctid)", table);
        Ok(RowKeys {
            columns: vec![ROW_ID_COLUMN.to_string()],
            uses_row_identity: true,
        })
    } else {
        Ok(RowKeys {
            columns,
            uses_row_identity: false,
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_backup(
    ctx: &OperationContext,
    executor: &dyn SqlExecutor,
    strategy: BackupStrategy,
    table: &str,
    column: &str,
    location: String,
    keys: RowKeys,
    select: String,
    created_at: DateTime<Utc>,
) -> AppResult<BackupInfo> {
    let statements = vec![SqlBuilder::create_table_as(&location, &select)];
    ctx.ddl("create_backup", executor.execute_in_transaction(&statements))
        .await?;

    let verification_query = SqlBuilder::count_rows(&location);
    let size = ctx
        .ddl("count_backup_rows", executor.query_scalar(&verification_query))
        .await?;

    info!("💾 Backup {} created ({} rows, {})", location, size, strategy);

    Ok(BackupInfo {
        strategy,
        location,
        source_table: table.to_string(),
        column: column.to_string(),
        key_columns: keys.columns,
        uses_row_identity: keys.uses_row_identity,
        size: size.max(0) as u64,
        created_at,
        verification_query,
    })
}

async fn drop_backup(ctx: &OperationContext, executor: &dyn SqlExecutor, backup: &BackupInfo) -> BackupCleanupResult {
    let sql = SqlBuilder::drop_table_if_exists(&backup.location);
    match ctx.ddl("cleanup_backup", executor.execute(&sql)).await {
        Ok(_) => {
            info!("🧹 Backup {} dropped", backup.location);
            BackupCleanupResult {
                success: true,
                location: backup.location.clone(),
                message: format!("Backup {} removed", backup.location),
            }
        }
        Err(e) => {
            warn!("⚠️  Failed to drop backup {}: {}", backup.location, e);
            BackupCleanupResult {
                success: false,
                location: backup.location.clone(),
                message: format!("Failed to drop backup {}: {}", backup.location, e),
            }
        }
    }
}

/// `UPDATE ... FROM backup` joined on the recorded key columns
fn restore_from(backup: &BackupInfo) -> Vec<String> {
    let join = if backup.uses_row_identity {
        format!("t.ctid = b.{}", SqlBuilder::quote_ident(ROW_ID_COLUMN))
    } else {
        backup
            .key_columns
            .iter()
            .map(|k| format!("t.{0} = b.{0}", SqlBuilder::quote_ident(k)))
            .collect::<Vec<_>>()
            .join(" AND ")
    };

    vec![format!(
        "UPDATE {} AS t SET {col} = b.{col} FROM {} AS b WHERE {}",
        SqlBuilder::quote_qualified(&backup.source_table),
        SqlBuilder::quote_qualified(&backup.location),
        join,
        col = SqlBuilder::quote_ident(&backup.column),
    )]
}

fn bare(table: &str) -> &str {
    split_qualified(table).1
}

/// Put `name` in the same schema as `table`.
fn qualify_like(table: &str, name: String) -> String {
    match split_qualified(table) {
        (schema, _) if schema != DEFAULT_SCHEMA => format!("{}.{}", schema, name),
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingExecutor, ScriptedCatalog};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tokio_test::assert_ok;

    #[test]
    fn test_backup_names_are_deterministic() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            ColumnOnlyBackupHandler::backup_name("users", "email", at),
            "users__email_backup_20240309140507"
        );
        assert_eq!(
            TableSnapshotBackupHandler::backup_name("billing.invoices", at),
            "billing.invoices_backup_20240309140507"
        );
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("table_snapshot".parse::<BackupStrategy>().unwrap(), BackupStrategy::TableSnapshot);
        assert_eq!("Column-Only".parse::<BackupStrategy>().unwrap(), BackupStrategy::ColumnOnly);
        assert!("tape".parse::<BackupStrategy>().is_err());
    }

    #[tokio::test]
    async fn test_column_backup_keys_by_primary_key() {
        let catalog = Arc::new(ScriptedCatalog::new().with_primary_key("users", &["id"]));
        let executor = Arc::new(RecordingExecutor::new().with_scalar(42));
        let handler = ColumnOnlyBackupHandler::new(catalog, executor.clone());
        let ctx = OperationContext::default();

        let info = assert_ok!(handler.create_backup(&ctx, "users", "email").await);

        assert_eq!(info.size, 42);
        assert_eq!(info.key_columns, vec!["id"]);
        assert!(!info.uses_row_identity);
        let created = executor.committed();
        assert!(created[0].starts_with("CREATE TABLE \"users__email_backup_"));
        assert!(created[0].ends_with("AS SELECT \"id\", \"email\" FROM \"users\""));
        assert_eq!(
            handler.restore_statements(&info)[0],
            format!(
                "UPDATE \"users\" AS t SET \"email\" = b.\"email\" FROM \"{}\" AS b WHERE t.\"id\" = b.\"id\"",
                info.location
            )
        );
    }

    #[tokio::test]
    async fn test_backup_without_primary_key_uses_row_identity() {
        let catalog = Arc::new(ScriptedCatalog::new());
        let executor = Arc::new(RecordingExecutor::new());
        let handler = TableSnapshotBackupHandler::new(catalog, executor.clone());
        let ctx = OperationContext::default();

        let info = assert_ok!(handler.create_backup(&ctx, "events", "payload").await);

        assert!(info.uses_row_identity);
        assert!(executor.committed()[0].contains("SELECT ctid AS \"backup_row_id\", * FROM \"events\""));
        assert!(handler.restore_statements(&info)[0].contains("t.ctid = b.\"backup_row_id\""));
    }

    #[tokio::test]
    async fn test_cleanup_twice_never_fails() {
        let catalog = Arc::new(ScriptedCatalog::new().with_primary_key("users", &["id"]));
        let executor = Arc::new(RecordingExecutor::new());
        let handler = ColumnOnlyBackupHandler::new(catalog, executor.clone());
        let ctx = OperationContext::default();
        let info = assert_ok!(handler.create_backup(&ctx, "users", "email").await);

        let first = handler.cleanup_backup(&ctx, &info).await;
        let second = handler.cleanup_backup(&ctx, &info).await;

        assert!(first.success);
        assert!(second.success);
        assert_eq!(executor.committed_containing("DROP TABLE IF EXISTS").len(), 2);
    }

    #[tokio::test]
    async fn test_failed_cleanup_is_reported_not_raised() {
        let catalog = Arc::new(ScriptedCatalog::new().with_primary_key("users", &["id"]));
        let executor = Arc::new(RecordingExecutor::failing_on("DROP TABLE"));
        let handler = ColumnOnlyBackupHandler::new(catalog, executor);
        let ctx = OperationContext::default();
        let info = assert_ok!(handler.create_backup(&ctx, "users", "email").await);

        let result = handler.cleanup_backup(&ctx, &info).await;
        assert!(!result.success);
        assert!(result.message.contains("Failed to drop backup"));
    }
}
