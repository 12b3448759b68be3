//! PostgreSQL implementation of the catalog and DDL collaborators

use super::queries::{self, split_qualified};
use super::{
    CatalogClient, ConstraintKind, ConstraintRow, ForeignKeyRow, IndexRow, ReferentialAction,
    SqlExecutor, TriggerRow, ViewRow,
};
use crate::config::DatabaseConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::{debug, info};

/// Catalog + executor backed by a deadpool connection pool
#[derive(Clone)]
pub struct PgDatabase {
    pool: Pool,
}

impl PgDatabase {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool from configuration and verify it with a round trip.
    pub async fn connect(config: &DatabaseConfig) -> AppResult<Self> {
        let pool = create_pool(config, &config.database)?;

        let client = pool
            .get()
            .await
            .map_err(|e| AppError::Connection(format!("Failed to get pool connection: {}", e)))?;
        client
            .query_one("SELECT 1 AS ok", &[])
            .await
            .map_err(|e| AppError::Connection(format!("Failed to verify database connection: {}", e)))?;

        info!("✅ Database connection successful (TLS: {})", config.require_tls);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn client(&self) -> AppResult<deadpool_postgres::Client> {
        self.pool
            .get()
            .await
            .map_err(|e| AppError::Connection(format!("Database pool error: {}", e)))
    }
}

/// Create a pool for `database` using the connection settings in `config`.
pub fn create_pool(config: &DatabaseConfig, database: &str) -> AppResult<Pool> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.dbname = Some(database.to_string());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_pool_size));

    if config.require_tls {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
        cfg.create_pool(Some(Runtime::Tokio1), tls)
            .map_err(|e| AppError::Config(format!("Failed to create TLS pool: {}", e)))
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| AppError::Config(format!("Failed to create pool: {}", e)))
    }
}

/// Closed connections are connection failures; everything else is a query error.
pub(crate) fn map_pg_error(e: tokio_postgres::Error) -> AppError {
    if e.is_closed() {
        AppError::Connection(e.to_string())
    } else {
        AppError::Database(e)
    }
}

#[async_trait]
impl CatalogClient for PgDatabase {
    async fn table_exists(&self, table: &str) -> AppResult<bool> {
        let (schema, name) = split_qualified(table);
        let client = self.client().await?;
        let row = client
            .query_one(queries::TABLE_EXISTS, &[&schema, &name])
            .await
            .map_err(map_pg_error)?;
        Ok(row.get("table_exists"))
    }

    async fn column_data_type(&self, table: &str, column: &str) -> AppResult<Option<String>> {
        let (schema, name) = split_qualified(table);
        let client = self.client().await?;
        let row = client
            .query_opt(queries::COLUMN_DATA_TYPE, &[&schema, &name, &column])
            .await
            .map_err(map_pg_error)?;
        Ok(row.map(|r| r.get("data_type")))
    }

    async fn primary_key_columns(&self, table: &str) -> AppResult<Vec<String>> {
        let (schema, name) = split_qualified(table);
        let client = self.client().await?;
        let rows = client
            .query(queries::GET_PRIMARY_KEYS, &[&schema, &name])
            .await
            .map_err(map_pg_error)?;
        Ok(rows.iter().map(|r| r.get("column_name")).collect())
    }

    async fn list_tables(&self) -> AppResult<Vec<String>> {
        let client = self.client().await?;
        let rows = client.query(queries::LIST_TABLES, &[]).await.map_err(map_pg_error)?;
        Ok(rows.iter().map(|r| r.get("name")).collect())
    }

    async fn foreign_keys_referencing(
        &self,
        table: &str,
        column: Option<&str>,
    ) -> AppResult<Vec<ForeignKeyRow>> {
        let (schema, name) = split_qualified(table);
        let client = self.client().await?;
        let rows = client
            .query(queries::FOREIGN_KEYS_REFERENCING, &[&schema, &name, &column])
            .await
            .map_err(map_pg_error)?;

        debug!("Found {} foreign keys referencing {}", rows.len(), table);

        Ok(rows
            .iter()
            .map(|row| ForeignKeyRow {
                constraint_name: row.get("constraint_name"),
                source_table: row.get("source_table"),
                source_column: row.get("source_column"),
                target_table: row.get("target_table"),
                target_column: row.get("target_column"),
                on_delete: ReferentialAction::from_catalog(row.get("on_delete")),
                on_update: ReferentialAction::from_catalog(row.get("on_update")),
            })
            .collect())
    }

    async fn views_referencing(&self, table: &str, column: Option<&str>) -> AppResult<Vec<ViewRow>> {
        let (schema, name) = split_qualified(table);
        let client = self.client().await?;
        let rows = match column {
            Some(column) => client
                .query(queries::VIEWS_FOR_COLUMN, &[&schema, &name, &column])
                .await,
            None => client.query(queries::VIEWS_FOR_TABLE, &[&schema, &name]).await,
        }
        .map_err(map_pg_error)?;

        Ok(rows
            .iter()
            .map(|row| ViewRow {
                name: row.get("view_name"),
                definition: row.get("definition"),
            })
            .collect())
    }

    async fn triggers_on(&self, table: &str, column: Option<&str>) -> AppResult<Vec<TriggerRow>> {
        let (schema, name) = split_qualified(table);
        let client = self.client().await?;
        let rows = client
            .query(queries::TRIGGERS_ON, &[&schema, &name, &column])
            .await
            .map_err(map_pg_error)?;

        Ok(rows
            .iter()
            .map(|row| TriggerRow {
                name: row.get("trigger_name"),
                table: row.get("table_name"),
                definition: row.get("definition"),
            })
            .collect())
    }

    async fn indexes_on(&self, table: &str, column: Option<&str>) -> AppResult<Vec<IndexRow>> {
        let (schema, name) = split_qualified(table);
        let client = self.client().await?;
        let rows = client
            .query(queries::INDEXES_ON, &[&schema, &name, &column])
            .await
            .map_err(map_pg_error)?;

        Ok(rows
            .iter()
            .map(|row| IndexRow {
                name: row.get("index_name"),
                table: row.get("table_name"),
                columns: row.try_get("columns").unwrap_or_default(),
                is_unique: row.get("is_unique"),
                is_primary: row.get("is_primary"),
                definition: row.get("definition"),
            })
            .collect())
    }

    async fn constraints_on(&self, table: &str, column: Option<&str>) -> AppResult<Vec<ConstraintRow>> {
        let (schema, name) = split_qualified(table);
        let client = self.client().await?;
        let rows = client
            .query(queries::CONSTRAINTS_ON, &[&schema, &name, &column])
            .await
            .map_err(map_pg_error)?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let code: String = row.get("contype");
                ConstraintKind::from_pg_code(&code).map(|kind| ConstraintRow {
                    name: row.get("constraint_name"),
                    table: row.get("table_name"),
                    kind,
                    definition: row.get("definition"),
                })
            })
            .collect())
    }
}

#[async_trait]
impl SqlExecutor for PgDatabase {
    async fn execute(&self, sql: &str) -> AppResult<u64> {
        let client = self.client().await?;
        client.execute(sql, &[]).await.map_err(map_pg_error)
    }

    async fn execute_in_transaction(&self, statements: &[String]) -> AppResult<u64> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(map_pg_error)?;

        let mut affected = 0;
        for (index, statement) in statements.iter().enumerate() {
            match tx.execute(statement.as_str(), &[]).await {
                Ok(rows) => affected += rows,
                Err(e) => {
                    let message = e.to_string();
                    if let Err(rollback_err) = tx.rollback().await {
                        debug!("Rollback after failed statement also failed: {}", rollback_err);
                    }
                    return Err(AppError::StatementFailed {
                        index,
                        statement: statement.clone(),
                        message,
                    });
                }
            }
        }

        tx.commit().await.map_err(map_pg_error)?;
        Ok(affected)
    }

    async fn query_scalar(&self, sql: &str) -> AppResult<i64> {
        let client = self.client().await?;
        let row = client.query_one(sql, &[]).await.map_err(map_pg_error)?;
        row.try_get::<_, i64>(0).map_err(map_pg_error)
    }
}
