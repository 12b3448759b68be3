//! PostgreSQL staging backend
//!
//! Databases are created and dropped through an admin pool on the configured
//! maintenance database. Schema is replicated column by column from the
//! catalog, with primary keys but without views, triggers or secondary
//! indexes. Samples are streamed with `COPY ... TO STDOUT` piped into
//! `COPY ... FROM STDIN` so rows never materialize in memory.

use super::{StagingBackend, TableDdl};
use crate::config::DatabaseConfig;
use crate::db::postgres::{create_pool, map_pg_error, PgDatabase};
use crate::db::queries::{self, split_qualified, SqlBuilder, DEFAULT_SCHEMA};
use crate::db::SqlExecutor;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use futures::{pin_mut, SinkExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, info};

const DATABASE_EXISTS: &str = "SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1) AS database_exists";

pub struct PgStagingBackend {
    config: DatabaseConfig,
    admin: Pool,
}

impl PgStagingBackend {
    pub fn new(config: DatabaseConfig) -> AppResult<Self> {
        let admin = create_pool(&config, &config.database)?;
        Ok(Self { config, admin })
    }

    async fn client_for(&self, database: &str) -> AppResult<deadpool_postgres::Client> {
        create_pool(&self.config, database)?
            .get()
            .await
            .map_err(|e| AppError::Connection(format!("Failed to connect to {}: {}", database, e)))
    }

    async fn admin_client(&self) -> AppResult<deadpool_postgres::Client> {
        self.admin
            .get()
            .await
            .map_err(|e| AppError::Connection(format!("Admin pool error: {}", e)))
    }
}

#[async_trait]
impl StagingBackend for PgStagingBackend {
    async fn create_database(&self, name: &str) -> AppResult<()> {
        let client = self.admin_client().await?;
        // CREATE DATABASE cannot run inside a transaction block
        client
            .batch_execute(&SqlBuilder::create_database(name))
            .await
            .map_err(map_pg_error)?;
        info!("Created database {}", name);
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> AppResult<bool> {
        let client = self.admin_client().await?;
        let exists: bool = client
            .query_one(DATABASE_EXISTS, &[&name])
            .await
            .map_err(map_pg_error)?
            .get("database_exists");
        if !exists {
            return Ok(false);
        }

        client
            .batch_execute(&format!("{} WITH (FORCE)", SqlBuilder::drop_database(name)))
            .await
            .map_err(map_pg_error)?;
        info!("Dropped database {}", name);
        Ok(true)
    }

    async fn replicate_schema(&self, production_db: &str, staging_db: &str) -> AppResult<Vec<TableDdl>> {
        let source = self.client_for(production_db).await?;
        let target = self.client_for(staging_db).await?;

        let tables: Vec<String> = source
            .query(queries::LIST_TABLES, &[])
            .await
            .map_err(map_pg_error)?
            .iter()
            .map(|r| r.get("name"))
            .collect();

        let mut replicated = Vec::with_capacity(tables.len());
        for table in tables {
            let (schema, name) = split_qualified(&table);
            let columns = source
                .query(queries::TABLE_COLUMNS_DDL, &[&schema, &name])
                .await
                .map_err(map_pg_error)?;

            let primary_key: Vec<String> = source
                .query(queries::GET_PRIMARY_KEYS, &[&schema, &name])
                .await
                .map_err(map_pg_error)?
                .iter()
                .map(|r| SqlBuilder::quote_ident(r.get("column_name")))
                .collect();

            let mut column_defs: Vec<String> = columns
                .iter()
                .map(|row| {
                    let column: String = row.get("column_name");
                    let data_type: String = row.get("data_type");
                    let not_null: bool = row.get("not_null");
                    format!(
                        "{} {}{}",
                        SqlBuilder::quote_ident(&column),
                        data_type,
                        if not_null { " NOT NULL" } else { "" }
                    )
                })
                .collect();
            // Keys are needed so recreated foreign keys have something to reference
            if !primary_key.is_empty() {
                column_defs.push(format!("PRIMARY KEY ({})", primary_key.join(", ")));
            }

            if schema != DEFAULT_SCHEMA {
                target
                    .batch_execute(&format!(
                        "CREATE SCHEMA IF NOT EXISTS {}",
                        SqlBuilder::quote_ident(schema)
                    ))
                    .await
                    .map_err(map_pg_error)?;
            }

            let ddl = format!(
                "CREATE TABLE {} ({})",
                SqlBuilder::quote_qualified(&table),
                column_defs.join(", ")
            );
            target.batch_execute(&ddl).await.map_err(map_pg_error)?;
            debug!("Replicated {}", table);

            replicated.push(TableDdl { table, ddl });
        }

        Ok(replicated)
    }

    async fn copy_sample(&self, production_db: &str, staging_db: &str, table: &str, fraction: f64) -> AppResult<u64> {
        let source = self.client_for(production_db).await?;
        let target = self.client_for(staging_db).await?;

        let copy_out = format!(
            "COPY (SELECT * FROM {} TABLESAMPLE BERNOULLI ({})) TO STDOUT",
            SqlBuilder::quote_qualified(table),
            fraction * 100.0
        );
        let copy_in = format!("COPY {} FROM STDIN", SqlBuilder::quote_qualified(table));

        let reader = source.copy_out(copy_out.as_str()).await.map_err(map_pg_error)?;
        let writer = target.copy_in(copy_in.as_str()).await.map_err(map_pg_error)?;
        pin_mut!(reader);
        pin_mut!(writer);

        while let Some(chunk) = reader.try_next().await.map_err(map_pg_error)? {
            writer.send(chunk).await.map_err(map_pg_error)?;
        }
        let rows = writer.as_mut().finish().await.map_err(map_pg_error)?;

        debug!("Copied {} sampled rows of {}", rows, table);
        Ok(rows)
    }

    async fn executor_for(&self, database: &str) -> AppResult<Arc<dyn SqlExecutor>> {
        Ok(Arc::new(PgDatabase::new(create_pool(&self.config, database)?)))
    }
}
