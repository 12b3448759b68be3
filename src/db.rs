//! Database collaborator contracts
//!
//! The engine never speaks a wire protocol itself. Analyzers depend on
//! [`CatalogClient`] for schema introspection and managers depend on
//! [`SqlExecutor`] for DDL. `postgres` provides the deadpool-backed
//! implementation of both.

pub mod postgres;
pub mod queries;

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Referential action for ON DELETE / ON UPDATE
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferentialAction {
    Restrict,
    Cascade,
    SetNull,
    #[default]
    NoAction,
    SetDefault,
}

impl ReferentialAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }

    /// Parse the rule text reported by `information_schema.referential_constraints`.
    /// Unknown text falls back to the SQL default, NO ACTION.
    pub fn from_catalog(rule: &str) -> Self {
        match rule.trim().to_ascii_uppercase().as_str() {
            "RESTRICT" => ReferentialAction::Restrict,
            "CASCADE" => ReferentialAction::Cascade,
            "SET NULL" => ReferentialAction::SetNull,
            "SET DEFAULT" => ReferentialAction::SetDefault,
            _ => ReferentialAction::NoAction,
        }
    }

    /// RESTRICT and NO ACTION both refuse to delete referenced rows.
    pub fn blocks_delete(&self) -> bool {
        matches!(self, ReferentialAction::Restrict | ReferentialAction::NoAction)
    }
}

impl std::fmt::Display for ReferentialAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_sql())
    }
}

/// One foreign key constraint as reported by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyRow {
    pub constraint_name: String,
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

impl ForeignKeyRow {
    pub fn is_cascading(&self) -> bool {
        self.on_delete == ReferentialAction::Cascade || self.on_update == ReferentialAction::Cascade
    }

    /// Constraint body suitable for `ALTER TABLE ... ADD CONSTRAINT name <body>`.
    pub fn definition(&self) -> String {
        format!(
            "FOREIGN KEY ({}) REFERENCES {}({}) ON DELETE {} ON UPDATE {}",
            queries::SqlBuilder::quote_ident(&self.source_column),
            queries::SqlBuilder::quote_qualified(&self.target_table),
            queries::SqlBuilder::quote_ident(&self.target_column),
            self.on_delete,
            self.on_update
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewRow {
    pub name: String,
    /// The SELECT body of the view
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRow {
    pub name: String,
    pub table: String,
    /// Full `CREATE TRIGGER` statement
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRow {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
    pub is_primary: bool,
    /// Full `CREATE INDEX` statement
    pub definition: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    Check,
    Exclusion,
}

impl ConstraintKind {
    /// Map a `pg_constraint.contype` code.
    pub fn from_pg_code(code: &str) -> Option<Self> {
        match code {
            "p" => Some(ConstraintKind::PrimaryKey),
            "u" => Some(ConstraintKind::Unique),
            "c" => Some(ConstraintKind::Check),
            "x" => Some(ConstraintKind::Exclusion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintRow {
    pub name: String,
    pub table: String,
    pub kind: ConstraintKind,
    /// Constraint body as printed by `pg_get_constraintdef`
    pub definition: String,
}

/// Catalog collaborator: answers "what references this table/column?"
///
/// Implementations are the dialect adapter boundary. Every method returns an
/// empty list, never an error, when nothing matches. Identifiers are
/// validated by the caller before they reach this trait.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn table_exists(&self, table: &str) -> AppResult<bool>;

    async fn column_data_type(&self, table: &str, column: &str) -> AppResult<Option<String>>;

    async fn primary_key_columns(&self, table: &str) -> AppResult<Vec<String>>;

    async fn list_tables(&self) -> AppResult<Vec<String>>;

    /// With a column: constraints that target the column or use it as the
    /// referencing column. Without: constraints whose target is the table.
    async fn foreign_keys_referencing(
        &self,
        table: &str,
        column: Option<&str>,
    ) -> AppResult<Vec<ForeignKeyRow>>;

    /// Views that reference the table (or the column) directly. One hop only.
    async fn views_referencing(&self, table: &str, column: Option<&str>) -> AppResult<Vec<ViewRow>>;

    async fn triggers_on(&self, table: &str, column: Option<&str>) -> AppResult<Vec<TriggerRow>>;

    async fn indexes_on(&self, table: &str, column: Option<&str>) -> AppResult<Vec<IndexRow>>;

    async fn constraints_on(&self, table: &str, column: Option<&str>) -> AppResult<Vec<ConstraintRow>>;
}

/// DDL collaborator
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Execute one statement in autocommit mode; returns affected rows.
    async fn execute(&self, sql: &str) -> AppResult<u64>;

    /// Execute all statements in one transaction. Either every statement
    /// commits or the transaction is rolled back and
    /// `AppError::StatementFailed` names the failing statement.
    async fn execute_in_transaction(&self, statements: &[String]) -> AppResult<u64>;

    /// First column of the first row, as an integer.
    async fn query_scalar(&self, sql: &str) -> AppResult<i64>;
}
