//! Column Dependency Analyzer
//!
//! "What references this column?"
//! Collects every foreign key, view, trigger, index and constraint that
//! touches one column and tags each with a fixed impact level:
//!
//! | kind                    | impact   |
//! |-------------------------|----------|
//! | foreign key             | CRITICAL |
//! | view, trigger           | HIGH     |
//! | primary key constraint  | HIGH     |
//! | index, other constraint | MEDIUM   |
//!
//! View discovery is one hop: a view built on top of another view that
//! reads the column is not reported.

use crate::context::OperationContext;
use crate::db::queries::validate_identifier;
use crate::db::{CatalogClient, ConstraintKind};
use crate::error::AppResult;
use crate::schema::{DependencyReport, ImpactLevel, ObjectKind, SchemaObject};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Finds everything that depends on a single column
#[derive(Clone)]
pub struct DependencyAnalyzer {
    catalog: Arc<dyn CatalogClient>,
}

impl DependencyAnalyzer {
    pub fn new(catalog: Arc<dyn CatalogClient>) -> Self {
        Self { catalog }
    }

    /// Run all five finders and group the results by kind.
    ///
    /// Fails with `AppError::Connection` when the catalog is unreachable and
    /// with `AppError::QueryParsing` for malformed identifiers.
    #[instrument(skip(self, ctx), fields(operation_id = %ctx.operation_id))]
    pub async fn analyze_column_dependencies(
        &self,
        ctx: &OperationContext,
        table: &str,
        column: &str,
    ) -> AppResult<DependencyReport> {
        validate_target(table, column)?;
        info!("🔍 Analyzing dependencies of {}.{}", table, column);

        let (foreign_keys, views, triggers, indexes, constraints) = tokio::try_join!(
            self.find_foreign_key_dependencies(ctx, table, column),
            self.find_view_dependencies(ctx, table, column),
            self.find_trigger_dependencies(ctx, table, column),
            self.find_index_dependencies(ctx, table, column),
            self.find_constraint_dependencies(ctx, table, column),
        )?;

        let mut report = DependencyReport::new(table, column);
        report.insert(ObjectKind::ForeignKey, foreign_keys);
        report.insert(ObjectKind::View, views);
        report.insert(ObjectKind::Trigger, triggers);
        report.insert(ObjectKind::Index, indexes);
        report.insert(ObjectKind::Constraint, constraints);

        info!(
            "🔍 {}.{}: {} dependencies, overall risk {}",
            table,
            column,
            report.total_count(),
            report.overall_risk()
        );

        Ok(report)
    }

    /// Foreign keys that target the column or use it as their referencing column
    pub async fn find_foreign_key_dependencies(
        &self,
        ctx: &OperationContext,
        table: &str,
        column: &str,
    ) -> AppResult<Vec<SchemaObject>> {
        validate_target(table, column)?;
        let rows = ctx
            .catalog(
                "foreign_keys_referencing",
                self.catalog.foreign_keys_referencing(table, Some(column)),
            )
            .await?;
        debug!("{} foreign keys touch {}.{}", rows.len(), table, column);

        Ok(rows
            .into_iter()
            .map(|fk| {
                let definition = fk.definition();
                SchemaObject::new(
                    fk.constraint_name,
                    ObjectKind::ForeignKey,
                    fk.source_table,
                    definition,
                    ImpactLevel::Critical,
                )
            })
            .collect())
    }

    pub async fn find_view_dependencies(
        &self,
        ctx: &OperationContext,
        table: &str,
        column: &str,
    ) -> AppResult<Vec<SchemaObject>> {
        validate_target(table, column)?;
        let rows = ctx
            .catalog("views_referencing", self.catalog.views_referencing(table, Some(column)))
            .await?;

        Ok(rows
            .into_iter()
            .map(|view| SchemaObject::new(view.name, ObjectKind::View, table, view.definition, ImpactLevel::High))
            .collect())
    }

    pub async fn find_trigger_dependencies(
        &self,
        ctx: &OperationContext,
        table: &str,
        column: &str,
    ) -> AppResult<Vec<SchemaObject>> {
        validate_target(table, column)?;
        let rows = ctx
            .catalog("triggers_on", self.catalog.triggers_on(table, Some(column)))
            .await?;

        Ok(rows
            .into_iter()
            .map(|t| SchemaObject::new(t.name, ObjectKind::Trigger, t.table, t.definition, ImpactLevel::High))
            .collect())
    }

    pub async fn find_index_dependencies(
        &self,
        ctx: &OperationContext,
        table: &str,
        column: &str,
    ) -> AppResult<Vec<SchemaObject>> {
        validate_target(table, column)?;
        let rows = ctx
            .catalog("indexes_on", self.catalog.indexes_on(table, Some(column)))
            .await?;

        Ok(rows
            .into_iter()
            .map(|idx| SchemaObject::new(idx.name, ObjectKind::Index, idx.table, idx.definition, ImpactLevel::Medium))
            .collect())
    }

    pub async fn find_constraint_dependencies(
        &self,
        ctx: &OperationContext,
        table: &str,
        column: &str,
    ) -> AppResult<Vec<SchemaObject>> {
        validate_target(table, column)?;
        let rows = ctx
            .catalog("constraints_on", self.catalog.constraints_on(table, Some(column)))
            .await?;

        Ok(rows
            .into_iter()
            .map(|c| {
                let impact = match c.kind {
                    ConstraintKind::PrimaryKey => ImpactLevel::High,
                    _ => ImpactLevel::Medium,
                };
                SchemaObject::new(c.name, ObjectKind::Constraint, c.table, c.definition, impact)
            })
            .collect())
    }
}

fn validate_target(table: &str, column: &str) -> AppResult<()> {
    validate_identifier(table)?;
    validate_identifier(column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ReferentialAction;
    use crate::error::AppError;
    use crate::schema::{RemovalRecommendation, RiskLevel};
    use crate::testing::{fk, ScriptedCatalog};
    use pretty_assertions::assert_eq;
    use tokio_test::assert_ok;

    fn users_catalog() -> ScriptedCatalog {
        ScriptedCatalog::new()
            .with_column("users", "id", "integer")
            .with_foreign_key(fk("orders_user_id_fkey", ("orders", "user_id"), ("users", "id"), ReferentialAction::Cascade))
            .with_view("users", "user_summary", "SELECT id, email FROM users")
            .with_index("users", "users_email_key", &["email"], true)
    }

    #[tokio::test]
    async fn test_users_id_with_cascade_is_critical() {
        let analyzer = DependencyAnalyzer::new(Arc::new(users_catalog()));
        let ctx = OperationContext::default();

        let report = assert_ok!(analyzer.analyze_column_dependencies(&ctx, "users", "id").await);

        assert_eq!(report.total_count(), 3);
        assert_eq!(report.overall_risk(), RiskLevel::Critical);
        assert_eq!(report.get_removal_recommendation(), RemovalRecommendation::Dangerous);
        assert_eq!(report.of_kind(ObjectKind::ForeignKey)[0].table, "orders");
        assert_eq!(report.of_kind(ObjectKind::View)[0].impact_level, ImpactLevel::High);
        assert_eq!(report.of_kind(ObjectKind::Index)[0].impact_level, ImpactLevel::Medium);
    }

    #[tokio::test]
    async fn test_column_without_dependencies_is_safe() {
        let catalog = ScriptedCatalog::new().with_column("users", "nickname", "text");
        let analyzer = DependencyAnalyzer::new(Arc::new(catalog));
        let ctx = OperationContext::default();

        let report = assert_ok!(analyzer.analyze_column_dependencies(&ctx, "users", "nickname").await);

        assert!(!report.has_dependencies());
        assert!(report.get_removal_recommendation() == "SAFE");
    }

    #[tokio::test]
    async fn test_finders_return_empty_lists_for_unknown_tables() {
        let analyzer = DependencyAnalyzer::new(Arc::new(ScriptedCatalog::new()));
        let ctx = OperationContext::default();

        assert!(assert_ok!(analyzer.find_view_dependencies(&ctx, "ghost", "id").await).is_empty());
        assert!(assert_ok!(analyzer.find_trigger_dependencies(&ctx, "ghost", "id").await).is_empty());
    }

    #[tokio::test]
    async fn test_primary_key_constraint_is_high() {
        let catalog = ScriptedCatalog::new()
            .with_constraint("users", "users_pkey", ConstraintKind::PrimaryKey, "PRIMARY KEY (id)")
            .with_constraint("users", "users_age_check", ConstraintKind::Check, "CHECK (age > 0)");
        let analyzer = DependencyAnalyzer::new(Arc::new(catalog));
        let ctx = OperationContext::default();

        let found = assert_ok!(analyzer.find_constraint_dependencies(&ctx, "users", "id").await);
        let levels: Vec<ImpactLevel> = found.iter().map(|o| o.impact_level).collect();
        assert_eq!(levels, vec![ImpactLevel::High, ImpactLevel::Medium]);
    }

    #[tokio::test]
    async fn test_unreachable_catalog_is_connection_error() {
        let analyzer = DependencyAnalyzer::new(Arc::new(ScriptedCatalog::unreachable()));
        let ctx = OperationContext::default();

        let result = analyzer.analyze_column_dependencies(&ctx, "users", "id").await;
        assert!(matches!(result, Err(AppError::Connection(_))));
    }

    #[tokio::test]
    async fn test_malformed_identifier_rejected_before_io() {
        let analyzer = DependencyAnalyzer::new(Arc::new(ScriptedCatalog::unreachable()));
        let ctx = OperationContext::default();

        let result = analyzer
            .analyze_column_dependencies(&ctx, "users; DROP TABLE users", "id")
            .await;
        assert!(matches!(result, Err(AppError::QueryParsing(_))));
    }
}
