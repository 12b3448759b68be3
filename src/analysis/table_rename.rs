//! Table Rename Analyzer
//!
//! Table-scoped counterpart of the column analyzer: finds every object that
//! has to be rewritten or recreated when a table changes its name, and
//! arranges them in a small dependency graph.

use crate::context::OperationContext;
use crate::db::queries::{find_injection_pattern, validate_identifier};
use crate::db::{CatalogClient, ForeignKeyRow, ReferentialAction};
use crate::error::AppResult;
use crate::schema::{ImpactLevel, ObjectKind, RiskLevel, SchemaObject};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, instrument};

/// A schema object affected by a table rename
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameDependency {
    #[serde(flatten)]
    pub object: SchemaObject,
    /// Definition text names the table and must be rewritten
    pub requires_sql_rewrite: bool,
    /// Present for foreign keys, needed to recreate them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<ForeignKeyRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphNodeKind {
    Table,
    Object(ObjectKind),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub name: String,
    pub kind: GraphNodeKind,
    pub impact_level: Option<ImpactLevel>,
}

/// Arena graph over discovered objects. An edge `a -> b` means `a` depends on `b`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    edges: Vec<Vec<usize>>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    fn key(kind: GraphNodeKind, name: &str) -> String {
        match kind {
            GraphNodeKind::Table => format!("table:{}", name),
            GraphNodeKind::Object(k) => format!("{:?}:{}", k, name),
        }
    }

    pub fn add_node(&mut self, name: &str, kind: GraphNodeKind, impact_level: Option<ImpactLevel>) -> usize {
        let key = Self::key(kind, name);
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(GraphNode {
            name: name.to_string(),
            kind,
            impact_level,
        });
        self.edges.push(Vec::new());
        self.index.insert(key, id);
        id
    }

    pub fn add_edge(&mut self, from: usize, to: usize) {
        if !self.edges[from].contains(&to) {
            self.edges[from].push(to);
        }
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn edge_count(&self) -> usize {
        self.edges.iter().map(Vec::len).sum()
    }

    pub fn get_critical_dependencies(&self) -> Vec<&GraphNode> {
        self.nodes
            .iter()
            .filter(|n| n.impact_level == Some(ImpactLevel::Critical))
            .collect()
    }

    /// Iterative three-colour DFS
    pub fn has_circular_dependencies(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }

        let mut marks = vec![Mark::White; self.nodes.len()];
        for start in 0..self.nodes.len() {
            if marks[start] != Mark::White {
                continue;
            }
            let mut stack = vec![(start, 0usize)];
            marks[start] = Mark::Grey;
            while let Some((node, next)) = stack.pop() {
                if let Some(&child) = self.edges[node].get(next) {
                    stack.push((node, next + 1));
                    match marks[child] {
                        Mark::Grey => return true,
                        Mark::White => {
                            marks[child] = Mark::Grey;
                            stack.push((child, 0));
                        }
                        Mark::Black => {}
                    }
                } else {
                    marks[node] = Mark::Black;
                }
            }
        }
        false
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRenameReport {
    pub old_name: String,
    pub new_name: String,
    pub table_exists: bool,
    pub schema_objects: Vec<RenameDependency>,
    pub dependency_graph: DependencyGraph,
    pub overall_risk: RiskLevel,
    pub analyzed_at: DateTime<Utc>,
}

impl TableRenameReport {
    pub fn total_count(&self) -> usize {
        self.schema_objects.len()
    }

    pub fn of_kind(&self, kind: ObjectKind) -> impl Iterator<Item = &RenameDependency> {
        self.schema_objects.iter().filter(move |d| d.object.kind == kind)
    }

    pub fn objects_requiring_rewrite(&self) -> Vec<&RenameDependency> {
        self.schema_objects.iter().filter(|d| d.requires_sql_rewrite).collect()
    }

    pub fn count_by_kind(&self) -> BTreeMap<ObjectKind, usize> {
        let mut counts = BTreeMap::new();
        for dep in &self.schema_objects {
            *counts.entry(dep.object.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn critical_dependencies(&self) -> Vec<&SchemaObject> {
        self.schema_objects
            .iter()
            .map(|d| &d.object)
            .filter(|o| o.impact_level == ImpactLevel::Critical)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct TableRenameAnalyzer {
    catalog: Arc<dyn CatalogClient>,
}

impl TableRenameAnalyzer {
    pub fn new(catalog: Arc<dyn CatalogClient>) -> Self {
        Self { catalog }
    }

    /// Inspect names without touching the database. Never fails.
    pub fn validate_rename_operation(old_name: &str, new_name: &str) -> RenameValidation {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for (label, name) in [("Old", old_name), ("New", new_name)] {
            if name.trim().is_empty() {
                errors.push(format!("{} table name must not be empty", label));
                continue;
            }
            if let Some((pattern, what)) = find_injection_pattern(name) {
                errors.push(format!(
                    "{} table name contains a {} ('{}')",
                    label,
                    what,
                    pattern.escape_debug()
                ));
                continue;
            }
            if let Err(e) = validate_identifier(name) {
                errors.push(e.to_string());
            }
        }

        if errors.is_empty() {
            if old_name == new_name {
                errors.push("Old and new table names are identical".to_string());
            } else if old_name.eq_ignore_ascii_case(new_name) {
                warnings.push("Names differ only by case; unquoted SQL folds them together".to_string());
            }
            if new_name.chars().any(|c| c.is_ascii_uppercase()) {
                warnings.push(format!("'{}' contains uppercase letters and must always be quoted", new_name));
            }
        }

        RenameValidation {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Everything that must change for `old_name -> new_name` to be safe.
    ///
    /// A table that does not exist yields an empty `Safe` report.
    #[instrument(skip(self, ctx), fields(operation_id = %ctx.operation_id))]
    pub async fn analyze_table_rename(
        &self,
        ctx: &OperationContext,
        old_name: &str,
        new_name: &str,
    ) -> AppResult<TableRenameReport> {
        validate_identifier(old_name)?;
        validate_identifier(new_name)?;

        info!("🔍 Analyzing rename {} -> {}", old_name, new_name);

        let exists = ctx
            .catalog("table_exists", self.catalog.table_exists(old_name))
            .await?;
        if !exists {
            info!("Table {} does not exist; nothing depends on it", old_name);
            return Ok(TableRenameReport {
                old_name: old_name.to_string(),
                new_name: new_name.to_string(),
                table_exists: false,
                schema_objects: Vec::new(),
                dependency_graph: DependencyGraph::default(),
                overall_risk: RiskLevel::Safe,
                analyzed_at: Utc::now(),
            });
        }

        let (foreign_keys, views, triggers, indexes) = tokio::try_join!(
            ctx.catalog("foreign_keys_referencing", self.catalog.foreign_keys_referencing(old_name, None)),
            ctx.catalog("views_referencing", self.catalog.views_referencing(old_name, None)),
            ctx.catalog("triggers_on", self.catalog.triggers_on(old_name, None)),
            ctx.catalog("indexes_on", self.catalog.indexes_on(old_name, None)),
        )?;

        let mut objects = Vec::new();

        for fk in foreign_keys {
            let impact = if fk.is_cascading() {
                ImpactLevel::Critical
            } else if fk.on_delete == ReferentialAction::SetNull || fk.on_update == ReferentialAction::SetNull {
                ImpactLevel::High
            } else {
                ImpactLevel::Medium
            };
            objects.push(RenameDependency {
                object: SchemaObject::new(
                    fk.constraint_name.clone(),
                    ObjectKind::ForeignKey,
                    fk.source_table.clone(),
                    fk.definition(),
                    impact,
                ),
                requires_sql_rewrite: false,
                foreign_key: Some(fk),
            });
        }

        for view in views {
            objects.push(RenameDependency {
                object: SchemaObject::new(view.name, ObjectKind::View, old_name, view.definition, ImpactLevel::High),
                requires_sql_rewrite: true,
                foreign_key: None,
            });
        }

        for trigger in triggers {
            objects.push(RenameDependency {
                object: SchemaObject::new(
                    trigger.name,
                    ObjectKind::Trigger,
                    trigger.table,
                    trigger.definition,
                    ImpactLevel::High,
                ),
                requires_sql_rewrite: true,
                foreign_key: None,
            });
        }

        for index in indexes {
            let impact = if index.is_unique {
                ImpactLevel::High
            } else {
                ImpactLevel::Medium
            };
            objects.push(RenameDependency {
                object: SchemaObject::new(index.name, ObjectKind::Index, index.table, index.definition, impact),
                requires_sql_rewrite: false,
                foreign_key: None,
            });
        }

        let dependency_graph = build_graph(old_name, &objects);
        let mut overall_risk = RiskLevel::from_impacts(objects.iter().map(|d| d.object.impact_level));
        if dependency_graph.has_circular_dependencies() {
            overall_risk = RiskLevel::Critical;
        }

        info!(
            "🔍 Rename {} -> {}: {} objects, risk {}",
            old_name,
            new_name,
            objects.len(),
            overall_risk
        );

        Ok(TableRenameReport {
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
            table_exists: true,
            schema_objects: objects,
            dependency_graph,
            overall_risk,
            analyzed_at: Utc::now(),
        })
    }
}

/// Objects depend on the renamed table; referencing tables depend on the
/// tables their keys point at, so a self-referencing key forms a cycle.
fn build_graph(table: &str, objects: &[RenameDependency]) -> DependencyGraph {
    let mut graph = DependencyGraph::default();
    let root = graph.add_node(table, GraphNodeKind::Table, None);

    for dep in objects {
        let node = graph.add_node(
            &dep.object.name,
            GraphNodeKind::Object(dep.object.kind),
            Some(dep.object.impact_level),
        );
        graph.add_edge(node, root);

        if let Some(fk) = &dep.foreign_key {
            let source = graph.add_node(&fk.source_table, GraphNodeKind::Table, None);
            let target = graph.add_node(&fk.target_table, GraphNodeKind::Table, None);
            graph.add_edge(source, node);
            graph.add_edge(source, target);
        }
    }

    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fk, ScriptedCatalog};
    use pretty_assertions::assert_eq;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_nonexistent_table_is_safe() {
        let analyzer = TableRenameAnalyzer::new(Arc::new(ScriptedCatalog::new()));
        let ctx = OperationContext::default();

        let report = assert_ok!(analyzer.analyze_table_rename(&ctx, "nonexistent_table", "new_name").await);

        assert_eq!(report.total_count(), 0);
        assert_eq!(report.overall_risk, RiskLevel::Safe);
        assert!(!report.table_exists);
    }

    #[tokio::test]
    async fn test_impact_by_referential_action() {
        let catalog = ScriptedCatalog::new()
            .with_table("users")
            .with_foreign_key(fk("orders_fk", ("orders", "user_id"), ("users", "id"), ReferentialAction::Cascade))
            .with_foreign_key(fk("audit_fk", ("audit", "user_id"), ("users", "id"), ReferentialAction::SetNull))
            .with_foreign_key(fk("notes_fk", ("notes", "user_id"), ("users", "id"), ReferentialAction::Restrict))
            .with_view("users", "active_users", "SELECT * FROM users WHERE active")
            .with_trigger("users", "users_touch", "CREATE TRIGGER users_touch BEFORE UPDATE ON users FOR EACH ROW EXECUTE FUNCTION touch()")
            .with_index("users", "users_email_idx", &["email"], true)
            .with_index("users", "users_name_idx", &["name"], false);
        let analyzer = TableRenameAnalyzer::new(Arc::new(catalog));
        let ctx = OperationContext::default();

        let report = assert_ok!(analyzer.analyze_table_rename(&ctx, "users", "accounts").await);

        let levels: Vec<(String, ImpactLevel)> = report
            .schema_objects
            .iter()
            .map(|d| (d.object.name.clone(), d.object.impact_level))
            .collect();
        assert_eq!(
            levels,
            vec![
                ("orders_fk".to_string(), ImpactLevel::Critical),
                ("audit_fk".to_string(), ImpactLevel::High),
                ("notes_fk".to_string(), ImpactLevel::Medium),
                ("active_users".to_string(), ImpactLevel::High),
                ("users_touch".to_string(), ImpactLevel::High),
                ("users_email_idx".to_string(), ImpactLevel::High),
                ("users_name_idx".to_string(), ImpactLevel::Medium),
            ]
        );
        assert_eq!(report.overall_risk, RiskLevel::Critical);
        assert_eq!(report.objects_requiring_rewrite().len(), 2);
        assert_eq!(report.count_by_kind()[&ObjectKind::ForeignKey], 3);
        assert_eq!(report.dependency_graph.get_critical_dependencies().len(), 1);
        assert!(!report.dependency_graph.has_circular_dependencies());
    }

    #[tokio::test]
    async fn test_self_referencing_key_is_circular() {
        let catalog = ScriptedCatalog::new().with_foreign_key(fk(
            "employees_manager_fk",
            ("employees", "manager_id"),
            ("employees", "id"),
            ReferentialAction::NoAction,
        ));
        let analyzer = TableRenameAnalyzer::new(Arc::new(catalog));
        let ctx = OperationContext::default();

        let report = assert_ok!(analyzer.analyze_table_rename(&ctx, "employees", "staff").await);

        assert!(report.dependency_graph.has_circular_dependencies());
        assert_eq!(report.overall_risk, RiskLevel::Critical);
    }

    #[test]
    fn test_validate_rename_operation() {
        assert!(TableRenameAnalyzer::validate_rename_operation("users", "accounts").is_valid);

        let empty = TableRenameAnalyzer::validate_rename_operation("", "accounts");
        assert!(!empty.is_valid);

        let injected = TableRenameAnalyzer::validate_rename_operation("users", "accounts; DROP TABLE users");
        assert!(!injected.is_valid);
        assert!(injected.errors[0].contains("statement terminator"));

        let same = TableRenameAnalyzer::validate_rename_operation("users", "users");
        assert!(!same.is_valid);
    }
}
