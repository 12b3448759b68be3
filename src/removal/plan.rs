//! Removal plan types
//!
//! A plan is built once from a `DependencyReport` and never mutated by the
//! execution pipeline; each executed stage produces a `RemovalStageResult`.

use super::backup::{BackupInfo, BackupStrategy};
use crate::schema::{DependencyReport, ObjectKind, RiskLevel, SchemaObject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Execution stages in their fixed relative order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalStage {
    BackupCreation,
    DependentObjects,
    ConstraintRemoval,
    IndexRemoval,
    ColumnRemoval,
    Cleanup,
    Validation,
}

impl RemovalStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalStage::BackupCreation => "backup_creation",
            RemovalStage::DependentObjects => "dependent_objects",
            RemovalStage::ConstraintRemoval => "constraint_removal",
            RemovalStage::IndexRemoval => "index_removal",
            RemovalStage::ColumnRemoval => "column_removal",
            RemovalStage::Cleanup => "cleanup",
            RemovalStage::Validation => "validation",
        }
    }

    /// Stages needed for `report`, in execution order.
    pub fn plan_for(report: &DependencyReport) -> Vec<RemovalStage> {
        let has = |kind| !report.of_kind(kind).is_empty();

        let mut stages = vec![RemovalStage::BackupCreation];
        if has(ObjectKind::View) || has(ObjectKind::Trigger) {
            stages.push(RemovalStage::DependentObjects);
        }
        if has(ObjectKind::ForeignKey) || has(ObjectKind::Constraint) {
            stages.push(RemovalStage::ConstraintRemoval);
        }
        if has(ObjectKind::Index) {
            stages.push(RemovalStage::IndexRemoval);
        }
        stages.extend([RemovalStage::ColumnRemoval, RemovalStage::Cleanup, RemovalStage::Validation]);
        stages
    }
}

impl fmt::Display for RemovalStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied knobs for planning
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemovalOptions {
    /// Falls back to the engine default when unset
    pub backup_strategy: Option<BackupStrategy>,
    pub dry_run: bool,
    pub disable_rollback: bool,
    pub keep_backup: bool,
    /// Force confirmation even for low-risk plans
    pub require_confirmation: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalPlan {
    pub table: String,
    pub column: String,
    /// Type at planning time, used to re-add the column on rollback
    pub column_data_type: String,
    pub dependencies: DependencyReport,
    pub execution_stages: Vec<RemovalStage>,
    pub backup_strategy: BackupStrategy,
    pub confirmation_required: bool,
    pub dry_run: bool,
    pub enable_rollback: bool,
    pub keep_backup: bool,
    pub estimated_duration: Duration,
    pub created_at: DateTime<Utc>,
}

impl RemovalPlan {
    /// Fixed base plus a fixed weight per dependent object and per stage.
    /// For display only.
    pub fn estimate_duration(report: &DependencyReport, stages: &[RemovalStage]) -> Duration {
        let base = Duration::from_secs(5);
        let per_stage = Duration::from_secs(1) * stages.len() as u32;
        let per_object: Duration = report
            .all()
            .map(|o| match o.kind {
                ObjectKind::ForeignKey => Duration::from_secs(3),
                ObjectKind::View => Duration::from_secs(2),
                ObjectKind::Trigger => Duration::from_secs(2),
                ObjectKind::Index => Duration::from_secs(4),
                ObjectKind::Constraint => Duration::from_secs(3),
            })
            .sum();
        base + per_stage + per_object
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalStageResult {
    pub stage: RemovalStage,
    pub success: bool,
    pub duration: Duration,
    pub objects_affected: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Whatever is needed to undo the stage (definitions, backup info)
    pub rollback_data: serde_json::Value,
}

impl RemovalStageResult {
    pub fn new(stage: RemovalStage) -> Self {
        Self {
            stage,
            success: true,
            duration: Duration::ZERO,
            objects_affected: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            rollback_data: serde_json::Value::Null,
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.success = false;
        self.errors.push(error.into());
    }
}

/// Outcome of executing a whole plan
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalResult {
    pub table: String,
    pub column: String,
    pub success: bool,
    pub dry_run: bool,
    pub stage_results: Vec<RemovalStageResult>,
    pub failed_stage: Option<RemovalStage>,
    pub backup: Option<BackupInfo>,
    /// False once cleanup has dropped the backup
    pub backup_retained: bool,
    pub recovery_instructions: Vec<String>,
    pub total_duration: Duration,
}

impl RemovalResult {
    pub fn completed_stages(&self) -> Vec<RemovalStage> {
        self.stage_results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.stage)
            .collect()
    }

    pub fn stage(&self, stage: RemovalStage) -> Option<&RemovalStageResult> {
        self.stage_results.iter().find(|r| r.stage == stage)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalSafetyValidation {
    pub table: String,
    pub column: String,
    pub is_safe: bool,
    pub risk_level: RiskLevel,
    pub total_dependencies: usize,
    pub blocking_dependencies: Vec<SchemaObject>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
    pub requires_confirmation: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalRollbackResult {
    pub success: bool,
    pub statements: Vec<String>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ImpactLevel;
    use pretty_assertions::assert_eq;

    fn report_with(kinds: &[ObjectKind]) -> DependencyReport {
        let mut report = DependencyReport::new("users", "email");
        for (i, kind) in kinds.iter().enumerate() {
            report.insert(
                *kind,
                vec![SchemaObject::new(format!("obj{}", i), *kind, "users", "", ImpactLevel::Medium)],
            );
        }
        report
    }

    #[test]
    fn test_minimal_plan_keeps_fixed_stages() {
        let stages = RemovalStage::plan_for(&report_with(&[]));
        assert_eq!(
            stages,
            vec![
                RemovalStage::BackupCreation,
                RemovalStage::ColumnRemoval,
                RemovalStage::Cleanup,
                RemovalStage::Validation,
            ]
        );
    }

    #[test]
    fn test_stage_order_is_invariant() {
        let all = [
            ObjectKind::Index,
            ObjectKind::Trigger,
            ObjectKind::ForeignKey,
            ObjectKind::View,
            ObjectKind::Constraint,
        ];
        let stages = RemovalStage::plan_for(&report_with(&all));

        assert_eq!(stages.first(), Some(&RemovalStage::BackupCreation));
        assert_eq!(stages.last(), Some(&RemovalStage::Validation));
        assert!(stages.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(stages.len(), 7);
    }

    #[test]
    fn test_index_only_plan_skips_other_stages() {
        let stages = RemovalStage::plan_for(&report_with(&[ObjectKind::Index]));
        assert!(stages.contains(&RemovalStage::IndexRemoval));
        assert!(!stages.contains(&RemovalStage::ConstraintRemoval));
        assert!(!stages.contains(&RemovalStage::DependentObjects));
    }

    #[test]
    fn test_duration_estimate_is_additive() {
        let empty = report_with(&[]);
        let stages = RemovalStage::plan_for(&empty);
        assert_eq!(RemovalPlan::estimate_duration(&empty, &stages), Duration::from_secs(9));

        let indexed = report_with(&[ObjectKind::Index]);
        let stages = RemovalStage::plan_for(&indexed);
        assert_eq!(RemovalPlan::estimate_duration(&indexed, &stages), Duration::from_secs(14));
    }
}
