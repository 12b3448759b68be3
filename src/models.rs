//! Request and response DTOs for the analysis service

use crate::analysis::foreign_key::{FKImpactReport, FkMigrationPlan, IntegrityValidation};
use crate::analysis::risk::RiskAssessment;
use crate::analysis::table_rename::{RenameValidation, TableRenameReport};
use crate::removal::plan::{RemovalOptions, RemovalPlan, RemovalSafetyValidation};
use crate::rename::strategy::ZeroDowntimeStrategy;
use crate::report::ReportFormat;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Generic success envelope
#[derive(Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }
}

// ===== REQUESTS =====

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ColumnAnalysisRequest {
    #[validate(length(min = 1, max = 127, message = "Table name is required"))]
    pub table: String,

    #[validate(length(min = 1, max = 63, message = "Column name is required"))]
    pub column: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyAnalysisRequest {
    #[validate(length(min = 1, max = 127, message = "Table name is required"))]
    pub table: String,

    /// One of drop_table, drop_column, rename_table, rename_column,
    /// truncate_table, alter_column_type
    #[validate(length(min = 1, message = "Operation is required"))]
    pub operation: String,

    /// Required by column-level operations
    pub column: Option<String>,

    /// Required by rename operations
    pub new_name: Option<String>,

    /// Required by alter_column_type
    pub new_type: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RenameAnalysisRequest {
    #[validate(length(min = 1, max = 127, message = "Old table name is required"))]
    pub old_name: String,

    #[validate(length(min = 1, max = 127, message = "New table name is required"))]
    pub new_name: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ColumnRemovalPlanRequest {
    #[validate(length(min = 1, max = 127, message = "Table name is required"))]
    pub table: String,

    #[validate(length(min = 1, max = 63, message = "Column name is required"))]
    pub column: String,

    #[serde(default)]
    pub options: RemovalOptions,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ColumnReportRequest {
    #[validate(length(min = 1, max = 127, message = "Table name is required"))]
    pub table: String,

    #[validate(length(min = 1, max = 63, message = "Column name is required"))]
    pub column: String,

    #[serde(default)]
    pub format: ReportFormat,

    /// Render the removal safety validation instead of the raw dependencies
    #[serde(default)]
    pub validation: bool,
}

// ===== RESPONSES =====

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyAnalysisResponse {
    pub impact: FKImpactReport,
    pub integrity: IntegrityValidation,
    /// Absent when a cascading key makes an automatic plan unsafe
    pub migration_plan: Option<FkMigrationPlan>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameAnalysisResponse {
    pub validation: RenameValidation,
    pub report: TableRenameReport,
    pub assessment: RiskAssessment,
    pub recommended_strategy: ZeroDowntimeStrategy,
    /// Statements coordination would run, in order
    pub statements: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnRemovalPlanResponse {
    pub plan: RemovalPlan,
    pub validation: RemovalSafetyValidation,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    pub format: ReportFormat,
    pub content: String,
}
