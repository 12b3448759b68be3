//! Dependency, foreign key and rename analysis handlers

use crate::analysis::foreign_key::{FkOperation, FkOperationKind};
use crate::analysis::risk::RiskAssessmentEngine;
use crate::analysis::table_rename::TableRenameAnalyzer;
use crate::error::{not_found_error, validation_error, AppError, AppResult};
use crate::models::{
    ColumnAnalysisRequest, ForeignKeyAnalysisRequest, ForeignKeyAnalysisResponse, RenameAnalysisRequest,
    RenameAnalysisResponse, SuccessResponse,
};
use crate::rename::coordination::RenameCoordinationEngine;
use crate::rename::strategy::ApplicationSafeRenameStrategy;
use crate::schema::DependencyReport;
use crate::state::SharedState;
use axum::{extract::State, Json};
use tracing::{debug, info, warn};
use validator::Validate;

/// Everything that depends on one column
pub async fn analyze_column(
    State(state): State<SharedState>,
    Json(payload): Json<ColumnAnalysisRequest>,
) -> AppResult<Json<SuccessResponse<DependencyReport>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    debug!("Column analysis requested for {}.{}", payload.table, payload.column);

    let ctx = state.context();
    let report = state
        .dependencies
        .analyze_column_dependencies(&ctx, &payload.table, &payload.column)
        .await?;

    let message = format!(
        "Found {} dependencies, removal is {}",
        report.total_count(),
        report.get_removal_recommendation()
    );
    Ok(Json(SuccessResponse::with_data(message, report)))
}

/// Impact of an operation on referencing keys, whether integrity allows it,
/// and the drop/apply/recreate plan when one is safe to generate
pub async fn analyze_foreign_keys(
    State(state): State<SharedState>,
    Json(payload): Json<ForeignKeyAnalysisRequest>,
) -> AppResult<Json<SuccessResponse<ForeignKeyAnalysisResponse>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let kind: FkOperationKind = payload.operation.parse()?;
    let mut operation = FkOperation::new(kind, payload.table.as_str());
    if let Some(column) = payload.column {
        operation = operation.with_column(column);
    }
    if let Some(new_name) = payload.new_name {
        operation = operation.with_new_name(new_name);
    }
    if let Some(new_type) = payload.new_type {
        operation = operation.with_new_type(new_type);
    }
    operation.validate()?;

    let ctx = state.context();
    let impact = state
        .foreign_keys
        .analyze_foreign_key_impact(&ctx, &operation.table, kind.as_str())
        .await?;
    let integrity = state.foreign_keys.validate_referential_integrity(&ctx, &operation).await?;

    let migration_plan = match state.foreign_keys.generate_fk_safe_migration_plan(&ctx, &operation).await {
        Ok(plan) => Some(plan),
        Err(AppError::CascadeRisk { constraints }) => {
            warn!("⛔ No migration plan, cascading keys: {}", constraints.join(", "));
            None
        }
        Err(e) => return Err(e),
    };

    let message = format!(
        "{} on {} affects {} foreign keys (risk {})",
        impact.operation,
        impact.table,
        impact.affected_foreign_keys.len(),
        impact.risk_level
    );
    Ok(Json(SuccessResponse::with_data(
        message,
        ForeignKeyAnalysisResponse {
            impact,
            integrity,
            migration_plan,
        },
    )))
}

/// Dependents of a table rename, with the workflow coordination would run
pub async fn analyze_rename(
    State(state): State<SharedState>,
    Json(payload): Json<RenameAnalysisRequest>,
) -> AppResult<Json<SuccessResponse<RenameAnalysisResponse>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let validation = TableRenameAnalyzer::validate_rename_operation(&payload.old_name, &payload.new_name);
    if !validation.is_valid {
        return Err(validation_error(validation.errors.join("; ")));
    }

    let ctx = state.context();
    let report = state
        .renames
        .analyze_table_rename(&ctx, &payload.old_name, &payload.new_name)
        .await?;
    if !report.table_exists {
        return Err(not_found_error(format!("Table '{}' does not exist", payload.old_name)));
    }

    let assessment = RiskAssessmentEngine::assess_rename(&report);
    let recommended_strategy =
        ApplicationSafeRenameStrategy::select_strategy(&payload.old_name, &payload.new_name, &report);
    let statements = RenameCoordinationEngine::workflow_statements(&report)?;

    info!(
        "📋 Rename {} -> {}: {} dependents, {} statements, strategy {}",
        payload.old_name,
        payload.new_name,
        report.total_count(),
        statements.len(),
        recommended_strategy
    );

    let message = format!("Rename risk is {}", report.overall_risk);
    Ok(Json(SuccessResponse::with_data(
        message,
        RenameAnalysisResponse {
            validation,
            report,
            assessment,
            recommended_strategy,
            statements,
        },
    )))
}
