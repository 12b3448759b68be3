//! Rendered impact reports

use crate::error::{validation_error, AppResult};
use crate::models::{ColumnReportRequest, ReportResponse, SuccessResponse};
use crate::removal::plan::RemovalOptions;
use crate::removal::ColumnRemovalManager;
use crate::report::ImpactReporter;
use crate::state::SharedState;
use axum::{extract::State, Json};
use tracing::debug;
use validator::Validate;

/// Dependency report for a column, or its removal safety validation when
/// `validation` is set, rendered in the requested format
pub async fn column_report(
    State(state): State<SharedState>,
    Json(payload): Json<ColumnReportRequest>,
) -> AppResult<Json<SuccessResponse<ReportResponse>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    debug!(
        "Rendering {:?} report for {}.{}",
        payload.format, payload.table, payload.column
    );

    let ctx = state.context();
    let content = if payload.validation {
        let options = RemovalOptions {
            dry_run: true,
            ..RemovalOptions::default()
        };
        let plan = state
            .removals
            .plan_column_removal(&ctx, &payload.table, &payload.column, options)
            .await?;
        let validation = ColumnRemovalManager::validate_removal_plan(&plan);
        ImpactReporter::render_safety_validation(&validation, payload.format)?
    } else {
        let report = state
            .dependencies
            .analyze_column_dependencies(&ctx, &payload.table, &payload.column)
            .await?;
        ImpactReporter::render_dependency_report(&report, payload.format)?
    };

    Ok(Json(SuccessResponse::with_data(
        "Report rendered",
        ReportResponse {
            format: payload.format,
            content,
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::ReferentialAction;
    use crate::report::ReportFormat;
    use crate::state::AppState;
    use crate::testing::{fk, RecordingExecutor, ScriptedCatalog};
    use std::sync::Arc;

    fn state() -> SharedState {
        let catalog = ScriptedCatalog::new()
            .with_column("users", "id", "integer")
            .with_foreign_key(fk("orders_user_fk", ("orders", "user_id"), ("users", "id"), ReferentialAction::Cascade));
        Arc::new(AppState::new(
            Arc::new(catalog),
            Arc::new(RecordingExecutor::new()),
            EngineConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_json_dependency_report_parses() {
        let Json(body) = column_report(
            State(state()),
            Json(ColumnReportRequest {
                table: "users".to_string(),
                column: "id".to_string(),
                format: ReportFormat::Json,
                validation: false,
            }),
        )
        .await
        .unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&body.data.content).unwrap();
        assert!(parsed.is_object());
        assert!(body.data.content.contains("orders_user_fk"));
    }

    #[tokio::test]
    async fn test_html_validation_report_is_escaped_document() {
        let Json(body) = column_report(
            State(state()),
            Json(ColumnReportRequest {
                table: "users".to_string(),
                column: "id".to_string(),
                format: ReportFormat::Html,
                validation: true,
            }),
        )
        .await
        .unwrap();

        assert!(body.data.content.contains("<html"));
        assert!(body.data.content.contains("orders_user_fk"));
    }
}
