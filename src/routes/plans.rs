//! Planning handlers
//!
//! Plans are always returned as dry runs; nothing is executed over HTTP.

use crate::error::{validation_error, AppResult};
use crate::models::{ColumnRemovalPlanRequest, ColumnRemovalPlanResponse, SuccessResponse};
use crate::removal::ColumnRemovalManager;
use crate::state::SharedState;
use axum::{extract::State, Json};
use tracing::info;
use validator::Validate;

pub async fn plan_column_removal(
    State(state): State<SharedState>,
    Json(payload): Json<ColumnRemovalPlanRequest>,
) -> AppResult<Json<SuccessResponse<ColumnRemovalPlanResponse>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let mut options = payload.options;
    options.dry_run = true;

    let ctx = state.context();
    let plan = state
        .removals
        .plan_column_removal(&ctx, &payload.table, &payload.column, options)
        .await?;
    let validation = ColumnRemovalManager::validate_removal_plan(&plan);

    info!(
        "📋 Planned removal of {}.{}: safe={}, risk {}",
        plan.table, plan.column, validation.is_safe, validation.risk_level
    );

    let message = if validation.is_safe {
        "Column can be removed".to_string()
    } else {
        format!(
            "Removal is blocked by {} critical dependencies",
            validation.blocking_dependencies.len()
        )
    };
    Ok(Json(SuccessResponse::with_data(
        message,
        ColumnRemovalPlanResponse { plan, validation },
    )))
}
