//! Route definitions and router setup
//!
//! Read-only analysis service: every endpoint inspects the catalog and plans,
//! none of them executes DDL.

mod analysis;
mod plans;
mod reports;

use crate::config::CorsConfig;
use crate::rename::health::probe;
use crate::state::SharedState;
use axum::{
    extract::State,
    http::{header, Method},
    routing::{get, post},
    Json, Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

pub fn create_router(state: SharedState, cors: &CorsConfig) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(build_cors_layer(cors))
        .propagate_x_request_id();

    Router::new()
        .route("/health", get(health_check))
        // Analysis
        .route("/api/analysis/column", post(analysis::analyze_column))
        .route("/api/analysis/foreign-keys", post(analysis::analyze_foreign_keys))
        .route("/api/analysis/rename", post(analysis::analyze_rename))
        // Planning
        .route("/api/plans/column-removal", post(plans::plan_column_removal))
        // Reports
        .route("/api/reports/column", post(reports::column_report))
        .layer(middleware)
        .with_state(state)
}

fn build_cors_layer(cors: &CorsConfig) -> CorsLayer {
    let origins: Vec<_> = cors.allowed_origins.iter().filter_map(|s| s.parse().ok()).collect();

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(3600));

    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(origins)
    }
}

/// Liveness plus one bounded `SELECT 1` against the catalog database
async fn health_check(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let ctx = state.context();
    let database = probe(&ctx, &state.database_health, &state.engine).await;

    Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "database": database,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::state::AppState;
    use crate::testing::{RecordingExecutor, ScriptedCatalog};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_health_reports_database() {
        let state = Arc::new(AppState::new(
            Arc::new(ScriptedCatalog::new()),
            Arc::new(RecordingExecutor::new()),
            EngineConfig::default(),
        ));

        let Json(body) = health_check(State(state)).await;

        assert_eq!(body["success"], true);
        assert_eq!(body["database"]["isHealthy"], true);
    }

    #[test]
    fn test_router_builds_with_explicit_origins() {
        let state = Arc::new(AppState::new(
            Arc::new(ScriptedCatalog::new()),
            Arc::new(RecordingExecutor::new()),
            EngineConfig::default(),
        ));
        let cors = CorsConfig {
            allowed_origins: vec!["http://localhost:5173".to_string()],
        };

        let _router = create_router(state, &cors);
    }
}
