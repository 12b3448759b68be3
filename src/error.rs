//! Error handling module
//!
//! One error type for the whole engine. Expected "this change is unsafe"
//! outcomes are NOT errors: they are reported through result values
//! (`is_safe`, `overall_risk`, `success`). Only input errors, fail-closed
//! refusals and unrecoverable I/O failures end up here.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Catalog or database unreachable. Never retried silently.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Bad input: empty names, out-of-range sample sizes, unknown operation kinds.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An identifier failed the allow-list and was rejected before any query ran.
    #[error("Query parsing error: {0}")]
    QueryParsing(String),

    /// A CASCADE foreign key is in the blast radius of the requested operation.
    #[error("Cascade risk: operation would cascade through {}", constraints.join(", "))]
    CascadeRisk { constraints: Vec<String> },

    /// The foreign-key discovery process itself failed (not a discovered cycle).
    #[error("Circular dependency analysis failed: {0}")]
    CircularDependency(String),

    /// Admission control refused a new resource.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A statement inside a transaction failed; the transaction was rolled back.
    #[error("Statement {index} failed: {message}")]
    StatementFailed {
        index: usize,
        statement: String,
        message: String,
    },

    #[error("Operation '{operation}' timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    #[error("Operation '{0}' was cancelled")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// True when the failure came from I/O rather than from the caller's input.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            AppError::Connection(_) | AppError::Pool(_) | AppError::Database(_) | AppError::Timeout { .. }
        )
    }
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match &self {
            AppError::Database(e) => {
                error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Pool(e) => {
                error!("Pool error: {:?}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "POOL_EXHAUSTED",
                    "Database connection pool exhausted".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Connection(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "CONNECTION_ERROR",
                "Catalog is unreachable".to_string(),
                Some(msg.clone()),
            ),
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::QueryParsing(msg) => (
                StatusCode::BAD_REQUEST,
                "INVALID_IDENTIFIER",
                msg.clone(),
                None,
            ),
            AppError::CascadeRisk { .. } => (
                StatusCode::CONFLICT,
                "CASCADE_RISK",
                self.to_string(),
                Some("Explicit operator override is required".to_string()),
            ),
            AppError::CircularDependency(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DEPENDENCY_ANALYSIS_FAILED",
                "Foreign key analysis failed".to_string(),
                Some(msg.clone()),
            ),
            AppError::CapacityExceeded(msg) => (
                StatusCode::TOO_MANY_REQUESTS,
                "CAPACITY_EXCEEDED",
                msg.clone(),
                None,
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                None,
            ),
            AppError::StatementFailed { statement, message, .. } => {
                error!("Statement failed: {} ({})", statement, message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STATEMENT_FAILED",
                    "A statement failed and its transaction was rolled back".to_string(),
                    Some(message.clone()),
                )
            }
            AppError::Timeout { .. } => (
                StatusCode::GATEWAY_TIMEOUT,
                "TIMEOUT",
                self.to_string(),
                None,
            ),
            AppError::Cancelled(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CANCELLED",
                self.to_string(),
                None,
            ),
            AppError::Config(msg) => {
                error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    "A configuration error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(error_code.to_string()),
        });

        (status, body).into_response()
    }
}

/// Result type alias used throughout the engine
pub type AppResult<T> = Result<T, AppError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}

/// Helper function to create a not found error
pub fn not_found_error(msg: impl Into<String>) -> AppError {
    AppError::NotFound(msg.into())
}
