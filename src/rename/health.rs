//! Application health and restart collaborators
//!
//! Zero-downtime strategies poll a [`HealthChecker`] between steps and use a
//! [`RestartCoordinator`] for rolling restarts. Both are external: the engine
//! only defines the contracts plus a database-backed health check.

use crate::config::EngineConfig;
use crate::context::OperationContext;
use crate::db::SqlExecutor;
use crate::error::AppResult;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub is_healthy: bool,
    pub response_time: Duration,
    pub error_message: Option<String>,
}

impl HealthCheckResult {
    pub fn unhealthy(message: impl Into<String>, response_time: Duration) -> Self {
        Self {
            is_healthy: false,
            response_time,
            error_message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check_application_health(&self) -> AppResult<HealthCheckResult>;
}

#[async_trait]
pub trait RestartCoordinator: Send + Sync {
    /// Restart one application instance; `false` when it did not come back.
    async fn coordinate_restart(&self, instance: &str) -> AppResult<bool>;
}

/// Healthy when `SELECT 1` answers within `max_response_time`
pub struct DatabaseHealthCheck {
    executor: Arc<dyn SqlExecutor>,
    max_response_time: Duration,
}

impl DatabaseHealthCheck {
    pub fn new(executor: Arc<dyn SqlExecutor>, max_response_time: Duration) -> Self {
        Self {
            executor,
            max_response_time,
        }
    }
}

#[async_trait]
impl HealthChecker for DatabaseHealthCheck {
    async fn check_application_health(&self) -> AppResult<HealthCheckResult> {
        let started = Instant::now();
        let outcome = self.executor.query_scalar("SELECT 1").await;
        let response_time = started.elapsed();

        Ok(match outcome {
            Ok(_) if response_time <= self.max_response_time => HealthCheckResult {
                is_healthy: true,
                response_time,
                error_message: None,
            },
            Ok(_) => HealthCheckResult::unhealthy(
                format!("Database answered in {:?}, limit is {:?}", response_time, self.max_response_time),
                response_time,
            ),
            Err(e) => HealthCheckResult::unhealthy(e.to_string(), response_time),
        })
    }
}

/// Restart coordinator for deployments without application instances
pub struct NoopRestartCoordinator;

#[async_trait]
impl RestartCoordinator for NoopRestartCoordinator {
    async fn coordinate_restart(&self, instance: &str) -> AppResult<bool> {
        debug!("No restart hook configured, skipping {}", instance);
        Ok(true)
    }
}

/// One bounded health probe. Collaborator errors and timeouts come back as
/// unhealthy results so callers only branch on `is_healthy`.
pub async fn probe(ctx: &OperationContext, checker: &dyn HealthChecker, config: &EngineConfig) -> HealthCheckResult {
    let started = Instant::now();
    match ctx
        .guard("health_check", config.health_check_timeout, checker.check_application_health())
        .await
    {
        Ok(result) => {
            if !result.is_healthy {
                warn!("⚠️  Health check failed: {}", result.error_message.as_deref().unwrap_or("unhealthy"));
            }
            result
        }
        Err(e) => {
            warn!("⚠️  Health check errored: {}", e);
            HealthCheckResult::unhealthy(e.to_string(), started.elapsed())
        }
    }
}

/// Outcome of a monitoring window
#[derive(Debug, Clone)]
pub struct MonitoringOutcome {
    pub healthy: bool,
    pub results: Vec<HealthCheckResult>,
    pub error: Option<String>,
}

/// Take `health_check_samples` probes spaced by `health_check_interval`.
/// The whole window is bounded by `health_check_timeout`; the first unhealthy
/// probe ends it early.
pub async fn monitor_window(
    ctx: &OperationContext,
    checker: &dyn HealthChecker,
    config: &EngineConfig,
) -> MonitoringOutcome {
    let mut results = Vec::new();

    let window = async {
        for sample in 0..config.health_check_samples {
            if sample > 0 {
                tokio::time::sleep(config.health_check_interval).await;
            }
            let result = probe(ctx, checker, config).await;
            let healthy = result.is_healthy;
            let message = result.error_message.clone();
            results.push(result);
            if !healthy {
                return Err(message.unwrap_or_else(|| "application reported unhealthy".to_string()));
            }
        }
        Ok(())
    };

    let outcome = tokio::time::timeout(config.health_check_timeout, window).await;
    let error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(message)) => Some(format!("Health degraded: {}", message)),
        Err(_) => Some(format!(
            "Health monitoring did not complete within {:?}",
            config.health_check_timeout
        )),
    };

    MonitoringOutcome {
        healthy: error.is_none(),
        results,
        error,
    }
}
