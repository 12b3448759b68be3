//! Per-operation context
//!
//! Every analyzer and manager call receives an `OperationContext` instead of
//! reaching for process-wide state. It carries the correlation id, the
//! timeouts for catalog and DDL round trips, and a cancellation token that
//! aborts any in-flight network call.

use crate::config::EngineConfig;
use crate::error::{AppError, AppResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// Shared cancellation signal
#[derive(Debug, Clone)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancellationToken {
    /// Create a new non-cancelled token.
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                // Sender dropped without cancelling: never resolves.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Context passed explicitly into every engine call
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation_id: Uuid,
    pub catalog_timeout: Duration,
    pub ddl_timeout: Duration,
    cancellation: CancellationToken,
}

impl OperationContext {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            catalog_timeout: config.catalog_query_timeout,
            ddl_timeout: config.ddl_timeout,
            cancellation: CancellationToken::new(),
        }
    }

    /// Attach an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Same id and timeouts under a fresh token. Compensating work (rollback)
    /// runs on this after the original context was cancelled.
    pub fn detached(&self) -> Self {
        Self {
            operation_id: self.operation_id,
            catalog_timeout: self.catalog_timeout,
            ddl_timeout: self.ddl_timeout,
            cancellation: CancellationToken::new(),
        }
    }

    /// Run a catalog round trip under the catalog timeout.
    pub async fn catalog<T, F>(&self, label: &str, fut: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        self.guard(label, self.catalog_timeout, fut).await
    }

    /// Run a DDL round trip under the DDL timeout.
    pub async fn ddl<T, F>(&self, label: &str, fut: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        self.guard(label, self.ddl_timeout, fut).await
    }

    /// Race `fut` against the timeout and the cancellation token.
    pub async fn guard<T, F>(&self, label: &str, timeout: Duration, fut: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        if self.cancellation.is_cancelled() {
            return Err(AppError::Cancelled(label.to_string()));
        }

        debug!(operation_id = %self.operation_id, "-> {}", label);

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(AppError::Cancelled(label.to_string())),
            outcome = tokio::time::timeout(timeout, fut) => match outcome {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout {
                    operation: label.to_string(),
                    elapsed: timeout,
                }),
            },
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}
