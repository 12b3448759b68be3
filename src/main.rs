//! SchemaFlow Evolve analysis service
//!
//! Serves read-only impact analysis over HTTP: column dependencies, foreign
//! key fallout, table rename workflows and column removal plans. Execution of
//! migrations stays in the library.

use schemaflow_evolve::config::Settings;
use schemaflow_evolve::db::postgres::PgDatabase;
use schemaflow_evolve::routes::create_router;
use schemaflow_evolve::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("🚀 Starting SchemaFlow Evolve...");

    let settings = Settings::load()?;
    info!("📋 Configuration loaded successfully");

    let database = match PgDatabase::connect(&settings.database).await {
        Ok(database) => Arc::new(database),
        Err(e) => {
            error!("❌ Failed to connect to {}: {}", settings.database.database, e);
            return Err(e.into());
        }
    };
    info!("✅ Connected to {}:{}/{}", settings.database.host, settings.database.port, settings.database.database);

    let state = Arc::new(AppState::new(database.clone(), database, settings.engine.clone()));
    let app = create_router(state, &settings.cors);

    let addr = SocketAddr::from((settings.server.host, settings.server.port));
    info!("🌐 Server listening on http://{}", addr);
    info!("📚 API Endpoints:");
    info!("   GET  /health");
    info!("   POST /api/analysis/column         - Column dependencies");
    info!("   POST /api/analysis/foreign-keys   - FK impact, integrity and safe plan");
    info!("   POST /api/analysis/rename         - Table rename dependents and workflow");
    info!("   POST /api/plans/column-removal    - Column removal plan (dry run)");
    info!("   POST /api/reports/column          - Rendered impact report");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("👋 Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,schemaflow_evolve=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("❌ Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("❌ Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
