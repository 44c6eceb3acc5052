//! Standalone runtime server: loads configuration, assembles the runtime
//! over in-memory or PostgreSQL storage, and serves the query API until
//! interrupted.

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use agent_core::config::AgentCoreConfig;
use agent_core::error::Result as CoreResult;
use agent_core::healing::{Diagnosis, DiagnosticCollaborator};
use agent_core::logging::init_structured_logging;
use agent_core::runtime::{AgentRuntime, RuntimeStores};
use agent_core::storage::postgres::PostgresStorage;
use agent_core::web::{serve, AppState};

/// Placeholder collaborator for deployments without a reasoning backend:
/// every diagnosis is a low-confidence "inspect manually" rule.
struct PassthroughDiagnostic;

#[async_trait::async_trait]
impl DiagnosticCollaborator for PassthroughDiagnostic {
    async fn diagnose(
        &self,
        _task_type: &str,
        error_log: &str,
        _context: &serde_json::Value,
    ) -> CoreResult<Diagnosis> {
        let root_cause = error_log.lines().next().unwrap_or(error_log).to_string();
        Ok(Diagnosis {
            advice: "inspect the failure manually; no reasoning backend configured".to_string(),
            confidence_score: 0.1,
            root_cause,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging();

    let config = AgentCoreConfig::load().context("loading configuration")?;

    let stores = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            info!("using PostgreSQL storage");
            let storage = PostgresStorage::connect(&url, 10)
                .await
                .context("connecting to PostgreSQL")?;
            RuntimeStores::postgres(storage)
        }
        Err(_) => {
            info!("DATABASE_URL not set, using in-memory storage");
            RuntimeStores::in_memory()
        }
    };

    let runtime = AgentRuntime::new(config, stores, Arc::new(PassthroughDiagnostic));
    let handles = runtime.start();

    if runtime.config().web.enabled {
        let state = AppState::from_runtime(&runtime);
        let bind_address = runtime.config().web.bind_address.clone();
        let shutdown = tokio_util::sync::CancellationToken::new();

        let server_shutdown = shutdown.clone();
        tokio::select! {
            result = serve(state, &bind_address, server_shutdown) => {
                result.context("query API server")?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                shutdown.cancel();
            }
        }
    } else {
        tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    }

    runtime.shutdown();
    for handle in handles {
        let _ = handle.await;
    }
    info!("runtime stopped");
    Ok(())
}
