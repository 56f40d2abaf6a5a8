//! Admin API for the reconciliation daemon

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;

use crate::EngineReport;

/// Admin API state
#[derive(Clone)]
pub struct AdminState {
    pub engines: Arc<RwLock<Vec<EngineReport>>>,
}

/// Health response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub engines: usize,
    pub failed: usize,
}

async fn health(State(state): State<AdminState>) -> Json<HealthResponse> {
    let engines = state.engines.read().await;
    let failed = engines
        .iter()
        .filter(|r| matches!(r.status.state, search_sync_engine::EngineState::Failed(_)))
        .count();
    Json(HealthResponse {
        status: if failed == 0 { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        engines: engines.len(),
        failed,
    })
}

async fn engines(State(state): State<AdminState>) -> Json<Vec<EngineReport>> {
    Json(state.engines.read().await.clone())
}

async fn live() -> &'static str {
    "OK"
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(live))
        .route("/engines", get(engines))
        .with_state(state)
}

/// Serve the admin API on an already bound listener
pub async fn serve_admin(listener: TcpListener, state: AdminState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

/// Run admin server
pub async fn run_admin_server(listen: String, state: AdminState) -> std::io::Result<()> {
    let listener = TcpListener::bind(&listen).await?;
    info!(listen, "Admin API started");
    serve_admin(listener, state).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use search_sync_engine::{EngineState, EngineStatus};
    use serde_json::Value;

    fn report(endpoint: &str, state: EngineState) -> EngineReport {
        EngineReport {
            status: EngineStatus {
                endpoint: endpoint.to_string(),
                shard: None,
                state,
                namespaces: vec!["shop.items".to_string()],
            },
            events: 3,
        }
    }

    #[tokio::test]
    async fn test_engines_and_health() {
        let state = AdminState {
            engines: Arc::new(RwLock::new(vec![
                report("mem://a", EngineState::Tailing),
                report("mem://b", EngineState::Failed("Rollback detected".into())),
            ])),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_admin(listener, state));

        let client = reqwest::Client::new();
        let engines: Value = client
            .get(format!("http://{addr}/engines"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(engines[0]["endpoint"], "mem://a");
        assert_eq!(engines[0]["state"], "tailing");
        assert_eq!(engines[0]["events"], 3);
        assert_eq!(engines[1]["state"], "failed");
        assert_eq!(engines[1]["reason"], "Rollback detected");

        let health: Value = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["failed"], 1);
    }
}
