//! Operator HTTP surface.
//!
//! - `GET|POST /api/indexer`: one tick followed by a refresh of every known
//!   pool row. Requires `Authorization: Bearer <secret>` when a secret is set.
//! - `GET /health`: liveness.

use crate::error::IndexerError;
use crate::indexer::{IndexerState, SharedIndexer, TickOutcome};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub indexer: SharedIndexer,
    pub secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(indexer: SharedIndexer, secret: Option<String>) -> Self {
        Self {
            indexer,
            secret: secret.map(Arc::from),
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(secret) = &self.secret else {
            return true;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|token| token == &**secret)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub success: bool,
    pub pools_found: usize,
    pub pools_indexed: usize,
    pub last_block: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    /// `None` while a tick holds the indexer.
    state: Option<IndexerState>,
    last_block: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Indexer failed")]
    Failed(#[from] IndexerError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for TriggerError {
    fn into_response(self) -> Response {
        let (status, details) = match &self {
            TriggerError::Unauthorized => (StatusCode::UNAUTHORIZED, None),
            TriggerError::Failed(e) => (StatusCode::INTERNAL_SERVER_ERROR, Some(e.to_string())),
        };
        let body = ErrorBody {
            error: self.to_string(),
            details,
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/indexer", get(run_indexer).post(run_indexer))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tracing::instrument(skip_all)]
async fn run_indexer(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TriggerResponse>, TriggerError> {
    if !state.authorized(&headers) {
        log::warn!("Rejected unauthenticated indexer trigger");
        return Err(TriggerError::Unauthorized);
    }

    let mut indexer = state.indexer.lock().await;
    let outcome = indexer.run_once().await.map_err(|e| {
        log::error!("Triggered tick failed: {}", e);
        e
    })?;
    let refresh = indexer.refresh_pools().await?;

    let last_block = match outcome {
        TickOutcome::Idle { last_block, .. } => last_block,
        TickOutcome::Advanced(report) => report.to,
    };
    log::info!(
        "Trigger: {} pools found, {} indexed, last block {}",
        refresh.pools_found,
        refresh.pools_indexed,
        last_block
    );

    Ok(Json(TriggerResponse {
        success: true,
        pools_found: refresh.pools_found,
        pools_indexed: refresh.pools_indexed,
        last_block,
        timestamp: Utc::now(),
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    // never waits on a running tick
    let (indexer_state, last_block) = match state.indexer.try_lock() {
        Ok(indexer) => (Some(indexer.state()), Some(indexer.last_block())),
        Err(_) => (None, None),
    };
    Json(HealthResponse {
        status: "ok",
        state: indexer_state,
        last_block,
    })
}

/// Serves [`router`] on `bind` until `shutdown` resolves.
pub async fn serve<F>(bind: SocketAddr, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    log::info!("Trigger listening on {}", bind);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
