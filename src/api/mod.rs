//! HTTP API for submission, status and health checks

use crate::config::ApiConfig;
use crate::engine::TxEngine;
use crate::error::{EngineError, EngineResult};
use crate::tx::{TransactionIntent, TxStatus};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use ethers::types::H256;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TxEngine>,
}

pub fn router(engine: Arc<TxEngine>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/transactions", post(submit_transaction))
        .route("/transactions/:id", get(get_transaction))
        .route("/transactions/:id/accelerate", post(accelerate_transaction))
        .route("/transactions/:id/cancel", post(cancel_transaction))
        .route("/transactions/:id/watch", delete(stop_watch))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { engine })
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, engine: Arc<TxEngine>) -> EngineResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::Config(format!("cannot bind API address {}: {}", addr, e)))?;
    axum::serve(listener, router(engine))
        .await
        .map_err(|e| EngineError::Internal(format!("API server stopped: {}", e)))
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - ledger reachable and store healthy
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let chain_id = state.engine.chain_id();

    match state.engine.health_check().await {
        Ok(head) => {
            crate::metrics::record_health_check(true);
            (
                StatusCode::OK,
                Json(ReadinessResponse {
                    ready: true,
                    chain_id,
                    head: Some(head),
                    error: None,
                }),
            )
        }
        Err(e) => {
            warn!("Readiness check failed: {}", e);
            crate::metrics::record_health_check(false);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadinessResponse {
                    ready: false,
                    chain_id,
                    head: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn submit_transaction(
    State(state): State<AppState>,
    Json(intent): Json<TransactionIntent>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.engine.submit(intent).await?;
    let record = handle.snapshot();

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            id: record.id,
            tx_hash: record.tx_hash(),
            nonce: record.nonce(),
            status: record.status,
            required_confirmations: record.required_confirmations,
        }),
    ))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.record(id).await?))
}

async fn accelerate_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let tx_hash = state.engine.accelerate(id).await?;
    Ok(Json(ReplacementResponse { id, tx_hash }))
}

async fn cancel_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let tx_hash = state.engine.cancel(id).await?;
    Ok(Json(ReplacementResponse { id, tx_hash }))
}

async fn stop_watch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.stop_watch(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Get transaction statistics
async fn get_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.stats().await?))
}

/// Engine errors rendered as JSON with a matching status code
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::TransactionNotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::InvalidAction(_) | EngineError::InvalidStateTransition { .. } => {
                StatusCode::CONFLICT
            }
            EngineError::Estimation { .. }
            | EngineError::Submission { .. }
            | EngineError::SubmissionExhausted { .. }
            | EngineError::Signer(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::ChainConnection { .. } | EngineError::Nonce { .. } => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse {
            error: self.0.to_string(),
            kind: self.0.label(),
        });
        (status, body).into_response()
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    chain_id: u64,
    head: Option<u64>,
    error: Option<String>,
}

#[derive(Serialize)]
struct SubmitResponse {
    id: Uuid,
    tx_hash: Option<H256>,
    nonce: u64,
    status: TxStatus,
    required_confirmations: u64,
}

#[derive(Serialize)]
struct ReplacementResponse {
    id: Uuid,
    tx_hash: H256,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::state::MemoryRecordStore;
    use crate::testing::{FakeLedger, FakeSigner};
    use crate::tx::Signers;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ethers::types::Address;
    use serde_json::Value;
    use tower::ServiceExt;

    fn sender() -> Address {
        Address::repeat_byte(0x11)
    }

    fn app() -> Router {
        let ledger = Arc::new(FakeLedger::new(1));
        ledger.advance_to(10);
        let engine = TxEngine::new(
            ledger,
            Signers::new(Arc::new(FakeSigner::new(sender()))),
            Arc::new(MemoryRecordStore::new()),
            EngineOptions::default(),
        );
        router(Arc::new(engine))
    }

    async fn json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_always_ok() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn ready_reports_the_head() {
        let response = app()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["head"], 10);
    }

    #[tokio::test]
    async fn submitted_transaction_can_be_read_back() {
        let app = app();
        let intent = serde_json::json!({
            "to": format!("{:?}", Address::repeat_byte(0x22)),
            "value": "0x5",
        });

        let response = app
            .clone()
            .oneshot(
                Request::post("/transactions")
                    .header("content-type", "application/json")
                    .body(Body::from(intent.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let submitted = json(response).await;
        assert_eq!(submitted["status"], "pending");
        assert_eq!(submitted["nonce"], 0);

        let id = submitted["id"].as_str().unwrap().to_string();
        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/transactions/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let record = json(response).await;
        assert_eq!(record["id"], id.as_str());
        assert_eq!(record["attempts"].as_array().unwrap().len(), 1);

        let response = app
            .oneshot(
                Request::get("/stats").body(Body::empty()).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json(response).await["records"]["total"], 1);
    }

    #[tokio::test]
    async fn unknown_transaction_is_404() {
        let response = app()
            .oneshot(
                Request::post(format!("/transactions/{}/accelerate", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["kind"], "not_found");
    }
}
