use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use shared::{Heartbeat, LoopHealth};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{Order, OrderStatus};
use crate::relay::OutboxRelay;
use crate::store::SharedOrderStore;
use crate::writer::OutboxWriter;

#[derive(Clone)]
pub struct AppState {
    pub writer: OutboxWriter,
    pub store: SharedOrderStore,
    pub relay: Arc<OutboxRelay>,
    pub heartbeats: Vec<Heartbeat>,
    pub stale_after: Duration,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub amount: BigDecimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderStatusResponse {
    pub transaction_id: Uuid,
    pub status: OrderStatus,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub loops: Vec<LoopHealth>,
}

pub struct ApiError(shared::Error);

impl From<shared::Error> for ApiError {
    fn from(e: shared::Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            shared::Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            shared::Error::NotFound(_) => StatusCode::NOT_FOUND,
            shared::Error::Conflict(_) => StatusCode::CONFLICT,
            shared::Error::Persistence(_) | shared::Error::Delivery(_) => {
                tracing::error!("Request failed: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorResponse { error: self.0.to_string() })).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/order/:user_id", post(create_order))
        .route("/order/:user_id/:transaction_id", get(order_status))
        .route("/orders/:user_id", get(list_orders))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn create_order(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Json<OrderStatusResponse>, ApiError> {
    let transaction_id = state.writer.create_order(&user_id, request.amount).await?;

    let relay = state.relay.clone();
    tokio::spawn(async move {
        if let Err(e) = relay.dispatch(transaction_id).await {
            tracing::warn!(%transaction_id, "Immediate relay failed, sweep will retry: {}", e);
        }
    });

    Ok(Json(OrderStatusResponse {
        transaction_id,
        status: OrderStatus::Created,
    }))
}

pub async fn order_status(
    State(state): State<AppState>,
    Path((user_id, transaction_id)): Path<(String, Uuid)>,
) -> Result<Json<OrderStatusResponse>, ApiError> {
    let order = state
        .store
        .find_order(&user_id, transaction_id)
        .await?
        .ok_or_else(|| shared::Error::NotFound(format!("order {}", transaction_id)))?;

    Ok(Json(OrderStatusResponse {
        transaction_id: order.transaction_id,
        status: order.order_status,
    }))
}

pub async fn list_orders(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Order>>, ApiError> {
    Ok(Json(state.store.list_orders(&user_id).await?))
}

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let loops: Vec<LoopHealth> = state
        .heartbeats
        .iter()
        .map(|heartbeat| heartbeat.check(state.stale_after))
        .collect();
    let healthy = loops.iter().all(|l| l.alive);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(HealthResponse { healthy, loops }))
}
