use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use shared::{Heartbeat, LoopHealth};
use std::time::Duration;

use crate::models::Account;
use crate::store::SharedPaymentStore;

#[derive(Clone)]
pub struct AppState {
    pub store: SharedPaymentStore,
    pub heartbeats: Vec<Heartbeat>,
    pub stale_after: Duration,
}

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    pub amount: BigDecimal,
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
        .route("/payment/:user_id", post(create_account).get(get_account))
        .route("/payment/:user_id/deposit", put(deposit))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

pub async fn create_account(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<(StatusCode, Json<Account>), ApiError> {
    let account = state.store.create_account(&user_id).await?;
    tracing::info!(user_id = %account.user_id, "Account created");
    Ok((StatusCode::CREATED, Json(account)))
}

pub async fn get_account(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Account>, ApiError> {
    let account = state
        .store
        .find_account(&user_id)
        .await?
        .ok_or_else(|| shared::Error::NotFound(format!("account {}", user_id)))?;
    Ok(Json(account))
}

pub async fn deposit(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<DepositRequest>,
) -> Result<Json<Account>, ApiError> {
    let account = state.store.deposit(&user_id, &request.amount).await?;
    tracing::info!(%user_id, amount = %request.amount, "Deposit applied");
    Ok(Json(account))
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
