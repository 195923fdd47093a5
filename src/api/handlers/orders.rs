use axum::extract::State;
use axum::Json;

use crate::errors::AppError;
use crate::execution::OrderOutcome;
use crate::models::OrderRequest;
use crate::AppState;

use super::ApiResponse;

pub async fn place(
    State(state): State<AppState>,
    Json(order): Json<OrderRequest>,
) -> Result<Json<ApiResponse<OrderOutcome>>, AppError> {
    let outcome = state.engine.place_order(order).await?;
    Ok(Json(ApiResponse::ok(outcome)))
}
