use axum::extract::{Path, Query, State};
use axum::Json;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::execution::OrderError;
use crate::models::{CloseReason, Position, PositionEvent};
use crate::AppState;

use super::ApiResponse;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub owner_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CloseRequest {
    /// Exit price; defaults to the last price seen on the pair.
    pub price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct AddMarginRequest {
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct RiskControlsRequest {
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<Vec<Position>>>, AppError> {
    let positions = state.engine.positions(query.owner_id.as_deref()).await?;
    Ok(Json(ApiResponse::ok(positions)))
}

pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Position>>, AppError> {
    let position = state.engine.position(id).await?;
    Ok(Json(ApiResponse::ok(position)))
}

pub async fn close(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CloseRequest>>,
) -> Result<Json<ApiResponse<PositionEvent>>, AppError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let price = match request.price {
        Some(price) => price,
        None => {
            let pair = state.engine.position(id).await?.pair();
            state
                .monitor
                .last_price(&pair)
                .ok_or(OrderError::NoPrice(pair))?
        }
    };

    match state.engine.close_position(id, price, CloseReason::Manual).await? {
        Some(event) => Ok(Json(ApiResponse::ok(event))),
        None => Err(AppError::BadRequest(format!("position {id} is already closed"))),
    }
}

pub async fn add_margin(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<AddMarginRequest>,
) -> Result<Json<ApiResponse<Position>>, AppError> {
    let position = state.engine.add_margin(id, body.amount).await?;
    Ok(Json(ApiResponse::ok(position)))
}

pub async fn update_risk(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<RiskControlsRequest>,
) -> Result<Json<ApiResponse<Position>>, AppError> {
    let position = state
        .engine
        .update_risk_controls(id, body.take_profit, body.stop_loss)
        .await?;
    Ok(Json(ApiResponse::ok(position)))
}
