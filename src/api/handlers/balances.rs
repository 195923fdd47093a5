use axum::extract::{Path, State};
use axum::Json;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::errors::AppError;
use crate::AppState;

use super::ApiResponse;

#[derive(Serialize)]
pub struct BalanceView {
    pub owner_id: String,
    pub currency: String,
    pub balance: Decimal,
}

pub async fn get(
    State(state): State<AppState>,
    Path((owner_id, currency)): Path<(String, String)>,
) -> Result<Json<ApiResponse<BalanceView>>, AppError> {
    let currency = currency.to_uppercase();
    let balance = state.engine.balance(&owner_id, &currency).await?;
    Ok(Json(ApiResponse::ok(BalanceView {
        owner_id,
        currency,
        balance,
    })))
}
