use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::db::PositionStore;
use crate::AppState;

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.engine.store().ping().await.is_ok();
    let monitor = state.monitor.state();
    let open_positions = state.engine.index().len().await;

    if store_ok {
        (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "monitor": monitor,
                "open_positions": open_positions,
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "store": "disconnected", "monitor": monitor })),
        )
    }
}
