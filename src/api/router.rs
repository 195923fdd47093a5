use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;
use super::auth::require_auth;
use super::handlers;

pub fn create_router(state: AppState) -> Router {
    // Public routes, no authentication
    let public = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::render));

    // Protected API routes: Bearer token when API_TOKEN is set
    let protected = Router::new()
        // Orders
        .route("/api/orders", post(handlers::orders::place))
        // Positions
        .route("/api/positions", get(handlers::positions::list))
        .route("/api/positions/:id", get(handlers::positions::detail))
        .route("/api/positions/:id/close", post(handlers::positions::close))
        .route("/api/positions/:id/margin", post(handlers::positions::add_margin))
        .route("/api/positions/:id/risk", put(handlers::positions::update_risk))
        // Balances
        .route("/api/balances/:owner_id/:currency", get(handlers::balances::get))
        // WebSocket
        .route("/ws", get(handlers::ws::handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    public
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
