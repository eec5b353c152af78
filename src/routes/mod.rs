//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! One axum router serves the websocket gateway at `/socket` and a health
//! check at `/api/status`. CORS is open since browser clients are served
//! from a separate origin.

pub mod ws;

use axum::Json;
use axum::Router;
use axum::routing::get;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status))
        .route("/socket", get(ws::handle_ws))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn status() -> Json<Value> {
    Json(json!({ "status": "Server is running" }))
}

#[cfg(test)]
#[path = "router_test.rs"]
mod tests;
