pub mod cli;
pub mod command;
pub mod config;
pub mod control;
pub mod handlers;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod websocket;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use registry::RelayState;

/// Assemble the HTTP + WebSocket surface over shared relay state.
pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(handlers::root_status))
        .route("/health", get(handlers::health_check))
        .route("/robots", get(handlers::list_robots))
        .route("/robots/:robot_id", get(handlers::get_robot))
        .route("/robot", get(websocket::robot_ws_handler))
        .route("/ui", get(websocket::ui_ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
