pub mod artifacts;
pub mod controls;
pub mod error;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::controller::AppState;

pub fn router(app: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(artifacts::index))
        .route("/style.css", get(artifacts::style_css))
        .route("/json/optimize_request.json", get(artifacts::optimize_request))
        .route("/json/optimize_response.json", get(artifacts::optimize_response))
        .route("/json/current_controls.json", get(controls::current_controls))
        .route("/controls/mode_override", post(controls::mode_override))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}
