use axum::{
    extract::State,
    http::header::CONTENT_TYPE,
    response::{Html, IntoResponse, Response},
};
use std::sync::Arc;
use tracing::error;

use crate::controller::AppState;

const DEFAULT_INDEX: &str = include_str!("../../web/index.html");
const DEFAULT_STYLE: &str = include_str!("../../web/style.css");

/// GET / - static HTML, overridable by a `web/index.html` in the working
/// directory.
pub async fn index(State(app): State<Arc<AppState>>) -> Html<String> {
    let path = app.workdir.join("web").join("index.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => Html(body),
        Err(_) => Html(DEFAULT_INDEX.to_string()),
    }
}

/// GET /style.css
pub async fn style_css(State(app): State<Arc<AppState>>) -> Response {
    let path = app.workdir.join("web").join("style.css");
    let body = tokio::fs::read_to_string(&path)
        .await
        .unwrap_or_else(|_| DEFAULT_STYLE.to_string());
    ([(CONTENT_TYPE, "text/css")], body).into_response()
}

/// GET /json/optimize_request.json - the last serialized request.
pub async fn optimize_request(State(app): State<Arc<AppState>>) -> Response {
    match app.state.last_request() {
        Some(request) => json_body(&request),
        None => {
            let path = app.workdir.join("json").join("optimize_request.json");
            match tokio::fs::read_to_string(&path).await {
                Ok(body) => ([(CONTENT_TYPE, "application/json")], body).into_response(),
                Err(e) => {
                    error!(error = %e, "optimize_request.json not available");
                    json_body(&serde_json::json!({ "error": "optimize_request.json file not found" }))
                }
            }
        }
    }
}

/// GET /json/optimize_response.json - the last serialized response, with an
/// empty default while no cycle has completed yet.
pub async fn optimize_response(State(app): State<Arc<AppState>>) -> Response {
    if let Some(response) = app.state.last_response() {
        return json_body(&response);
    }
    let path = app.workdir.join("json").join("optimize_response.json");
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => ([(CONTENT_TYPE, "application/json")], body).into_response(),
        Err(_) => json_body(&serde_json::json!({
            "ac_charge": [],
            "dc_charge": [],
            "discharge_allowed": [],
            "eautocharge_hours_float": null,
            "result": {},
            "eauto_obj": {},
            "start_solution": [],
            "washingstart": 0,
            "timestamp": app.clock.now().to_rfc3339(),
        })),
    }
}

fn json_body(value: &serde_json::Value) -> Response {
    (
        [(CONTENT_TYPE, "application/json")],
        value.to_string(),
    )
        .into_response()
}
