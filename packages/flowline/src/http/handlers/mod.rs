pub mod executions;
pub mod health;
pub mod openapi;
pub mod production;
pub mod resume;
pub mod webhooks;
pub mod workflows;

use axum::{http::StatusCode, response::IntoResponse, Json};
use flowline_types::ErrorResponse;

pub async fn handle_not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new("route not found")),
    )
}
