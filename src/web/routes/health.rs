// Health check route handler

use hyper::{Body, Response, StatusCode};
use serde_json::json;
use std::convert::Infallible;

use crate::web::response_helpers::json_response;

pub async fn handle() -> Result<Response<Body>, Infallible> {
    Ok(json_response(
        StatusCode::OK,
        &json!({"status": "ok", "service": "pressurize"}),
    ))
}
