// Model invocation route handler

use hyper::{Body, Request, Response};
use log::info;
use std::convert::Infallible;
use std::sync::Arc;

use crate::web::gateway::{Gateway, GatewayError};
use crate::web::request_parsing::read_payload;
use crate::web::response_helpers::{json_error, json_result};

/// POST /api/{model}/{method}/
pub async fn handle_invoke(
    req: Request<Body>,
    gateway: Arc<Gateway>,
    model: &str,
    method: &str,
) -> Result<Response<Body>, Infallible> {
    let result = match read_payload(req.into_body(), gateway.body_limit()).await {
        // An unknown model still answers 404, whatever the body.
        Err(_) if !gateway.has_model(model) => Err(GatewayError::NotFound),
        Err(_) => Err(GatewayError::PayloadTooLarge),
        Ok(payload) => gateway.invoke(model, method, payload).await,
    };
    match result {
        Ok(result) => Ok(json_result(&result)),
        Err(e) => {
            info!("[GATEWAY] {model}.{method} -> {}: {e}", e.status().as_u16());
            Ok(json_error(e.status(), &e.to_string()))
        }
    }
}
