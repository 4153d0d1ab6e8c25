// Model listing route handler

use hyper::{Body, Response, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;

use crate::web::gateway::Gateway;
use crate::web::response_helpers::json_response;
use crate::web::worker::worker_bridge::WorkerHealth;

#[derive(Debug, Serialize)]
struct ModelEntry {
    name: String,
    methods: Vec<String>,
    state: WorkerHealth,
    restarts: u32,
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    models: Vec<ModelEntry>,
}

/// GET /api/models: every registered model with its methods, health and restart count.
pub async fn handle_list(gateway: Arc<Gateway>) -> Result<Response<Body>, Infallible> {
    let models = gateway
        .registry()
        .bridges()
        .map(|bridge| ModelEntry {
            name: bridge.model().to_string(),
            methods: bridge.methods(),
            state: bridge.health(),
            restarts: bridge.restart_count(),
        })
        .collect();
    Ok(json_response(StatusCode::OK, &ModelsResponse { models }))
}
