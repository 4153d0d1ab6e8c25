//! Turns an HTTP call into one request on the right model's channel.

use hyper::StatusCode;
use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;

use super::registry::Registry;
use super::worker::ipc_types::WorkerPayload;
use super::worker::worker_bridge::BridgeError;

#[derive(Debug, Error, PartialEq)]
pub enum GatewayError {
    #[error("Model does not exist")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error("Model unavailable")]
    Unavailable,
    #[error("Model timed out")]
    TimedOut,
    #[error("Payload too large")]
    PayloadTooLarge,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Unavailable | GatewayError::TimedOut => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

pub const DEFAULT_BODY_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub struct Gateway {
    registry: Registry,
    body_limit: usize,
}

impl Gateway {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    pub fn with_body_limit(mut self, body_limit: usize) -> Self {
        self.body_limit = body_limit;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Largest request body read for an invocation.
    pub fn body_limit(&self) -> usize {
        self.body_limit
    }

    pub fn has_model(&self, model: &str) -> bool {
        self.registry.get(model).is_some()
    }

    /// Call `method` on `model`. The model is looked up before the payload is
    /// looked at, and a missing payload never reaches the worker.
    pub async fn invoke(&self, model: &str, method: &str, payload: Option<Value>) -> Result<Value, GatewayError> {
        let bridge = self.registry.get(model).ok_or(GatewayError::NotFound)?;
        let payload = payload.ok_or_else(|| GatewayError::BadRequest("Data not provided".to_string()))?;

        debug!("[GATEWAY] {model}.{method}");
        match bridge.invoke(method, payload).await {
            Ok(WorkerPayload::Success { result }) => Ok(result),
            Ok(WorkerPayload::Error { message, .. }) => Err(GatewayError::BadRequest(message)),
            Ok(other) => {
                warn!("[GATEWAY] Unexpected reply from '{model}': {other:?}");
                Err(GatewayError::Unavailable)
            }
            Err(BridgeError::Timeout { .. }) => Err(GatewayError::TimedOut),
            Err(BridgeError::Encode(e)) => Err(GatewayError::BadRequest(e.to_string())),
            Err(BridgeError::Unavailable(_) | BridgeError::Closed(_)) => Err(GatewayError::Unavailable),
        }
    }
}
