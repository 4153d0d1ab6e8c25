// Request parsing utilities for HTTP handlers

use hyper::body::HttpBody;
use hyper::Body;
use log::debug;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("request body exceeds {limit} bytes")]
pub struct PayloadTooLarge {
    pub limit: usize,
}

/// Read the request body as the call payload, refusing more than `limit` bytes.
///
/// `Ok(None)` when the body cannot be read, is empty, is not JSON, or is the
/// JSON literal `null`. Callers answer that with "Data not provided".
pub async fn read_payload(mut body: Body, limit: usize) -> Result<Option<Value>, PayloadTooLarge> {
    // Content-Length, when present, sets the lower bound.
    if body.size_hint().lower() > limit as u64 {
        return Err(PayloadTooLarge { limit });
    }

    let mut body_bytes = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!("[REQUEST] Failed to read body: {e}");
                return Ok(None);
            }
        };
        if body_bytes.len() + chunk.len() > limit {
            return Err(PayloadTooLarge { limit });
        }
        body_bytes.extend_from_slice(&chunk);
    }
    if body_bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    match serde_json::from_slice::<Value>(&body_bytes) {
        Ok(Value::Null) => Ok(None),
        Ok(payload) => Ok(Some(payload)),
        Err(e) => {
            debug!("[REQUEST] JSON parsing error: {e}");
            Ok(None)
        }
    }
}

/// Split `/api/{model}/{method}/` (trailing slash optional) into its parts.
pub fn parse_invoke_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/api/")?;
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    let (model, method) = rest.split_once('/')?;
    if model.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((model, method))
}
