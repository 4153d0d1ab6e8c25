// Route handler modules

pub mod health;
pub mod models;
pub mod predict;

use std::convert::Infallible;
use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};

use crate::web::gateway::Gateway;
use crate::web::request_parsing::parse_invoke_path;
use crate::web::response_helpers::{cors_preflight, json_error};

/// Route one request.
pub async fn handle_request(req: Request<Body>, gateway: Arc<Gateway>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (&method, path.as_str()) {
        (&Method::OPTIONS, _) => Ok(cors_preflight()),
        (&Method::GET, "/health") => health::handle().await,
        (&Method::GET, "/api/models") => models::handle_list(gateway).await,
        (_, "/health" | "/api/models") => Ok(method_not_allowed()),
        (verb, p) => match parse_invoke_path(p) {
            Some((model, model_method)) if verb == Method::POST => {
                predict::handle_invoke(req, gateway, model, model_method).await
            }
            Some(_) => Ok(method_not_allowed()),
            None => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
        },
    }
}

fn method_not_allowed() -> Response<Body> {
    json_error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::web::builtin_models::{Echo, TestModel};
    use crate::web::models::instance;
    use crate::web::registry::Registry;
    use crate::web::resources::ResolvedResources;
    use crate::web::worker::worker_bridge::tests::{in_process_worker, settings};
    use serde_json::{json, Value};
    use std::time::Duration;

    async fn gateway() -> Arc<Gateway> {
        let test_model = in_process_worker(
            "TestModel",
            instance(TestModel::new(&ResolvedResources::new())),
            settings(Duration::from_secs(5)),
        )
        .await;
        let echo = in_process_worker("Echo", instance(Echo), settings(Duration::from_secs(5))).await;
        Arc::new(Gateway::new(Registry::from_bridges(vec![test_model, echo])))
    }

    async fn call(gateway: &Arc<Gateway>, method: Method, uri: &str, body: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = handle_request(req, Arc::clone(gateway)).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_predict_route() {
        let gateway = gateway().await;
        let (status, body) = call(
            &gateway,
            Method::POST,
            "/api/TestModel/predict/",
            r#"{"data": {"number": 41}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"result": {"status": "success", "number": 42, "parameters": null}})
        );
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let gateway = gateway().await;

        let (status, body) = call(&gateway, Method::POST, "/api/Ghost/predict/", "not json").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "Model does not exist"}));

        let (status, body) = call(&gateway, Method::POST, "/api/Echo/echo/", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "Data not provided"}));

        let (status, body) = call(&gateway, Method::POST, "/api/Echo/train/", "{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "Model does not have method train"}));

        let (status, _) = call(&gateway, Method::GET, "/api/Echo/echo/", "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        let (status, body) = call(&gateway, Method::GET, "/nowhere", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "Not found"}));
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let echo = in_process_worker("Echo", instance(Echo), settings(Duration::from_secs(5))).await;
        let gateway = Arc::new(Gateway::new(Registry::from_bridges(vec![echo])).with_body_limit(32));
        let big = json!({"data": "y".repeat(64)}).to_string();

        let (status, body) = call(&gateway, Method::POST, "/api/Echo/echo/", &big).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body, json!({"error": "Payload too large"}));

        let (status, body) = call(&gateway, Method::POST, "/api/Ghost/echo/", &big).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "Model does not exist"}));

        let (status, body) = call(&gateway, Method::POST, "/api/Echo/echo/", r#"{"data": 1}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], json!({"data": 1}));
    }

    #[tokio::test]
    async fn test_health_models_and_preflight() {
        let gateway = gateway().await;

        let (status, body) = call(&gateway, Method::GET, "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok", "service": "pressurize"}));

        let (status, body) = call(&gateway, Method::GET, "/api/models", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"models": [
                {"name": "Echo", "methods": ["echo"], "state": "serving", "restarts": 0},
                {"name": "TestModel", "methods": ["fail", "predict"], "state": "serving", "restarts": 0},
            ]})
        );

        let (status, body) = call(&gateway, Method::OPTIONS, "/api/TestModel/predict/", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Null);
    }
}
