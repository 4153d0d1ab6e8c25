//! HTTP listener for the gateway.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use log::info;

use super::gateway::Gateway;
use super::routes;

/// Serve HTTP on `addr` until `shutdown` completes.
pub async fn serve<F>(addr: SocketAddr, gateway: Arc<Gateway>, shutdown: F) -> Result<(), hyper::Error>
where
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(move |_conn| {
        let gateway = Arc::clone(&gateway);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                routes::handle_request(req, Arc::clone(&gateway))
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!("[GATEWAY] Listening on http://{addr}");
    info!("[GATEWAY]   GET  /health");
    info!("[GATEWAY]   GET  /api/models");
    info!("[GATEWAY]   POST /api/{{model}}/{{method}}/");

    server.with_graceful_shutdown(shutdown).await
}
