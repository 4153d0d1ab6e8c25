// Gateway, worker and model plumbing

pub mod builtin_models;
pub mod config;
pub mod gateway;
pub mod logger;
pub mod model_loader;
pub mod models;
pub mod registry;
pub mod request_parsing;
pub mod resources;
pub mod response_helpers;
pub mod routes;
pub mod server;
pub mod worker;
