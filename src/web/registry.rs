//! The models that came up at startup, keyed by name.
//!
//! Built once before the HTTP server starts and handed to the gateway by
//! reference. A model whose worker failed to start is simply absent.

use std::collections::BTreeMap;
use std::path::Path;

use futures_util::future::join_all;
use log::{error, info};

use super::config::{DeploymentDescriptor, ServerArgs};
use super::worker::process_manager::WorkerCommandLine;
use super::worker::worker_bridge::{BridgeSettings, SharedWorkerBridge, WorkerBridge};

#[derive(Debug, Default)]
pub struct Registry {
    bridges: BTreeMap<String, SharedWorkerBridge>,
}

impl Registry {
    /// Start one worker per descriptor entry, all in parallel, and keep the
    /// ones that report ready. `program` is the binary to run in worker mode.
    pub async fn start(descriptor: &DeploymentDescriptor, program: &Path, args: &ServerArgs) -> Self {
        let settings = BridgeSettings {
            request_timeout: args.request_timeout(),
            startup_timeout: args.startup_timeout(),
            max_restarts: args.max_restarts,
        };

        let startups = descriptor.models.iter().map(|config| {
            let command = WorkerCommandLine {
                program: program.to_path_buf(),
                args: args.worker_args(&config.name),
            };
            let name = config.name.clone();
            async move {
                let outcome = WorkerBridge::spawn(&name, command, settings).await;
                (name, outcome)
            }
        });

        let mut bridges = BTreeMap::new();
        for (name, outcome) in join_all(startups).await {
            match outcome {
                Ok(bridge) => {
                    bridges.insert(name, bridge);
                }
                Err(e) => error!("[REGISTRY] Model '{name}' failed to start: {e}"),
            }
        }
        info!(
            "[REGISTRY] {} of {} model(s) serving",
            bridges.len(),
            descriptor.models.len()
        );
        Self { bridges }
    }

    /// Registry over bridges that are already connected.
    pub fn from_bridges(bridges: impl IntoIterator<Item = SharedWorkerBridge>) -> Self {
        Self {
            bridges: bridges
                .into_iter()
                .map(|b| (b.model().to_string(), b))
                .collect(),
        }
    }

    pub fn get(&self, model: &str) -> Option<&SharedWorkerBridge> {
        self.bridges.get(model)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bridges.keys().map(String::as_str)
    }

    pub fn bridges(&self) -> impl Iterator<Item = &SharedWorkerBridge> {
        self.bridges.values()
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    /// Ask every worker to exit.
    pub async fn shutdown_all(&self) {
        info!("[REGISTRY] Shutting down {} worker(s)", self.bridges.len());
        join_all(self.bridges.values().map(|b| b.shutdown())).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::web::builtin_models;
    use crate::web::models::instance;
    use crate::web::worker::worker_bridge::tests::{in_process_worker, settings};
    use crate::web::worker::worker_bridge::WorkerHealth;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lookup_by_model_name() {
        let echo = in_process_worker("Echo", instance(builtin_models::Echo), settings(Duration::from_secs(5))).await;
        let registry = Registry::from_bridges(vec![echo]);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["Echo"]);
        assert!(registry.get("Echo").is_some());
        assert!(registry.get("Ghost").is_none());
    }

    #[tokio::test]
    async fn test_failed_startup_leaves_model_out() {
        let descriptor = DeploymentDescriptor::from_json(r#"{"models":[{"name":"Broken","path":"Broken.Broken"}]}"#).unwrap();
        let args = <ServerArgs as clap::Parser>::parse_from(["pressurize", "--startup-timeout-secs", "5"]);

        // `false` exits immediately without a handshake.
        let registry = Registry::start(&descriptor, Path::new("false"), &args).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let echo = in_process_worker("Echo", instance(builtin_models::Echo), settings(Duration::from_secs(5))).await;
        let registry = Registry::from_bridges(vec![echo]);
        registry.shutdown_all().await;
        assert_eq!(registry.get("Echo").unwrap().health(), WorkerHealth::Terminated);
    }
}
