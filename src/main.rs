use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use pressurize::web::builtin_models;
use pressurize::web::config::{DeploymentDescriptor, ServerArgs};
use pressurize::web::gateway::Gateway;
use pressurize::web::logger::setup_logging;
use pressurize::web::registry::Registry;
use pressurize::web::server;
use pressurize::web::worker::worker_main::run_worker;

fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    if let Err(e) = setup_logging(&args.log_level, args.log_file.as_deref()) {
        eprintln!("Failed to set up logging: {e}");
    }

    // Worker mode: no tokio runtime, the worker is a plain blocking loop.
    if args.worker {
        std::process::exit(run_worker(&args, &builtin_models::catalog()));
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start the async runtime")?;
    runtime.block_on(run_gateway(args))
}

async fn run_gateway(args: ServerArgs) -> anyhow::Result<()> {
    let descriptor = DeploymentDescriptor::load(&args.descriptor)
        .with_context(|| format!("failed to load {}", args.descriptor.display()))?;
    let program = std::env::current_exe().context("cannot locate the pressurize binary")?;

    info!(
        "[GATEWAY] Starting {} model worker(s) from {}",
        descriptor.models.len(),
        args.descriptor.display()
    );
    let registry = Registry::start(&descriptor, &program, &args).await;
    if registry.is_empty() && !descriptor.models.is_empty() {
        error!("[GATEWAY] No model came up; serving 404 for every model");
    }
    let gateway = Arc::new(Gateway::new(registry).with_body_limit(args.max_body_bytes));

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("[GATEWAY] Shutdown signal received");
    };
    server::serve(args.bind_addr(), Arc::clone(&gateway), shutdown)
        .await
        .context("HTTP server failed")?;

    gateway.registry().shutdown_all().await;
    info!("[GATEWAY] Stopped");
    Ok(())
}
