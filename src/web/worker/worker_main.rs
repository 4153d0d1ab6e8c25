//! Worker process entry point.
//!
//! Runs as a child process spawned by the gateway, one per model. Acquires
//! the model's resources, loads it, reports `Ready`, then reads JSON commands
//! from stdin and writes JSON responses to stdout. All log output goes to
//! stderr (inherited by parent).
//!
//! Thread design:
//! - Thread 0 (stdin reader): reads lines → crossbeam channel
//! - Thread 1 (main loop): one request at a time, writes the reply to stdout

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use log::{error, info, warn};
use serde_json::Value;

use super::ipc_types::*;
use crate::web::config::{DeploymentDescriptor, ServerArgs};
use crate::web::model_loader::{load_model, panic_message, ModelCatalog};
use crate::web::models::ModelInstance;
use crate::web::resources::{blob_store_for, ResourceAcquirer, RetryPolicy};

/// Lifecycle of a worker process. Only forward transitions are legal, and
/// any state may fall to `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    AcquiringResources,
    LoadingModel,
    Serving,
    Terminated,
}

impl WorkerState {
    pub fn can_transition(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Uninitialized, AcquiringResources)
                | (AcquiringResources, LoadingModel)
                | (LoadingModel, Serving)
                | (Uninitialized | AcquiringResources | LoadingModel | Serving, Terminated)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Uninitialized => "UNINITIALIZED",
            WorkerState::AcquiringResources => "ACQUIRING_RESOURCES",
            WorkerState::LoadingModel => "LOADING_MODEL",
            WorkerState::Serving => "SERVING",
            WorkerState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

struct Lifecycle {
    model: String,
    state: WorkerState,
}

impl Lifecycle {
    fn advance(&mut self, next: WorkerState) {
        debug_assert!(self.state.can_transition(next), "{} -> {next}", self.state);
        info!("[WORKER {}] {} -> {next}", self.model, self.state);
        self.state = next;
    }
}

/// Why the serve loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    /// Gateway asked us to stop.
    Shutdown,
    /// stdin closed or stdout broke; the gateway is gone.
    ChannelClosed,
}

/// Run the worker process. Returns the process exit code.
pub fn run_worker(args: &ServerArgs, catalog: &ModelCatalog) -> i32 {
    let model_name = args.model.clone().unwrap_or_default();
    info!(
        "[WORKER {model_name}] Starting model worker process (pid={})",
        std::process::id()
    );

    let mut out = match claim_stdout() {
        Ok(out) => out,
        Err(e) => {
            error!("[WORKER {model_name}] Cannot take over stdout: {e}");
            return 1;
        }
    };
    let mut lifecycle = Lifecycle {
        model: model_name.clone(),
        state: WorkerState::Uninitialized,
    };

    let mut instance = match start_model(args, catalog, &mut lifecycle) {
        Ok(instance) => instance,
        Err((stage, message)) => {
            error!("[WORKER {model_name}] Startup failed at {stage}: {message}");
            let _ = write_response(
                &mut out,
                &WorkerResponse::ok(0, WorkerPayload::StartupFailed { stage, message }),
            );
            lifecycle.advance(WorkerState::Terminated);
            return 1;
        }
    };

    let ready = WorkerResponse::ok(
        0,
        WorkerPayload::Ready {
            model: model_name.clone(),
            methods: instance.capabilities(),
        },
    );
    if let Err(e) = write_response(&mut out, &ready) {
        error!("[WORKER {model_name}] Failed to report readiness: {e}");
        return 1;
    }
    lifecycle.advance(WorkerState::Serving);

    let commands = spawn_line_reader(BufReader::new(io::stdin()));
    let exit = serve(&model_name, instance.as_mut(), &commands, &mut out);
    leave_context(&model_name, instance.as_mut());
    lifecycle.advance(WorkerState::Terminated);

    match exit {
        ServeExit::Shutdown => 0,
        ServeExit::ChannelClosed => {
            warn!("[WORKER {model_name}] Channel closed, exiting");
            1
        }
    }
}

/// Acquire resources and load the model, walking the startup states.
fn start_model(
    args: &ServerArgs,
    catalog: &ModelCatalog,
    lifecycle: &mut Lifecycle,
) -> Result<Box<dyn ModelInstance>, (StartupStage, String)> {
    let descriptor =
        DeploymentDescriptor::load(&args.descriptor).map_err(|e| (StartupStage::Config, e.to_string()))?;
    let config = descriptor.model(&lifecycle.model).ok_or_else(|| {
        (
            StartupStage::Config,
            format!("model '{}' is not in {}", lifecycle.model, args.descriptor.display()),
        )
    })?;

    lifecycle.advance(WorkerState::AcquiringResources);
    let store = blob_store_for(args.blob_endpoint.as_deref());
    let acquirer = ResourceAcquirer::new(
        &args.resource_dir,
        store.as_deref(),
        RetryPolicy::new(args.download_retries),
    );
    let resources = acquirer
        .acquire(&config.name, &config.required_resources)
        .map_err(|e| (StartupStage::Resources, e.to_string()))?;

    lifecycle.advance(WorkerState::LoadingModel);
    let mut instance = load_model(catalog, config, &resources).map_err(|e| (StartupStage::Load, e.to_string()))?;
    enter_context(instance.as_mut()).map_err(|message| (StartupStage::Load, message))?;
    Ok(instance)
}

/// Enter the model's serving context. Errors and panics become a message.
fn enter_context(instance: &mut dyn ModelInstance) -> Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(|| instance.enter())) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("model context failed: {e}")),
        Err(panic_info) => Err(format!("model context failed: {}", panic_message(&*panic_info))),
    }
}

fn leave_context(model_name: &str, instance: &mut dyn ModelInstance) {
    if let Err(panic_info) = panic::catch_unwind(AssertUnwindSafe(|| instance.exit())) {
        warn!(
            "[WORKER {model_name}] Leaving model context panicked: {}",
            panic_message(&*panic_info)
        );
    }
}

/// Serve requests until shutdown or channel loss. Never returns because of a
/// model-level failure.
pub fn serve<W: Write>(
    model_name: &str,
    instance: &mut dyn ModelInstance,
    commands: &Receiver<String>,
    out: &mut W,
) -> ServeExit {
    for line in commands.iter() {
        let request: WorkerRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!("[WORKER {model_name}] Failed to parse command: {e}");
                let response = WorkerResponse::error(0, ErrorKind::BadFrame, format!("Parse error: {e}"));
                if write_response(out, &response).is_err() {
                    return ServeExit::ChannelClosed;
                }
                continue;
            }
        };

        let req_id = request.id;
        let response = match request.command {
            WorkerCommand::Ping => WorkerResponse::ok(req_id, WorkerPayload::Pong),
            WorkerCommand::Shutdown => {
                info!("[WORKER {model_name}] Shutdown requested");
                let _ = write_response(out, &WorkerResponse::ok(req_id, WorkerPayload::ShuttingDown));
                return ServeExit::Shutdown;
            }
            WorkerCommand::Invoke { model, .. } if model != model_name => WorkerResponse::error(
                req_id,
                ErrorKind::WrongModel,
                format!("Worker serves '{model_name}', not '{model}'"),
            ),
            WorkerCommand::Invoke { method, payload, .. } => {
                WorkerResponse::ok(req_id, dispatch(instance, &method, payload))
            }
        };

        if let Err(e) = write_response(out, &response) {
            error!("[WORKER {model_name}] Failed to write response: {e}");
            return ServeExit::ChannelClosed;
        }
    }
    ServeExit::ChannelClosed
}

/// Capability check, then preprocess + method. Errors and panics from model
/// code become structured error payloads.
fn dispatch(instance: &mut dyn ModelInstance, method: &str, payload: Value) -> WorkerPayload {
    if !instance.has_method(method) {
        return WorkerPayload::Error {
            kind: ErrorKind::UnknownMethod,
            message: format!("Model does not have method {method}"),
        };
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let preprocessed = instance.preprocess(payload)?;
        instance.call(method, preprocessed)
    }));
    match outcome {
        Ok(Ok(result)) => WorkerPayload::Success { result },
        Ok(Err(e)) => WorkerPayload::Error {
            kind: ErrorKind::ModelError,
            message: format!("Exception: {e}"),
        },
        Err(panic_info) => WorkerPayload::Error {
            kind: ErrorKind::ModelError,
            message: format!("Exception: {}", panic_message(&*panic_info)),
        },
    }
}

/// Forward non-empty lines from `reader` into a channel on a dedicated thread.
pub fn spawn_line_reader<R: BufRead + Send + 'static>(reader: R) -> Receiver<String> {
    let (tx, rx): (Sender<String>, Receiver<String>) = crossbeam_channel::unbounded();
    thread::spawn(move || {
        for line in reader.lines() {
            match line {
                Ok(l) if !l.trim().is_empty() => {
                    if tx.send(l).is_err() {
                        break; // Main loop exited
                    }
                }
                Ok(_) => {}      // Empty line, skip
                Err(_) => break, // stdin closed (parent died)
            }
        }
    });
    rx
}

/// Write a JSON response line, flushing immediately.
pub fn write_response<W: Write>(out: &mut W, response: &WorkerResponse) -> io::Result<()> {
    let json = serde_json::to_string(response).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    writeln!(out, "{json}")?;
    out.flush()
}

/// Take ownership of the real stdout for the channel and point fd 1 at
/// stderr, so stray prints from model code cannot corrupt the protocol.
#[cfg(unix)]
fn claim_stdout() -> io::Result<Box<dyn Write + Send>> {
    use std::os::unix::io::FromRawFd;

    io::stdout().flush()?;
    // SAFETY: plain fd duplication; the new fd is owned by the returned File.
    let channel_fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if channel_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both fds are open for the life of the process.
    if unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: channel_fd was just returned by dup and is not owned elsewhere.
    let file = unsafe { File::from_raw_fd(channel_fd) };
    Ok(Box::new(file))
}

#[cfg(not(unix))]
fn claim_stdout() -> io::Result<Box<dyn Write + Send>> {
    Ok(Box::new(io::stdout()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::builtin_models;
    use crate::web::models::{instance, MethodTable, ModelError, ServableModel};
    use crate::web::resources::ResolvedResources;
    use serde_json::json;

    struct Fragile;

    impl Fragile {
        fn explode(&mut self, _payload: Value) -> Result<Value, ModelError> {
            panic!("index out of range")
        }

        fn ok(&mut self, _payload: Value) -> Result<Value, ModelError> {
            Ok(json!("fine"))
        }
    }

    impl ServableModel for Fragile {
        fn methods() -> MethodTable<Self> {
            MethodTable::new()
                .with("explode", Self::explode)
                .with("ok", Self::ok)
        }
    }

    /// Preprocess must never run for an unknown method.
    struct Tripwire;

    impl ServableModel for Tripwire {
        fn preprocess(&mut self, _payload: Value) -> Result<Value, ModelError> {
            panic!("preprocess called")
        }

        fn methods() -> MethodTable<Self> {
            MethodTable::new()
        }
    }

    fn invoke(id: u64, model: &str, method: &str, payload: Value) -> String {
        serde_json::to_string(&WorkerRequest {
            id,
            command: WorkerCommand::Invoke {
                model: model.to_string(),
                method: method.to_string(),
                payload,
            },
        })
        .unwrap()
    }

    fn run(model_name: &str, model: &mut dyn ModelInstance, lines: Vec<String>) -> (ServeExit, Vec<WorkerResponse>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        for line in lines {
            tx.send(line).unwrap();
        }
        drop(tx);
        let mut out = Vec::new();
        let exit = serve(model_name, model, &rx, &mut out);
        let responses = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        (exit, responses)
    }

    #[test]
    fn test_state_transitions() {
        use WorkerState::*;
        assert!(Uninitialized.can_transition(AcquiringResources));
        assert!(AcquiringResources.can_transition(LoadingModel));
        assert!(LoadingModel.can_transition(Serving));
        assert!(AcquiringResources.can_transition(Terminated));
        assert!(Serving.can_transition(Terminated));
        assert!(!Uninitialized.can_transition(Serving));
        assert!(!AcquiringResources.can_transition(Serving));
        assert!(!Terminated.can_transition(Serving));
    }

    #[test]
    fn test_serve_predict() {
        let mut model = instance(builtin_models::TestModel::new(&ResolvedResources::new()));
        let (exit, responses) = run(
            "TestModel",
            model.as_mut(),
            vec![invoke(1, "TestModel", "predict", json!({"data": {"number": 41}}))],
        );

        assert_eq!(exit, ServeExit::ChannelClosed);
        assert_eq!(
            responses,
            vec![WorkerResponse::ok(
                1,
                WorkerPayload::Success {
                    result: json!({"status": "success", "number": 42, "parameters": null})
                }
            )]
        );
    }

    #[test]
    fn test_unknown_method_short_circuits() {
        let mut model = instance(Tripwire);
        let (_, responses) = run("Tripwire", model.as_mut(), vec![invoke(5, "Tripwire", "predict", json!({}))]);
        assert_eq!(
            responses,
            vec![WorkerResponse::error(
                5,
                ErrorKind::UnknownMethod,
                "Model does not have method predict"
            )]
        );
    }

    #[test]
    fn test_worker_survives_model_failures() {
        let mut model = instance(Fragile);
        let (exit, responses) = run(
            "Fragile",
            model.as_mut(),
            vec![
                invoke(1, "Fragile", "explode", json!({})),
                invoke(2, "Fragile", "ok", json!({})),
            ],
        );

        assert_eq!(exit, ServeExit::ChannelClosed);
        assert_eq!(responses.len(), 2);
        assert_eq!(
            responses[0],
            WorkerResponse::error(1, ErrorKind::ModelError, "Exception: index out of range")
        );
        assert_eq!(
            responses[1],
            WorkerResponse::ok(2, WorkerPayload::Success { result: json!("fine") })
        );
    }

    #[test]
    fn test_model_error_from_preprocess() {
        let mut model = instance(builtin_models::TestModel::new(&ResolvedResources::new()));
        let (_, responses) = run(
            "TestModel",
            model.as_mut(),
            vec![invoke(9, "TestModel", "predict", json!({"data": "nope"}))],
        );
        assert_eq!(
            responses,
            vec![WorkerResponse::error(
                9,
                ErrorKind::ModelError,
                "Exception: 'data.number' is required"
            )]
        );
    }

    #[test]
    fn test_ping_bad_frame_and_shutdown() {
        let mut model = instance(builtin_models::Echo);
        let ping = serde_json::to_string(&WorkerRequest { id: 1, command: WorkerCommand::Ping }).unwrap();
        let shutdown = serde_json::to_string(&WorkerRequest { id: 2, command: WorkerCommand::Shutdown }).unwrap();
        let (exit, responses) = run(
            "Echo",
            model.as_mut(),
            vec![ping, "{not json".to_string(), shutdown, invoke(3, "Echo", "echo", json!(1))],
        );

        assert_eq!(exit, ServeExit::Shutdown);
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0], WorkerResponse::ok(1, WorkerPayload::Pong));
        assert!(matches!(
            responses[1].payload,
            WorkerPayload::Error { kind: ErrorKind::BadFrame, .. }
        ));
        assert_eq!(responses[2], WorkerResponse::ok(2, WorkerPayload::ShuttingDown));
    }

    #[test]
    fn test_request_for_other_model_is_refused() {
        let mut model = instance(builtin_models::Echo);
        let (_, responses) = run("Echo", model.as_mut(), vec![invoke(4, "TestModel", "echo", json!(1))]);
        assert!(matches!(
            responses[0].payload,
            WorkerPayload::Error { kind: ErrorKind::WrongModel, .. }
        ));
    }

    struct NoDevice;

    impl ServableModel for NoDevice {
        fn enter(&mut self) -> Result<(), ModelError> {
            Err(ModelError::new("device 3 not present"))
        }

        fn methods() -> MethodTable<Self> {
            MethodTable::new()
        }
    }

    struct BadContext;

    impl ServableModel for BadContext {
        fn enter(&mut self) -> Result<(), ModelError> {
            panic!("context setup crashed")
        }

        fn methods() -> MethodTable<Self> {
            MethodTable::new()
        }
    }

    #[test]
    fn test_enter_context_reports_failures() {
        assert!(enter_context(instance(builtin_models::Echo).as_mut()).is_ok());
        assert_eq!(
            enter_context(instance(NoDevice).as_mut()).unwrap_err(),
            "model context failed: device 3 not present"
        );
        assert_eq!(
            enter_context(instance(BadContext).as_mut()).unwrap_err(),
            "model context failed: context setup crashed"
        );
    }

    #[test]
    fn test_context_failure_is_a_load_stage_failure() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = dir.path().join("pressurize.json");
        std::fs::write(&descriptor, r#"{"models":[{"name":"Gpu","path":"Gpu.NoDevice"}]}"#).unwrap();
        let descriptor = descriptor.display().to_string();
        let args = <ServerArgs as clap::Parser>::parse_from([
            "pressurize",
            "--worker",
            "--model",
            "Gpu",
            "--descriptor",
            &descriptor,
        ]);
        let catalog = ModelCatalog::new().register("Gpu.NoDevice", |_| Ok(instance(NoDevice)));
        let mut lifecycle = Lifecycle {
            model: "Gpu".to_string(),
            state: WorkerState::Uninitialized,
        };

        let (stage, message) = start_model(&args, &catalog, &mut lifecycle).unwrap_err();
        assert_eq!(stage, StartupStage::Load);
        assert!(message.contains("device 3 not present"));
        assert_eq!(lifecycle.state, WorkerState::LoadingModel);
    }

    #[test]
    fn test_line_reader_skips_blank_lines() {
        let rx = spawn_line_reader(io::Cursor::new(b"a\n\n  \nb\n".to_vec()));
        let lines: Vec<String> = rx.iter().collect();
        assert_eq!(lines, vec!["a", "b"]);
    }
}
