//! IPC protocol types for gateway ↔ worker communication.
//!
//! Uses JSON Lines (one JSON object per line) over the worker's stdin/stdout
//! pipes. The exchange is strictly request/response: the gateway never sends
//! request N+1 on a channel before request N's reply has arrived.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request sent from gateway to worker via stdin.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    /// Monotonic request ID for correlating responses.
    pub id: u64,
    pub command: WorkerCommand,
}

/// Commands the gateway can send to the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum WorkerCommand {
    /// Run `preprocess` then `method` on the payload.
    Invoke {
        model: String,
        method: String,
        payload: Value,
    },
    /// Health check.
    Ping,
    /// Graceful shutdown.
    Shutdown,
}

/// Response sent from worker to gateway via stdout.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    /// Matches the request ID. 0 for the startup handshake.
    pub id: u64,
    pub payload: WorkerPayload,
}

/// Response payloads from the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum WorkerPayload {
    /// Resources acquired and model loaded; the worker is serving.
    Ready { model: String, methods: Vec<String> },
    /// Startup failed; the worker exits after sending this.
    StartupFailed { stage: StartupStage, message: String },
    /// Method returned a value.
    Success { result: Value },
    /// The call was refused or model code failed.
    Error { kind: ErrorKind, message: String },
    /// Health check response.
    Pong,
    /// Acknowledges `Shutdown`.
    ShuttingDown,
}

/// Where a worker's startup stopped.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartupStage {
    Config,
    Resources,
    Load,
}

impl std::fmt::Display for StartupStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self {
            StartupStage::Config => "config",
            StartupStage::Resources => "resources",
            StartupStage::Load => "load",
        };
        f.write_str(stage)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Method not in the model's capability table. No model code ran.
    UnknownMethod,
    /// Preprocess or the method raised.
    ModelError,
    /// Request addressed to a model this worker does not serve.
    WrongModel,
    /// Unparseable request line.
    BadFrame,
}

impl WorkerResponse {
    pub fn ok(id: u64, payload: WorkerPayload) -> Self {
        Self { id, payload }
    }

    pub fn error(id: u64, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id,
            payload: WorkerPayload::Error {
                kind,
                message: message.into(),
            },
        }
    }
}
