//! Out-of-process model workers.
//!
//! Every model runs in its own child process for:
//! - Crash isolation: a model crash doesn't take down the gateway or other models
//! - Parallelism: independent models serve requests at the same time
//! - Recovery: a stuck worker can be killed and restarted on its own

pub mod ipc_types;
pub mod process_manager;
pub mod worker_bridge;
pub mod worker_main;
